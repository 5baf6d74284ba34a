//! Bootstrap protocol for deployments that reference their own address
//!
//! A manifest whose variables mention `postgres_host` cannot be rendered
//! before the VM exists. The deploy is therefore split into phases: deploy
//! with a placeholder host, resolve the real address, then deploy the final
//! manifest.

use std::fmt;

/// Where a deploy is in the bootstrap protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapPhase {
    /// The postgres VM address is not known yet
    Bootstrapping,
    /// The address has been resolved and can be templated in
    AddressKnown,
    /// The final manifest has been deployed
    Finalized,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapPhase::Bootstrapping => write!(f, "Bootstrapping"),
            BootstrapPhase::AddressKnown => write!(f, "AddressKnown"),
            BootstrapPhase::Finalized => write!(f, "Finalized"),
        }
    }
}

/// Events that move a deploy between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapEvent {
    /// A manifest rendered with the placeholder host was deployed
    PlaceholderDeployed,
    /// The director reported an address for the postgres VM
    AddressResolved,
    /// The fully rendered manifest was deployed
    FinalDeployed,
}

impl fmt::Display for BootstrapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapEvent::PlaceholderDeployed => write!(f, "PlaceholderDeployed"),
            BootstrapEvent::AddressResolved => write!(f, "AddressResolved"),
            BootstrapEvent::FinalDeployed => write!(f, "FinalDeployed"),
        }
    }
}

/// Facts the guards look at
#[derive(Debug, Clone, Default)]
pub struct BootstrapContext {
    /// Resolved postgres host, DNS name or IP
    pub host: Option<String>,
    /// Whether the manifest declares variables that may need the host
    pub has_variables: bool,
}

impl BootstrapContext {
    pub fn new(has_variables: bool) -> Self {
        Self {
            host: None,
            has_variables,
        }
    }
}

#[derive(Debug)]
pub struct Transition {
    pub from: BootstrapPhase,
    pub to: BootstrapPhase,
    pub event: BootstrapEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: BootstrapPhase,
        to: BootstrapPhase,
        event: BootstrapEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: BootstrapPhase,
        to: BootstrapPhase,
        event: BootstrapEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: BootstrapPhase,
        event: BootstrapEvent,
    },
    GuardFailed {
        from: BootstrapPhase,
        to: BootstrapPhase,
        event: BootstrapEvent,
        reason: String,
    },
}

pub struct BootstrapStateMachine {
    transitions: Vec<Transition>,
}

impl Default for BootstrapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                Transition::new(
                    BootstrapPhase::Bootstrapping,
                    BootstrapPhase::Bootstrapping,
                    BootstrapEvent::PlaceholderDeployed,
                    "Deployed with placeholder host, VM now exists",
                ),
                Transition::new(
                    BootstrapPhase::Bootstrapping,
                    BootstrapPhase::AddressKnown,
                    BootstrapEvent::AddressResolved,
                    "Postgres host resolved",
                ),
                Transition::new(
                    BootstrapPhase::Bootstrapping,
                    BootstrapPhase::Finalized,
                    BootstrapEvent::FinalDeployed,
                    "Deployed a manifest that needs no host",
                ),
                Transition::new(
                    BootstrapPhase::AddressKnown,
                    BootstrapPhase::Finalized,
                    BootstrapEvent::FinalDeployed,
                    "Deployed with the real host",
                ),
            ],
        }
    }

    pub fn transition(
        &self,
        current: &BootstrapPhase,
        event: BootstrapEvent,
        ctx: &BootstrapContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &BootstrapPhase, event: &BootstrapEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    pub fn valid_events(&self, state: &BootstrapPhase) -> Vec<&BootstrapEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &BootstrapContext) -> Option<String> {
        match (&transition.from, &transition.to, &transition.event) {
            (_, BootstrapPhase::AddressKnown, BootstrapEvent::AddressResolved) => {
                match ctx.host.as_deref() {
                    Some(host) if !host.is_empty() => None,
                    _ => Some("No postgres host has been resolved".to_string()),
                }
            }
            // Skipping address resolution is only sound without variables
            (BootstrapPhase::Bootstrapping, BootstrapPhase::Finalized, _) => {
                if ctx.has_variables {
                    Some("Manifest declares variables but the host was never resolved".to_string())
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
