//! BOSH director access
//!
//! [`Director`] is the seam between scenarios and the director API. The
//! production implementation is [`HttpDirector`]; unit tests substitute an
//! in-memory fake.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpDirector;

pub const VM_NOT_PRESENT_MSG: &str = "No VM exists with name";

/// Error variants are named by what failed, not where
#[derive(Error, Debug)]
pub enum DirectorError {
    #[error("Director request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Director returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid director URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Director response decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Task {id} finished in state '{state}': {result}")]
    TaskFailed {
        id: u64,
        state: String,
        result: String,
    },

    #[error("Timeout waiting for task {0}")]
    TaskTimeout(u64),

    #[error("Missing task redirect in director response")]
    MissingTask,

    #[error("{msg} {0}", msg = VM_NOT_PRESENT_MSG)]
    VmNotFound(String),

    #[error("Process {process} not found on VM {vm}")]
    ProcessNotFound { process: String, vm: String },
}

pub type Result<T, E = DirectorError> = std::result::Result<T, E>;

/// Target state of a job change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Started,
    Stopped,
    Restarted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Started => "started",
            JobState::Stopped => "stopped",
            JobState::Restarted => "restarted",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored process on a VM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessInfo {
    pub name: String,
    pub state: String,
}

impl ProcessInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// One VM of a deployment as reported by `vms?format=full`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmInfo {
    pub agent_id: String,
    pub job_name: String,
    pub index: Option<u32>,
    pub id: String,
    pub ips: Vec<String>,
    pub dns: Vec<String>,
    pub process_state: String,
    pub processes: Vec<ProcessInfo>,
    pub resurrection_paused: bool,
    pub vm_cid: String,
}

impl VmInfo {
    pub fn is_running(&self) -> bool {
        self.process_state == "running"
    }

    pub fn process(&self, name: &str) -> Option<&ProcessInfo> {
        self.processes.iter().find(|p| p.name == name)
    }
}

/// One line of a deployment diff and its change marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub text: String,
    /// `added`, `removed` or empty
    pub state: String,
}

impl std::fmt::Display for DiffLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.as_str() {
            "added" => write!(f, "+ {}", self.text),
            "removed" => write!(f, "- {}", self.text),
            _ => write!(f, "  {}", self.text),
        }
    }
}

/// Release download URL on bosh.io; `None` means the latest version
pub fn release_url(organization: &str, repo: &str, version: Option<u32>) -> String {
    match version {
        Some(v) => format!(
            "https://bosh.io/d/github.com/{}/{}?v={}",
            organization, repo, v
        ),
        None => format!("https://bosh.io/d/github.com/{}/{}", organization, repo),
    }
}

/// Director operations used by the scenarios
#[async_trait]
pub trait Director: Send + Sync {
    /// Create or update the deployment described by `manifest`
    async fn update_deployment(&self, manifest: &str) -> Result<()>;

    /// Force-delete a deployment
    async fn delete_deployment(&self, name: &str) -> Result<()>;

    async fn vm_infos(&self, deployment: &str) -> Result<Vec<VmInfo>>;

    /// Change the state of every instance of an instance group
    async fn change_job_state(&self, deployment: &str, job: &str, state: JobState) -> Result<()>;

    async fn set_resurrection(
        &self,
        deployment: &str,
        job: &str,
        instance_id: &str,
        enabled: bool,
    ) -> Result<()>;

    async fn upload_release_url(&self, url: &str) -> Result<()>;

    /// Changes `manifest` would make to the deployment
    async fn diff(&self, deployment: &str, manifest: &str) -> Result<Vec<DiffLine>>;

    /// Upload a tagged release of `organization/repo` from bosh.io
    async fn upload_release_from_url(
        &self,
        organization: &str,
        repo: &str,
        version: u32,
    ) -> Result<()> {
        self.upload_release_url(&release_url(organization, repo, Some(version)))
            .await
    }

    /// Upload the newest release of `organization/repo` from bosh.io
    async fn upload_latest_release_from_url(&self, organization: &str, repo: &str) -> Result<()> {
        self.upload_release_url(&release_url(organization, repo, None))
            .await
    }

    async fn upload_postgres_release(&self, version: u32) -> Result<()> {
        self.upload_release_from_url("cloudfoundry", "postgres-release", version)
            .await
    }
}
