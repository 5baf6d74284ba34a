//! Scenario-facing deployment driver
//!
//! [`DeployHelper`] owns the template path, the scalar variables and the op
//! list of one scenario, and runs deploys through the bootstrap state
//! machine.

pub mod state_machine;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::{Mapping, Value};

pub use state_machine::{
    BootstrapContext, BootstrapEvent, BootstrapPhase, BootstrapStateMachine, TransitionResult,
};

use crate::config::PgatsConfig;
use crate::deployment::{DeploymentData, POSTGRES_INSTANCE_GROUP, prepare_manifest};
use crate::director::Director;
use crate::error::{Error, Result};
use crate::manifest::{EvaluateOptions, ManifestError, OpDefinition, ops};
use crate::postgres::{PgCommon, PgData, User};
use crate::properties::Properties;
use crate::utils;

/// Host templated in before the VM exists
pub const PLACEHOLDER_HOST: &str = "1.1.1.1";

pub const DEFAULT_MANIFEST_PATH: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/templates/postgres_simple.yml");

pub struct DeployHelper {
    director: Arc<dyn Director>,
    config: PgatsConfig,
    name: String,
    manifest_path: PathBuf,
    /// Release to deploy; `None` deploys the configured version
    pg_version: Option<u32>,
    variables: Mapping,
    op_defs: Vec<OpDefinition>,
    print_diffs: bool,
    network_name: String,
    deployment: Option<DeploymentData>,
    state_machine: BootstrapStateMachine,
}

impl DeployHelper {
    pub fn new(
        config: &PgatsConfig,
        director: Arc<dyn Director>,
        prefix: &str,
        pg_version: Option<u32>,
    ) -> Self {
        let mut helper = Self {
            director,
            config: config.clone(),
            name: String::new(),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST_PATH),
            pg_version,
            variables: Mapping::new(),
            op_defs: Vec::new(),
            print_diffs: false,
            network_name: config.cloud_config.primary_network().to_string(),
            deployment: None,
            state_machine: BootstrapStateMachine::new(),
        };
        helper.set_deployment_name(prefix);
        helper.initialize_variables();
        helper
    }

    /// Pick a fresh random deployment name
    pub fn set_deployment_name(&mut self, prefix: &str) {
        self.name = utils::generate_env_name(prefix);
    }

    pub fn enable_print_diffs(&mut self) {
        self.print_diffs = true;
    }

    pub fn set_pg_version(&mut self, version: Option<u32>) {
        self.pg_version = version;
    }

    pub fn set_manifest_path(&mut self, path: impl Into<PathBuf>) {
        self.manifest_path = path.into();
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Reset the scalar variables to the scenario defaults
    pub fn initialize_variables(&mut self) {
        let defaults = [
            ("defuser_name", "pgadmin".to_string()),
            ("defuser_password", "adm$in!".to_string()),
            ("certs_matching_certs", ops::MATCHING_CERTS.to_string()),
            ("certs_matching_name", "certuser_matching_name".to_string()),
            ("certs_mapped_certs", "certuser_mapped_certs".to_string()),
            ("certs_mapped_name", "certuser_mapped_name".to_string()),
            ("certs_mapped_cn", "certuser mapped cn".to_string()),
            ("certs_wrong_certs", "certuser_wrong_certs".to_string()),
            ("certs_wrong_cn", "certuser_wrong_cn".to_string()),
            ("certs_bad_ca", "bad_ca".to_string()),
            ("superuser_name", "superuser".to_string()),
            ("superuser_password", "superpsw".to_string()),
            ("testuser_name", "sshuser".to_string()),
            (
                "postgres_dns",
                format!("q-s0.postgres.{}.{}.bosh", self.network_name, self.name),
            ),
        ];
        self.variables = defaults
            .into_iter()
            .map(|(k, v)| (Value::from(k), Value::from(v)))
            .collect();
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    fn variable_str(&self, name: &str) -> &str {
        self.variable(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn set_op_defs(&mut self, op_defs: Vec<OpDefinition>) {
        self.op_defs = op_defs;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PgatsConfig {
        &self.config
    }

    pub fn director(&self) -> &Arc<dyn Director> {
        &self.director
    }

    /// The deployment, once [`DeployHelper::deploy`] has prepared it
    pub fn deployment(&self) -> Result<&DeploymentData> {
        self.deployment.as_ref().ok_or_else(|| self.not_prepared())
    }

    pub fn deployment_mut(&mut self) -> Result<&mut DeploymentData> {
        let err = self.not_prepared();
        self.deployment.as_mut().ok_or(err)
    }

    fn not_prepared(&self) -> Error {
        Error::BootstrapError(format!("deployment {} has not been prepared", self.name))
    }

    pub async fn upload_latest_release_from_url(&self, organization: &str, repo: &str) -> Result<()> {
        self.director
            .upload_latest_release_from_url(organization, repo)
            .await?;
        Ok(())
    }

    /// Load the template into the deployment, keeping generated variables
    fn load_template(&mut self, releases: &BTreeMap<String, String>) -> Result<()> {
        let manifest = prepare_manifest(&self.config, &self.manifest_path, &self.name, releases)?;
        match self.deployment.as_mut() {
            Some(deployment) => deployment.set_manifest(manifest)?,
            None => {
                self.deployment = Some(DeploymentData::new(self.director.clone(), manifest)?);
            }
        }
        Ok(())
    }

    async fn run_deploy(&self) -> Result<()> {
        let deployment = self.deployment()?;
        if self.print_diffs {
            deployment.print_diffs().await.map_err(|e| {
                Error::BootstrapError(format!("error printing diffs: {}", e))
            })?;
        }
        deployment.create_or_update().await
    }

    fn advance(
        &self,
        current: BootstrapPhase,
        event: BootstrapEvent,
        ctx: &BootstrapContext,
    ) -> Result<BootstrapPhase> {
        match self.state_machine.transition(&current, event, ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                tracing::info!(
                    deployment = %self.name,
                    from = %from,
                    to = %to,
                    event = %event,
                    "{}",
                    description
                );
                Ok(to)
            }
            TransitionResult::InvalidTransition { current, event } => Err(Error::BootstrapError(
                format!("invalid event {} in phase {}", event, current),
            )),
            TransitionResult::GuardFailed { reason, .. } => Err(Error::BootstrapError(reason)),
        }
    }

    fn evaluate(&mut self, vars: &Mapping) -> Result<()> {
        let ops = self.op_defs.clone();
        self.deployment_mut()?
            .evaluate_template(vars, &ops, EvaluateOptions::default())
    }

    /// Deploy the scenario, bootstrapping the postgres host when needed
    pub async fn deploy(&mut self) -> Result<BootstrapPhase> {
        let mut releases = BTreeMap::new();
        if let Some(version) = self.pg_version {
            releases.insert("postgres".to_string(), version.to_string());
            self.director.upload_postgres_release(version).await?;
        }
        self.load_template(&releases)?;

        let mut vars = self.variables.clone();
        let mut ctx = BootstrapContext::new(self.deployment()?.contains_variables());
        let mut phase = BootstrapPhase::Bootstrapping;

        if ctx.has_variables {
            if self
                .deployment()?
                .vm_address(POSTGRES_INSTANCE_GROUP)
                .await
                .is_err()
            {
                vars.insert("postgres_host".into(), PLACEHOLDER_HOST.into());
                self.evaluate(&vars)?;
                self.run_deploy().await?;
                phase = self.advance(phase, BootstrapEvent::PlaceholderDeployed, &ctx)?;
            }

            let host = self.deployment()?.vm_host(POSTGRES_INSTANCE_GROUP).await?;
            vars.insert("postgres_host".into(), host.clone().into());
            ctx.host = Some(host);
            phase = self.advance(phase, BootstrapEvent::AddressResolved, &ctx)?;

            self.load_template(&releases)?;
        }

        self.evaluate(&vars)?;
        self.run_deploy().await?;
        self.advance(phase, BootstrapEvent::FinalDeployed, &ctx)
    }

    /// Properties of the first `postgres` job
    pub fn postgres_job_props(&self) -> Result<Properties> {
        Ok(self
            .deployment()?
            .jobs_properties()
            .first_job_properties(POSTGRES_INSTANCE_GROUP)?)
    }

    pub async fn pg_props_and_host(&self) -> Result<(Properties, String)> {
        let props = self.postgres_job_props()?;
        let host = self.deployment()?.vm_host(POSTGRES_INSTANCE_GROUP).await?;
        Ok((props, host))
    }

    /// Write the generated `sshkey` private key to a 0600 temp file
    pub fn write_ssh_key(&self) -> Result<PathBuf> {
        let key = self
            .deployment()?
            .get_variable("sshkey")
            .and_then(|v| v.get("private_key"))
            .and_then(Value::as_str)
            .ok_or_else(|| ManifestError::MissingVariables(vec!["sshkey".to_string()]))?;
        let path = utils::write_file(key)?;
        utils::set_permissions(&path, 0o600)?;
        Ok(path)
    }

    /// Connect as the default user, with the superuser available for admin work
    pub async fn connect_to_postgres(&self, host: &str, props: &Properties) -> Result<PgData> {
        let common = PgCommon {
            address: host.to_string(),
            port: props.databases.port,
            def_user: User::new(
                self.variable_str("defuser_name"),
                self.variable_str("defuser_password"),
            ),
            admin_user: User::new(
                self.variable_str("superuser_name"),
                self.variable_str("superuser_password"),
            ),
            ..PgCommon::default()
        };
        Ok(PgData::new(common).await?)
    }
}
