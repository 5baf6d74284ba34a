//! A deployment and the director operations scoped to it
//!
//! [`DeploymentData`] holds the prepared manifest template, the evaluated
//! manifest that is actually sent to the director, and the store of
//! generated variables. The store outlives template reloads so certificates
//! and keys stay stable across the bootstrap passes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use serde_yaml::{Mapping, Value};

use crate::config::PgatsConfig;
use crate::director::{DiffLine, Director, DirectorError, JobState, VmInfo};
use crate::error::Result;
use crate::manifest::{EvaluateOptions, Manifest, OpDefinition, VariableStore};
use crate::properties::{self, ManifestProperties, Properties};

pub const POSTGRES_INSTANCE_GROUP: &str = "postgres";

pub struct DeploymentData {
    director: Arc<dyn Director>,
    name: String,
    /// Manifest before placeholders and ops are applied
    template: Manifest,
    /// Manifest sent to the director
    manifest: Manifest,
    store: VariableStore,
}

impl std::fmt::Debug for DeploymentData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentData")
            .field("name", &self.name)
            .field("variables", &self.store.len())
            .finish_non_exhaustive()
    }
}

/// Load a template and fill in name, release versions and cloud config
pub fn prepare_manifest(
    config: &PgatsConfig,
    path: impl AsRef<Path>,
    name: &str,
    releases: &BTreeMap<String, String>,
) -> Result<Manifest> {
    let mut manifest = Manifest::load(path)?;
    manifest.set_name(name);
    let defaults = BTreeMap::from([(
        "postgres".to_string(),
        config.postgres_release_version.clone(),
    )]);
    manifest.set_release_versions(releases, &defaults);
    manifest.apply_cloud_config(&config.cloud_config)?;
    Ok(manifest)
}

impl DeploymentData {
    /// Wrap a prepared manifest; it must carry a deployment name
    pub fn new(director: Arc<dyn Director>, manifest: Manifest) -> Result<Self> {
        let name = manifest.name()?.to_string();
        Ok(Self {
            director,
            name,
            template: manifest.clone(),
            manifest,
            store: VariableStore::new(),
        })
    }

    pub fn from_file(
        director: Arc<dyn Director>,
        config: &PgatsConfig,
        path: impl AsRef<Path>,
        name: &str,
        releases: &BTreeMap<String, String>,
    ) -> Result<Self> {
        Self::new(director, prepare_manifest(config, path, name, releases)?)
    }

    /// Replace the template, keeping generated variables
    pub fn set_manifest(&mut self, manifest: Manifest) -> Result<()> {
        self.name = manifest.name()?.to_string();
        self.template = manifest.clone();
        self.manifest = manifest;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn director(&self) -> &Arc<dyn Director> {
        &self.director
    }

    pub fn contains_variables(&self) -> bool {
        self.template.contains_variables()
    }

    /// Render the template with `vars` and `ops` into the deployable manifest
    pub fn evaluate_template(
        &mut self,
        vars: &Mapping,
        ops: &[OpDefinition],
        options: EvaluateOptions,
    ) -> Result<()> {
        self.manifest = self
            .template
            .evaluate(vars, &mut self.store, ops, options)?;
        Ok(())
    }

    /// Generated value of a manifest variable
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.store.get(name)
    }

    pub fn variables(&self) -> &VariableStore {
        &self.store
    }

    pub async fn create_or_update(&self) -> Result<()> {
        tracing::info!(deployment = %self.name, "Deploying");
        let yaml = self.manifest.to_yaml()?;
        self.director.update_deployment(&yaml).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        tracing::info!(deployment = %self.name, "Deleting deployment");
        self.director.delete_deployment(&self.name).await?;
        Ok(())
    }

    /// Log and return the changes the current manifest would make
    pub async fn print_diffs(&self) -> Result<Vec<DiffLine>> {
        let yaml = self.manifest.to_yaml()?;
        let lines = self.director.diff(&self.name, &yaml).await?;
        for line in &lines {
            tracing::info!(deployment = %self.name, "{}", line);
        }
        Ok(lines)
    }

    pub async fn vm_infos(&self) -> Result<Vec<VmInfo>> {
        Ok(self.director.vm_infos(&self.name).await?)
    }

    async fn find_vm(&self, vm_name: &str, wanted: impl Fn(&VmInfo) -> bool) -> Result<VmInfo> {
        self.vm_infos()
            .await?
            .into_iter()
            .find(|vm| vm.job_name == vm_name && wanted(vm))
            .ok_or_else(|| DirectorError::VmNotFound(vm_name.to_string()).into())
    }

    /// First IP of the VM running `vm_name`
    pub async fn vm_address(&self, vm_name: &str) -> Result<String> {
        let vm = self.find_vm(vm_name, |vm| !vm.ips.is_empty()).await?;
        vm.ips
            .into_iter()
            .next()
            .ok_or_else(|| DirectorError::VmNotFound(vm_name.to_string()).into())
    }

    /// First BOSH DNS name of the VM running `vm_name`
    pub async fn vm_dns(&self, vm_name: &str) -> Result<String> {
        let vm = self.find_vm(vm_name, |vm| !vm.dns.is_empty()).await?;
        vm.dns
            .into_iter()
            .next()
            .ok_or_else(|| DirectorError::VmNotFound(vm_name.to_string()).into())
    }

    /// DNS name when the director reports one, otherwise the IP
    pub async fn vm_host(&self, vm_name: &str) -> Result<String> {
        match self.vm_dns(vm_name).await {
            Ok(dns) => Ok(dns),
            Err(e) => {
                tracing::debug!(vm = vm_name, error = %e, "No DNS name, falling back to address");
                self.vm_address(vm_name).await
            }
        }
    }

    pub async fn is_vm_process_running(&self, vm_name: &str, process: &str) -> Result<bool> {
        let vm = self.find_vm(vm_name, |_| true).await?;
        let info = vm.process(process).ok_or_else(|| DirectorError::ProcessNotFound {
            process: process.to_string(),
            vm: vm_name.to_string(),
        })?;
        Ok(info.is_running())
    }

    async fn change_state(&self, job: &str, state: JobState) -> Result<()> {
        self.director
            .change_job_state(&self.name, job, state)
            .await?;
        Ok(())
    }

    pub async fn restart(&self, job: &str) -> Result<()> {
        self.change_state(job, JobState::Restarted).await
    }

    pub async fn stop(&self, job: &str) -> Result<()> {
        self.change_state(job, JobState::Stopped).await
    }

    pub async fn start(&self, job: &str) -> Result<()> {
        self.change_state(job, JobState::Started).await
    }

    /// Toggle resurrection on every VM of the deployment
    pub async fn enable_resurrection(&self, enabled: bool) -> Result<()> {
        let vms = self.vm_infos().await?;
        try_join_all(vms.iter().map(|vm| {
            self.director
                .set_resurrection(&self.name, &vm.job_name, &vm.id, enabled)
        }))
        .await?;
        tracing::info!(deployment = %self.name, enabled, "Updated resurrection");
        Ok(())
    }

    /// Job properties of the evaluated manifest
    pub fn jobs_properties(&self) -> ManifestProperties {
        ManifestProperties::from_manifest(&self.manifest)
    }

    /// Manifest-level `properties` section
    pub fn postgres_props(&self) -> Result<Properties> {
        let section = self.manifest.properties().cloned().unwrap_or(Value::Null);
        Ok(properties::properties_from_value(&section)?)
    }

    /// Connection URL of the postgres VM for the first declared role
    pub async fn postgres_url(&self) -> Result<String> {
        let address = self.vm_address(POSTGRES_INSTANCE_GROUP).await?;
        let props = self
            .jobs_properties()
            .first_job_properties(POSTGRES_INSTANCE_GROUP)?;
        Ok(props.postgres_url(Some(&address))?)
    }
}
