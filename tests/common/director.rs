//! In-memory [`Director`] that records every call
//!
//! VMs can be preset or made to appear after the first deploy, which is what
//! the bootstrap protocol of `DeployHelper` waits for.

use std::sync::Mutex;

use async_trait::async_trait;
use pgats::director::{DiffLine, Director, DirectorError, JobState, Result, VmInfo};

#[derive(Debug, Default)]
pub struct FakeDirectorState {
    /// Manifests passed to `update_deployment`, in order
    pub deployed: Vec<String>,
    pub deleted: Vec<String>,
    pub job_changes: Vec<(String, String, JobState)>,
    /// (deployment, job, instance id, enabled)
    pub resurrection: Vec<(String, String, String, bool)>,
    pub uploaded_urls: Vec<String>,
    pub vms: Vec<VmInfo>,
    /// Replaces `vms` once the first deploy succeeds
    pub vms_after_deploy: Option<Vec<VmInfo>>,
    pub diff: Vec<DiffLine>,
    pub fail_update: Option<String>,
    pub fail_upload: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeDirector {
    pub state: Mutex<FakeDirectorState>,
}

impl FakeDirector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vms(vms: Vec<VmInfo>) -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().vms = vms;
        fake
    }

    /// No VMs until something is deployed, then `vms`
    pub fn with_vms_after_deploy(vms: Vec<VmInfo>) -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().vms_after_deploy = Some(vms);
        fake
    }

    pub fn fail_updates(&self, message: &str) {
        self.state.lock().unwrap().fail_update = Some(message.to_string());
    }

    pub fn fail_uploads(&self, message: &str) {
        self.state.lock().unwrap().fail_upload = Some(message.to_string());
    }

    pub fn set_diff(&self, diff: Vec<DiffLine>) {
        self.state.lock().unwrap().diff = diff;
    }

    pub fn deployed(&self) -> Vec<String> {
        self.state.lock().unwrap().deployed.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn job_changes(&self) -> Vec<(String, String, JobState)> {
        self.state.lock().unwrap().job_changes.clone()
    }

    pub fn resurrection(&self) -> Vec<(String, String, String, bool)> {
        self.state.lock().unwrap().resurrection.clone()
    }

    pub fn uploaded_urls(&self) -> Vec<String> {
        self.state.lock().unwrap().uploaded_urls.clone()
    }
}

fn failure(message: &str) -> DirectorError {
    DirectorError::Status {
        status: 500,
        body: message.to_string(),
    }
}

#[async_trait]
impl Director for FakeDirector {
    async fn update_deployment(&self, manifest: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.fail_update {
            return Err(failure(message));
        }
        state.deployed.push(manifest.to_string());
        if let Some(vms) = state.vms_after_deploy.take() {
            state.vms = vms;
        }
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().deleted.push(name.to_string());
        Ok(())
    }

    async fn vm_infos(&self, _deployment: &str) -> Result<Vec<VmInfo>> {
        Ok(self.state.lock().unwrap().vms.clone())
    }

    async fn change_job_state(&self, deployment: &str, job: &str, state: JobState) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .job_changes
            .push((deployment.to_string(), job.to_string(), state));
        Ok(())
    }

    async fn set_resurrection(
        &self,
        deployment: &str,
        job: &str,
        instance_id: &str,
        enabled: bool,
    ) -> Result<()> {
        self.state.lock().unwrap().resurrection.push((
            deployment.to_string(),
            job.to_string(),
            instance_id.to_string(),
            enabled,
        ));
        Ok(())
    }

    async fn upload_release_url(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.fail_upload {
            return Err(failure(message));
        }
        state.uploaded_urls.push(url.to_string());
        Ok(())
    }

    async fn diff(&self, _deployment: &str, _manifest: &str) -> Result<Vec<DiffLine>> {
        Ok(self.state.lock().unwrap().diff.clone())
    }
}
