//! Driving the `bbr` backup and restore CLI
//!
//! `bbr` writes its artifact into the working directory, so every command
//! runs inside [`Bbr::work_dir`].

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::BoshConfig;
use crate::manifest::ops::BBR_JOB;
use crate::utils::{CommandOutput, run_command};

pub const CLIENT_SECRET_ENV: &str = "BOSH_CLIENT_SECRET";
pub const CA_CERT_ENV: &str = "CA_CERT";

#[derive(Debug, Clone)]
pub struct Bbr {
    pub target: String,
    pub username: String,
    pub client_secret: String,
    /// File holding the director CA certificate
    pub ca_cert_path: PathBuf,
    pub deployment: String,
    pub work_dir: PathBuf,
}

impl Bbr {
    pub fn new(
        bosh: &BoshConfig,
        ca_cert_path: impl Into<PathBuf>,
        deployment: &str,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target: bosh.target.clone(),
            username: bosh.username.clone(),
            client_secret: bosh.password.clone(),
            ca_cert_path: ca_cert_path.into(),
            deployment: deployment.to_string(),
            work_dir: work_dir.into(),
        }
    }

    /// `bbr deployment` invocation for `args`
    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("bbr");
        cmd.arg("deployment")
            .args(["--target", self.target.as_str()])
            .args(["--username", self.username.as_str()])
            .args(["--deployment", self.deployment.as_str()])
            .args(args)
            .current_dir(&self.work_dir)
            .env(CLIENT_SECRET_ENV, &self.client_secret)
            .env(CA_CERT_ENV, &self.ca_cert_path);
        cmd
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<CommandOutput> {
        tracing::info!(deployment = %self.deployment, command = ?args, "Running bbr");
        run_command(&mut self.command(args)).await
    }

    pub async fn pre_backup_check(&self) -> std::io::Result<CommandOutput> {
        self.run(&["pre-backup-check"]).await
    }

    pub async fn backup(&self) -> std::io::Result<CommandOutput> {
        self.run(&["backup"]).await
    }

    pub async fn restore(&self, artifact_path: &Path) -> std::io::Result<CommandOutput> {
        let path = artifact_path.to_string_lossy();
        self.run(&["restore", "--artifact-path", &path]).await
    }

    /// Postgres backup archives under `<work_dir>/<deployment>*/`
    pub fn find_backup_artifacts(&self) -> std::io::Result<Vec<PathBuf>> {
        let suffix = format!("-{}.tar", BBR_JOB);
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.work_dir)? {
            let entry = entry?;
            let is_backup_dir = entry.file_type()?.is_dir()
                && entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&self.deployment);
            if !is_backup_dir {
                continue;
            }
            for file in std::fs::read_dir(entry.path())? {
                let path = file?.path();
                if path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(&suffix))
                {
                    found.push(path);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}
