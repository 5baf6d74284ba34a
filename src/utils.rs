//! Small helpers shared by scenarios: names, temp files, subprocesses

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use uuid::Uuid;

/// Generate a random UUID string
pub fn get_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a unique deployment name for a scenario
///
/// Names have the form `pgats-{prefix}-{uuid}` so parallel runs never collide.
pub fn generate_env_name(prefix: &str) -> String {
    format!("pgats-{}-{}", prefix, get_uuid())
}

/// Write `data` to a new temp file that outlives this call
///
/// The caller owns the returned path and is responsible for removing it.
pub fn write_file(data: &str) -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new().prefix("testfile").tempfile()?;
    file.write_all(data.as_bytes())?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Create a temp directory that outlives this call
pub fn create_temp_dir() -> std::io::Result<PathBuf> {
    let dir = tempfile::Builder::new().prefix("pgats").tempdir()?;
    Ok(dir.keep())
}

/// Set unix permission bits on a file
pub fn set_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Captured result of a subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Turn a failed run into an error carrying stderr and stdout
    pub fn into_result(self, command: &str) -> crate::Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(crate::Error::CommandFailed {
                command: command.to_string(),
                stderr: format!("stderr was: '{}', stdout was: '{}'", self.stderr, self.stdout),
            })
        }
    }
}

/// Run a command to completion and capture its output
///
/// A non-zero exit is reported through `CommandOutput::success`, not as an
/// error; only failure to spawn is an `Err`.
pub async fn run_command(command: &mut Command) -> std::io::Result<CommandOutput> {
    let program = format!("{:?}", command.as_std().get_program());
    tracing::debug!(program = %program, "Running command");

    let output = command.kill_on_drop(true).output().await?;
    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
        code: output.status.code(),
    };

    if !result.success {
        tracing::debug!(
            program = %program,
            code = ?result.code,
            stderr = %result.stderr.trim(),
            "Command exited with failure"
        );
    }
    Ok(result)
}
