//! Per-run state handed to every scenario
//!
//! Scenarios receive a [`TestContext`] instead of reaching for globals; each
//! one builds its own [`DeployHelper`] from it and so owns its deployment.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{self, CURRENT_POSTGRESQL, PgatsConfig};
use crate::deploy_helper::DeployHelper;
use crate::director::{Director, HttpDirector};
use crate::error::Result;
use crate::versions::PostgresReleaseVersions;

/// Install a `fmt` subscriber honouring `RUST_LOG`, defaulting to `info`
///
/// Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[derive(Clone)]
pub struct TestContext {
    pub config: PgatsConfig,
    pub versions: PostgresReleaseVersions,
    pub director: Arc<dyn Director>,
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("target", &self.config.bosh.target)
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

impl TestContext {
    pub fn new(
        config: PgatsConfig,
        versions: PostgresReleaseVersions,
        director: Arc<dyn Director>,
    ) -> Self {
        Self {
            config,
            versions,
            director,
        }
    }

    /// Build the context from `$PGATS_CONFIG` and the configured versions file
    pub fn from_env() -> Result<Self> {
        init_tracing();
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }

        let config = config::load_from_env()?;
        let versions = PostgresReleaseVersions::load(versions_path(&config))?;
        let director = Arc::new(HttpDirector::from_config(&config.bosh)?);
        Ok(Self::new(config, versions, director))
    }

    /// Expected server version, resolving `current` to the latest release's
    pub fn postgresql_version(&self) -> String {
        if self.config.postgresql_version == CURRENT_POSTGRESQL {
            self.versions
                .postgresql_version(self.versions.latest_version())
                .to_string()
        } else {
            self.config.postgresql_version.clone()
        }
    }

    /// A helper with a fresh deployment name; `None` deploys the configured release
    pub fn deploy_helper(&self, prefix: &str, pg_version: Option<u32>) -> DeployHelper {
        DeployHelper::new(&self.config, self.director.clone(), prefix, pg_version)
    }
}

/// Relative versions files are looked up in the crate root
fn versions_path(config: &PgatsConfig) -> PathBuf {
    if config.versions_file.is_absolute() {
        config.versions_file.clone()
    } else {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(&config.versions_file)
    }
}
