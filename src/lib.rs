pub mod bbr;
pub mod config;
pub mod context;
pub mod deploy_helper;
pub mod deployment;
pub mod director;
pub mod error;
pub mod manifest;
pub mod postgres;
pub mod properties;
pub mod ssh;
pub mod utils;
pub mod validator;
pub mod versions;
pub mod wait;

pub use config::{BoshConfig, CloudConfig, JobNetwork, PgatsConfig};
pub use context::TestContext;
pub use deploy_helper::{BootstrapPhase, DeployHelper};
pub use deployment::DeploymentData;
pub use director::{Director, DirectorError, HttpDirector};
pub use error::{Error, Result};
pub use manifest::{Manifest, ManifestError, OpDefinition, VariableStore};
pub use postgres::{LoadType, PgData, PgError, PgOutputData, SslMode};
pub use properties::{PgProperties, Properties};
pub use validator::{ServerInspector, ValidationError, Validator};
pub use versions::PostgresReleaseVersions;
