//! BOSH deployment manifests
//!
//! A [`Manifest`] is a parsed YAML tree. Scenario setup renames it, pins
//! release versions and injects cloud-config values; evaluation applies the
//! scenario's patch operations, generates the `variables` section into a
//! [`VariableStore`] and interpolates every `((placeholder))`.

pub mod ops;
pub mod patch;
pub mod template;
pub mod variables;

use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::config::CloudConfig;

pub use patch::{OpDefinition, OpKind, PatchPath, PathSegment, apply_ops};
pub use template::{EvaluateOptions, Layered, VariableLookup, interpolate};
pub use variables::{VariableDefinition, VariableKind, VariableStore};

pub const MISSING_DEPLOYMENT_NAME_MSG: &str = "Invalid manifest: deployment name not present";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid manifest YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{}", MISSING_DEPLOYMENT_NAME_MSG)]
    MissingDeploymentName,

    #[error("Invalid patch path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Expected to find {reason} for path '{path}'")]
    PathNotFound { path: String, reason: String },

    #[error("Expected to find variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("Invalid variable: {0}")]
    InvalidVariable(String),

    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
}

pub type Result<T, E = ManifestError> = std::result::Result<T, E>;

/// A deployment manifest
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    doc: Value,
}

impl Manifest {
    pub fn parse(data: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(data)?;
        Ok(Self::from_value(doc))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&data)
    }

    pub fn from_value(doc: Value) -> Self {
        Self { doc }
    }

    pub fn value(&self) -> &Value {
        &self.doc
    }

    pub fn into_value(self) -> Value {
        self.doc
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.doc)?)
    }

    /// Deployment name; absent or empty names are an error
    pub fn name(&self) -> Result<&str> {
        match self.doc.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(ManifestError::MissingDeploymentName),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        if let Value::Mapping(map) = &mut self.doc {
            map.insert("name".into(), name.into());
        }
    }

    /// Pin release versions, preferring `overrides` over `defaults`
    pub fn set_release_versions(
        &mut self,
        overrides: &BTreeMap<String, String>,
        defaults: &BTreeMap<String, String>,
    ) {
        let Some(Value::Sequence(releases)) = self.doc.get_mut("releases") else {
            return;
        };
        for release in releases.iter_mut() {
            let Some(name) = release.get("name").and_then(Value::as_str) else {
                continue;
            };
            let version = overrides.get(name).or_else(|| defaults.get(name)).cloned();
            if let (Some(version), Value::Mapping(map)) = (version, release) {
                map.insert("version".into(), version.into());
            }
        }
    }

    /// Set azs, networks, disk and VM type of every instance group
    pub fn apply_cloud_config(&mut self, cloud: &CloudConfig) -> Result<()> {
        let networks = serde_yaml::to_value(&cloud.networks)?;
        let azs = serde_yaml::to_value(&cloud.azs)?;

        let Some(Value::Sequence(groups)) = self.doc.get_mut("instance_groups") else {
            return Ok(());
        };
        for group in groups.iter_mut() {
            if let Value::Mapping(map) = group {
                map.insert("azs".into(), azs.clone());
                map.insert("networks".into(), networks.clone());
                map.insert(
                    "persistent_disk_type".into(),
                    cloud.persistent_disk_type.clone().into(),
                );
                map.insert("vm_type".into(), cloud.vm_type.clone().into());
            }
        }
        Ok(())
    }

    /// Whether the manifest declares any variables to generate
    pub fn contains_variables(&self) -> bool {
        matches!(self.doc.get("variables"), Some(Value::Sequence(vars)) if !vars.is_empty())
    }

    /// Parsed entries of the `variables` section
    pub fn variable_definitions(&self) -> Result<Vec<VariableDefinition>> {
        match self.doc.get("variables") {
            Some(section @ Value::Sequence(_)) => Ok(serde_yaml::from_value(section.clone())?),
            _ => Ok(Vec::new()),
        }
    }

    /// Apply patch operations in place; on error the manifest is unchanged
    pub fn apply_ops(&mut self, ops: &[OpDefinition]) -> Result<()> {
        apply_ops(&mut self.doc, ops)
    }

    /// Instance group named `name`
    pub fn instance_group(&self, name: &str) -> Option<&Value> {
        self.instance_groups()
            .find(|group| group.get("name").and_then(Value::as_str) == Some(name))
    }

    pub fn instance_groups(&self) -> impl Iterator<Item = &Value> {
        self.doc
            .get("instance_groups")
            .and_then(Value::as_sequence)
            .into_iter()
            .flatten()
    }

    /// Top-level `properties` section
    pub fn properties(&self) -> Option<&Value> {
        self.doc.get("properties")
    }

    /// Produce the deployable manifest
    ///
    /// `ops` are applied to a copy, the `variables` section is rendered with
    /// the scalar `vars` and generated into `store`, then the whole tree is
    /// interpolated from `vars` and `store`.
    pub fn evaluate(
        &self,
        vars: &dyn VariableLookup,
        store: &mut VariableStore,
        ops: &[OpDefinition],
        options: EvaluateOptions,
    ) -> Result<Manifest> {
        let mut doc = self.doc.clone();
        apply_ops(&mut doc, ops)?;

        if let Some(section @ Value::Sequence(_)) = doc.get("variables") {
            let rendered = interpolate(section, vars, EvaluateOptions::default())?;
            let definitions: Vec<VariableDefinition> = serde_yaml::from_value(rendered)?;
            store.generate(&definitions)?;
        }

        let lookup = Layered::new(vec![vars, &*store as &dyn VariableLookup]);
        let doc = interpolate(&doc, &lookup, options)?;
        tracing::debug!(
            name = doc.get("name").and_then(serde_yaml::Value::as_str).unwrap_or_default(),
            variables = store.len(),
            "Evaluated manifest"
        );
        Ok(Manifest { doc })
    }
}

impl From<Mapping> for Manifest {
    fn from(map: Mapping) -> Self {
        Self::from_value(Value::Mapping(map))
    }
}
