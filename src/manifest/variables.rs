//! Manifest variable generation
//!
//! Entries of a manifest's `variables` section are generated locally so a
//! deployment can be evaluated completely before it is sent to the director.
//! The kind set is closed: passwords, ssh keypairs and X.509 certificates.
//!
//! Generated values live in a [`VariableStore`] that outlives a single
//! evaluation. A later pass reuses an entry as long as its definition is
//! unchanged; a changed definition (a certificate whose common name now
//! carries the real VM address) is regenerated, signed by the same CA.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::template::VariableLookup;
use super::{ManifestError, Result};
use crate::ssh::SshKeyPair;

const PASSWORD_LEN: usize = 20;

/// Kind of a manifest variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Password,
    Ssh,
    Certificate,
}

/// One entry of the manifest `variables` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

/// Options of a `certificate` variable
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CertificateOptions {
    pub is_ca: bool,
    pub ca: Option<String>,
    pub common_name: Option<String>,
    pub alternative_names: Vec<String>,
    pub extended_key_usage: Vec<String>,
}

impl VariableDefinition {
    /// CA this definition must be signed by, if any
    pub fn signing_ca(&self) -> Option<&str> {
        match self.kind {
            VariableKind::Certificate => self.options.get("ca").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Signing material kept for generated CAs
#[derive(Debug, Clone)]
struct CaMaterial {
    params: CertificateParams,
    key_pem: String,
    certificate_pem: String,
}

#[derive(Debug, Clone)]
struct StoredVariable {
    /// `None` for values supplied by the caller
    definition: Option<VariableDefinition>,
    value: Value,
    signer: Option<CaMaterial>,
}

/// Generated and supplied variable values
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    entries: BTreeMap<String, StoredVariable>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a variable
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|entry| &entry.value)
    }

    /// String field of a structured variable, e.g. `("postgres_cert", "ca")`
    pub fn get_field(&self, name: &str, field: &str) -> Option<&str> {
        self.get(name)?.get(field)?.as_str()
    }

    /// Store a caller-supplied value; it is never regenerated
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(
            name.into(),
            StoredVariable {
                definition: None,
                value,
                signer: None,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn is_current(&self, definition: &VariableDefinition) -> bool {
        match self.entries.get(&definition.name) {
            Some(StoredVariable {
                definition: None, ..
            }) => true,
            Some(StoredVariable {
                definition: Some(stored),
                ..
            }) => stored == definition,
            None => false,
        }
    }

    /// Generate every definition not already present, CAs before the certificates they sign
    pub fn generate(&mut self, definitions: &[VariableDefinition]) -> Result<()> {
        let mut pending: Vec<&VariableDefinition> = definitions.iter().collect();
        // Definitions settled in this call, either kept or regenerated
        let mut processed: BTreeSet<&str> = BTreeSet::new();
        // Entries regenerated in this call; certificates signed by them must follow
        let mut regenerated: Vec<String> = Vec::new();

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();

            for definition in pending {
                if let Some(ca) = definition.signing_ca() {
                    let ca_pending = definitions.iter().any(|d| d.name == ca)
                        && !processed.contains(ca);
                    if ca_pending {
                        deferred.push(definition);
                        continue;
                    }
                    if !self.entries.contains_key(ca) {
                        return Err(ManifestError::MissingVariables(vec![ca.to_string()]));
                    }
                }

                let signer_changed = definition
                    .signing_ca()
                    .is_some_and(|ca| regenerated.iter().any(|r| r == ca));
                processed.insert(definition.name.as_str());
                if self.is_current(definition) && !signer_changed {
                    continue;
                }

                let stored = self.generate_one(definition)?;
                tracing::debug!(name = %definition.name, kind = ?definition.kind, "Generated variable");
                self.entries.insert(definition.name.clone(), stored);
                regenerated.push(definition.name.clone());
            }

            if deferred.len() == before {
                let names: Vec<&str> = deferred.iter().map(|d| d.name.as_str()).collect();
                return Err(ManifestError::InvalidVariable(format!(
                    "circular certificate authority references: {}",
                    names.join(", ")
                )));
            }
            pending = deferred;
        }
        Ok(())
    }

    fn generate_one(&self, definition: &VariableDefinition) -> Result<StoredVariable> {
        let (value, signer) = match definition.kind {
            VariableKind::Password => (Value::String(generate_password()), None),
            VariableKind::Ssh => (SshKeyPair::generate().to_value(), None),
            VariableKind::Certificate => {
                let options: CertificateOptions = if definition.options.is_null() {
                    CertificateOptions::default()
                } else {
                    serde_yaml::from_value(definition.options.clone())?
                };
                let issuer = match &options.ca {
                    Some(ca) => Some(self.ca_material(ca)?),
                    None => None,
                };
                generate_certificate(&options, issuer)?
            }
        };
        Ok(StoredVariable {
            definition: Some(definition.clone()),
            value,
            signer,
        })
    }

    fn ca_material(&self, name: &str) -> Result<&CaMaterial> {
        self.entries
            .get(name)
            .ok_or_else(|| ManifestError::MissingVariables(vec![name.to_string()]))?
            .signer
            .as_ref()
            .ok_or_else(|| {
                ManifestError::InvalidVariable(format!(
                    "variable '{}' is not a certificate authority",
                    name
                ))
            })
    }
}

impl VariableLookup for VariableStore {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Generate a random password of lowercase letters and digits
pub fn generate_password() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .filter_map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET.get(idx).map(|&c| c as char)
        })
        .collect()
}

fn extended_key_usage(name: &str) -> Result<ExtendedKeyUsagePurpose> {
    match name {
        "server_auth" => Ok(ExtendedKeyUsagePurpose::ServerAuth),
        "client_auth" => Ok(ExtendedKeyUsagePurpose::ClientAuth),
        "code_signing" => Ok(ExtendedKeyUsagePurpose::CodeSigning),
        "email_protection" => Ok(ExtendedKeyUsagePurpose::EmailProtection),
        "timestamping" => Ok(ExtendedKeyUsagePurpose::TimeStamping),
        other => Err(ManifestError::InvalidVariable(format!(
            "unknown extended key usage '{}'",
            other
        ))),
    }
}

fn generate_certificate(
    options: &CertificateOptions,
    issuer: Option<&CaMaterial>,
) -> Result<(Value, Option<CaMaterial>)> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(options.alternative_names.clone())?;

    let mut name = DistinguishedName::new();
    if let Some(common_name) = &options.common_name {
        name.push(DnType::CommonName, common_name.as_str());
    }
    params.distinguished_name = name;
    params.extended_key_usages = options
        .extended_key_usage
        .iter()
        .map(|usage| extended_key_usage(usage))
        .collect::<Result<_>>()?;

    if options.is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
    } else {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
    }

    let (cert, ca_pem) = match issuer {
        Some(ca) => {
            let ca_key = KeyPair::from_pem(&ca.key_pem)?;
            let signer = Issuer::new(ca.params.clone(), ca_key);
            (params.signed_by(&key, &signer)?, ca.certificate_pem.clone())
        }
        None => {
            let cert = params.self_signed(&key)?;
            let pem = cert.pem();
            (cert, pem)
        }
    };

    let certificate_pem = cert.pem();
    let key_pem = key.serialize_pem();

    let mut value = Mapping::new();
    value.insert("ca".into(), ca_pem.into());
    value.insert("certificate".into(), certificate_pem.clone().into());
    value.insert("private_key".into(), key_pem.clone().into());

    let material = options.is_ca.then(|| CaMaterial {
        params,
        key_pem,
        certificate_pem,
    });
    Ok((Value::Mapping(value), material))
}
