//! Canned patch operations used by the scenarios

use serde_yaml::{Mapping, Value};

use super::patch::OpDefinition;
use super::Result;
use crate::config::CloudConfig;

/// Properties of the `postgres` job in the `postgres` instance group
const PG_PROPS: &str = "/instance_groups/name=postgres/jobs/name=postgres/properties";

pub const BBR_JOB: &str = "bbr-postgres-db";
pub const BACKUP_INSTANCE_GROUP: &str = "backup";

/// Variable holding the client certificate whose common name matches its role
pub const MATCHING_CERTS: &str = "certuser_matching_certs";

fn mapping<const N: usize>(entries: [(&str, Value); N]) -> Value {
    let mut map = Mapping::with_capacity(N);
    for (key, value) in entries {
        map.insert(key.into(), value);
    }
    Value::Mapping(map)
}

fn strings(items: &[&str]) -> Value {
    Value::Sequence(items.iter().map(|s| Value::from(*s)).collect())
}

fn pg_prop(rest: &str) -> String {
    format!("{}/{}", PG_PROPS, rest)
}

fn certificate_variable(name: &str, options: Value) -> Value {
    mapping([
        ("name", name.into()),
        ("type", "certificate".into()),
        ("options", options),
    ])
}

fn client_certificate(name: &str, common_name: &str) -> Value {
    certificate_variable(
        name,
        mapping([
            ("ca", "postgres_ca".into()),
            ("common_name", common_name.into()),
            ("alternative_names", Value::Sequence(Vec::new())),
            (
                "extended_key_usage",
                strings(&["server_auth", "client_auth"]),
            ),
        ]),
    )
}

/// Skip the data copy on minor upgrades
pub fn upgrade_no_copy_ops() -> Result<Vec<OpDefinition>> {
    Ok(vec![OpDefinition::replace(
        &pg_prop("databases/skip_data_copy_in_minor?"),
        true,
    )?])
}

/// Server TLS plus the CA and the client certificates used by the SSL scenarios
pub fn ssl_ops() -> Result<Vec<OpDefinition>> {
    Ok(vec![
        OpDefinition::replace(
            &pg_prop("databases/tls?/certificate"),
            "((postgres_cert.certificate))",
        )?,
        OpDefinition::replace(
            &pg_prop("databases/tls?/private_key"),
            "((postgres_cert.private_key))",
        )?,
        OpDefinition::replace(
            "/variables?/name=postgres_ca?",
            certificate_variable(
                "postgres_ca",
                mapping([
                    ("is_ca", true.into()),
                    ("common_name", "postgres_ca".into()),
                ]),
            ),
        )?,
        OpDefinition::replace(
            "/variables?/name=postgres_cert?",
            certificate_variable(
                "postgres_cert",
                mapping([
                    ("ca", "postgres_ca".into()),
                    ("common_name", "((postgres_host))".into()),
                    ("alternative_names", strings(&["((postgres_host))"])),
                    ("extended_key_usage", strings(&["server_auth"])),
                ]),
            ),
        )?,
        OpDefinition::replace(
            "/variables?/name=((certs_matching_certs))?",
            client_certificate("((certs_matching_certs))", "((certs_matching_name))"),
        )?,
        OpDefinition::replace(
            "/variables?/name=((certs_mapped_certs))?",
            client_certificate("((certs_mapped_certs))", "((certs_mapped_cn))"),
        )?,
        OpDefinition::replace(
            "/variables?/name=((certs_wrong_certs))?",
            client_certificate("((certs_wrong_certs))", "((certs_wrong_cn))"),
        )?,
        OpDefinition::replace(
            "/variables?/name=((certs_bad_ca))?",
            certificate_variable(
                "((certs_bad_ca))",
                mapping([("is_ca", true.into()), ("common_name", "bad_ca".into())]),
            ),
        )?,
    ])
}

/// [`ssl_ops`] plus client CA and certificate-authenticated roles
pub fn mutual_ssl_ops() -> Result<Vec<OpDefinition>> {
    let mut ops = ssl_ops()?;
    ops.extend([
        OpDefinition::replace(&pg_prop("databases/tls?/ca"), "((postgres_cert.ca))")?,
        OpDefinition::replace(
            &pg_prop("databases/roles?/name=aaa?"),
            mapping([("name", "aaa".into()), ("common_name", "aaa_2".into())]),
        )?,
        OpDefinition::replace(
            &pg_prop("databases/roles?/name=((certs_matching_name))?"),
            mapping([("name", "((certs_matching_name))".into())]),
        )?,
        OpDefinition::replace(
            &pg_prop("databases/roles?/name=((certs_mapped_name))?"),
            mapping([
                ("name", "((certs_mapped_name))".into()),
                ("common_name", "((certs_mapped_cn))".into()),
            ]),
        )?,
    ]);
    Ok(ops)
}

/// A role with a permission the release rejects
pub fn add_bad_role_ops() -> Result<Vec<OpDefinition>> {
    Ok(vec![OpDefinition::replace(
        &pg_prop("databases/roles?/-"),
        mapping([
            ("name", "foo".into()),
            ("password", "foo".into()),
            ("permissions", strings(&["DOESNOTEXIST"])),
        ]),
    )?])
}

/// Lifecycle hook scripts; empty scripts are still written so a previous value is cleared
pub fn define_hooks(
    timeout: u64,
    pre_start: &str,
    post_start: &str,
    pre_stop: &str,
    post_stop: &str,
) -> Result<Vec<OpDefinition>> {
    Ok(vec![
        OpDefinition::replace(&pg_prop("databases/hooks?/timeout"), timeout)?,
        OpDefinition::replace(&pg_prop("databases/hooks?/pre_start"), pre_start)?,
        OpDefinition::replace(&pg_prop("databases/hooks?/post_start"), post_start)?,
        OpDefinition::replace(&pg_prop("databases/hooks?/pre_stop"), pre_stop)?,
        OpDefinition::replace(&pg_prop("databases/hooks?/post_stop"), post_stop)?,
    ])
}

/// Periodic maintenance script run by the release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Janitor {
    pub script: String,
    /// Seconds a single run may take
    pub timeout: u64,
    /// Seconds between runs
    pub interval: u64,
}

impl Janitor {
    pub fn op_definitions(&self) -> Result<Vec<OpDefinition>> {
        Ok(vec![
            OpDefinition::replace(&pg_prop("janitor?/script"), self.script.as_str())?,
            OpDefinition::replace(&pg_prop("janitor?/timeout"), self.timeout)?,
            OpDefinition::replace(&pg_prop("janitor?/interval"), self.interval)?,
        ])
    }
}

fn bbr_job(properties: Value) -> Value {
    mapping([
        ("name", BBR_JOB.into()),
        ("release", "postgres".into()),
        ("properties", properties),
    ])
}

/// bbr job colocated with postgres, finding the database through links
pub fn bbr_ops() -> Result<Vec<OpDefinition>> {
    Ok(vec![OpDefinition::replace(
        "/instance_groups/name=postgres/jobs/-",
        bbr_job(mapping([("release_level_backup", true.into())])),
    )?])
}

/// bbr job colocated with postgres, configured with explicit connection properties
pub fn bbr_no_link_ops() -> Result<Vec<OpDefinition>> {
    let postgres = mapping([
        ("address", "((postgres_host))".into()),
        ("port", 5524.into()),
        (
            "dbuser",
            mapping([
                ("name", "((defuser_name))".into()),
                ("password", "((defuser_password))".into()),
            ]),
        ),
        (
            "databases",
            Value::Sequence(vec![mapping([("name", "sandbox".into())])]),
        ),
    ]);
    Ok(vec![OpDefinition::replace(
        "/instance_groups/name=postgres/jobs/-",
        bbr_job(mapping([
            ("release_level_backup", true.into()),
            ("postgres", postgres),
        ])),
    )?])
}

/// bbr job on its own instance group
pub fn bbr_not_colocated_ops(cloud: &CloudConfig) -> Result<Vec<OpDefinition>> {
    let group = mapping([
        ("name", BACKUP_INSTANCE_GROUP.into()),
        ("instances", 1.into()),
        ("stemcell", "linux".into()),
        ("azs", serde_yaml::to_value(&cloud.azs)?),
        ("networks", serde_yaml::to_value(&cloud.networks)?),
        ("vm_type", cloud.vm_type.clone().into()),
        (
            "jobs",
            Value::Sequence(vec![bbr_job(mapping([(
                "release_level_backup",
                true.into(),
            )]))]),
        ),
    ]);
    Ok(vec![OpDefinition::replace(
        &format!("/instance_groups/name={}?", BACKUP_INSTANCE_GROUP),
        group,
    )?])
}

fn bbr_postgres_prop(rest: &str) -> String {
    format!(
        "/instance_groups/name={}/jobs/name={}/properties/postgres?/{}",
        BACKUP_INSTANCE_GROUP, BBR_JOB, rest
    )
}

fn bbr_ssl_ops(cloud: &CloudConfig, verify_hostname: bool) -> Result<Vec<OpDefinition>> {
    let mut ops = ssl_ops()?;
    ops.extend(bbr_not_colocated_ops(cloud)?);
    ops.extend([
        OpDefinition::replace(&bbr_postgres_prop("ssl_verify_hostname"), verify_hostname)?,
        OpDefinition::replace(&bbr_postgres_prop("ca"), "((postgres_cert.ca))")?,
    ]);
    Ok(ops)
}

/// Not colocated, TLS validated against the CA only
pub fn bbr_ssl_verify_ca(cloud: &CloudConfig) -> Result<Vec<OpDefinition>> {
    bbr_ssl_ops(cloud, false)
}

/// Not colocated, TLS validated including the server hostname
pub fn bbr_ssl_verify_full(cloud: &CloudConfig) -> Result<Vec<OpDefinition>> {
    bbr_ssl_ops(cloud, true)
}

/// Not colocated, authenticating with the client certificate stored as `certs`
pub fn bbr_client_certs(cloud: &CloudConfig, certs: &str) -> Result<Vec<OpDefinition>> {
    let mut ops = mutual_ssl_ops()?;
    ops.extend(bbr_not_colocated_ops(cloud)?);
    ops.extend([
        OpDefinition::replace(&bbr_postgres_prop("ssl_verify_hostname"), true)?,
        OpDefinition::replace(&bbr_postgres_prop("ca"), "((postgres_cert.ca))")?,
        OpDefinition::replace(
            &bbr_postgres_prop("client_certificate"),
            format!("(({}.certificate))", certs),
        )?,
        OpDefinition::replace(
            &bbr_postgres_prop("client_certificate_key"),
            format!("(({}.private_key))", certs),
        )?,
        OpDefinition::replace(
            &bbr_postgres_prop("dbuser"),
            mapping([("name", "((certs_matching_name))".into())]),
        )?,
    ]);
    Ok(ops)
}
