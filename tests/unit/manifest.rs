//! Unit tests for manifest patching, interpolation and variable generation

use std::collections::BTreeMap;

use pgats::config::CloudConfig;
use pgats::manifest::patch::parse_ops;
use pgats::manifest::template::referenced_variables;
use pgats::manifest::{
    EvaluateOptions, Manifest, ManifestError, OpDefinition, PatchPath, PathSegment,
    VariableDefinition, VariableKind, VariableStore, interpolate,
};
use serde_yaml::{Mapping, Value};

fn yaml(s: &str) -> Value {
    serde_yaml::from_str(s).unwrap()
}

fn vars(entries: &[(&str, &str)]) -> Mapping {
    entries
        .iter()
        .map(|(k, v)| (Value::from(*k), Value::from(*v)))
        .collect()
}

mod path_tests {
    use super::*;

    #[test]
    fn test_parse_segments() {
        let path: PatchPath = "/instance_groups/name=postgres/jobs/0/props?/-".parse().unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key {
                    name: "instance_groups".to_string(),
                    optional: false
                },
                PathSegment::Match {
                    field: "name".to_string(),
                    value: "postgres".to_string(),
                    optional: false
                },
                PathSegment::Key {
                    name: "jobs".to_string(),
                    optional: false
                },
                PathSegment::Index {
                    index: 0,
                    optional: false
                },
                PathSegment::Key {
                    name: "props".to_string(),
                    optional: true
                },
                PathSegment::Append,
            ]
        );
    }

    #[test]
    fn test_optional_propagates() {
        let path: PatchPath = "/a?/b/c".parse().unwrap();
        assert!(path.segments().iter().skip(1).all(|s| matches!(
            s,
            PathSegment::Key { optional: true, .. }
        )));
    }

    #[test]
    fn test_escapes() {
        let path: PatchPath = "/a~1b/c~0d".parse().unwrap();
        assert_eq!(
            path.segments()[0],
            PathSegment::Key {
                name: "a/b".to_string(),
                optional: false
            }
        );
        assert_eq!(path.to_string(), "/a~1b/c~0d");
    }

    #[test]
    fn test_root_and_invalid_paths() {
        assert!("/".parse::<PatchPath>().unwrap().is_root());
        assert!(matches!(
            "no-slash".parse::<PatchPath>(),
            Err(ManifestError::InvalidPath { .. })
        ));
        assert!(matches!(
            "/a//b".parse::<PatchPath>(),
            Err(ManifestError::InvalidPath { .. })
        ));
    }
}

mod patch_tests {
    use super::*;

    const DOC: &str = r#"
name: dep
instance_groups:
- name: postgres
  jobs:
  - name: postgres
    properties:
      databases:
        port: 5524
        roles:
        - name: pgadmin
"#;

    #[test]
    fn test_replace_existing_key() {
        let mut manifest = Manifest::parse(DOC).unwrap();
        manifest
            .apply_ops(&[OpDefinition::replace(
                "/instance_groups/name=postgres/jobs/name=postgres/properties/databases/port",
                6000,
            )
            .unwrap()])
            .unwrap();
        let port = &manifest.value()["instance_groups"][0]["jobs"][0]["properties"]["databases"]["port"];
        assert_eq!(port, &Value::from(6000));
    }

    #[test]
    fn test_optional_creates_missing_maps() {
        let mut manifest = Manifest::parse(DOC).unwrap();
        manifest
            .apply_ops(&[OpDefinition::replace(
                "/instance_groups/name=postgres/jobs/name=postgres/properties/databases/hooks?/timeout",
                3,
            )
            .unwrap()])
            .unwrap();
        let hooks = &manifest.value()["instance_groups"][0]["jobs"][0]["properties"]["databases"]["hooks"];
        assert_eq!(hooks["timeout"], Value::from(3));
    }

    #[test]
    fn test_optional_match_appends() {
        let mut doc = yaml(DOC);
        let op = OpDefinition::replace(
            "/variables?/name=sshkey?",
            yaml("{name: sshkey, type: ssh}"),
        )
        .unwrap();
        op.apply(&mut doc).unwrap();
        op.apply(&mut doc).unwrap();
        let variables = doc["variables"].as_sequence().unwrap();
        assert_eq!(variables.len(), 1);
        assert_eq!(variables[0]["type"], Value::from("ssh"));
    }

    #[test]
    fn test_append_to_list() {
        let mut doc = yaml(DOC);
        OpDefinition::replace(
            "/instance_groups/name=postgres/jobs/-",
            yaml("{name: bbr-postgres-db}"),
        )
        .unwrap()
        .apply(&mut doc)
        .unwrap();
        assert_eq!(doc["instance_groups"][0]["jobs"].as_sequence().unwrap().len(), 2);
    }

    #[test]
    fn test_negative_index() {
        let mut doc = yaml("list: [a, b, c]");
        OpDefinition::replace("/list/-1", "z")
            .unwrap()
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc, yaml("list: [a, b, z]"));
    }

    #[test]
    fn test_remove() {
        let mut doc = yaml(DOC);
        OpDefinition::remove("/instance_groups/0/jobs/0/properties/databases/roles/name=pgadmin")
            .unwrap()
            .apply(&mut doc)
            .unwrap();
        let roles = &doc["instance_groups"][0]["jobs"][0]["properties"]["databases"]["roles"];
        assert!(roles.as_sequence().unwrap().is_empty());
    }

    #[test]
    fn test_missing_required_key_fails() {
        let mut doc = yaml(DOC);
        let err = OpDefinition::replace("/instance_groups/name=backup/jobs", Value::Null)
            .unwrap()
            .apply(&mut doc)
            .unwrap_err();
        assert!(matches!(err, ManifestError::PathNotFound { .. }));
    }

    #[test]
    fn test_failed_ops_leave_document_untouched() {
        let mut manifest = Manifest::parse(DOC).unwrap();
        let before = manifest.clone();
        let ops = vec![
            OpDefinition::replace("/name", "changed").unwrap(),
            OpDefinition::replace("/does/not/exist", 1).unwrap(),
        ];
        assert!(manifest.apply_ops(&ops).is_err());
        assert_eq!(manifest, before);
    }

    #[test]
    fn test_parse_ops_file() {
        let ops = parse_ops(
            r#"
- type: replace
  path: /name
  value: renamed
- type: remove
  path: /instance_groups/0/jobs/0/properties?/databases
"#,
        )
        .unwrap();
        let mut doc = yaml(DOC);
        pgats::manifest::apply_ops(&mut doc, &ops).unwrap();
        assert_eq!(doc["name"], Value::from("renamed"));
        assert!(doc["instance_groups"][0]["jobs"][0]["properties"]
            .get("databases")
            .is_none());
    }
}

mod template_tests {
    use super::*;

    #[test]
    fn test_whole_value_keeps_structure() {
        let template = yaml("cert: ((postgres_cert))\nkey: ((postgres_cert.private_key))");
        let mut store = Mapping::new();
        store.insert(
            "postgres_cert".into(),
            yaml("{certificate: CERT, private_key: KEY}"),
        );
        let out = interpolate(&template, &store, EvaluateOptions::default()).unwrap();
        assert_eq!(out["cert"]["certificate"], Value::from("CERT"));
        assert_eq!(out["key"], Value::from("KEY"));
    }

    #[test]
    fn test_inline_placeholders() {
        let template = yaml("dns: q-s0.postgres.((network)).((deployment)).bosh");
        let out = interpolate(
            &template,
            &vars(&[("network", "private"), ("deployment", "pgats-x")]),
            EvaluateOptions::default(),
        )
        .unwrap();
        assert_eq!(out["dns"], Value::from("q-s0.postgres.private.pgats-x.bosh"));
    }

    #[test]
    fn test_bang_prefix_ignored() {
        let out = interpolate(
            &yaml("pw: ((!defuser_password))"),
            &vars(&[("defuser_password", "adm$in!")]),
            EvaluateOptions::default(),
        )
        .unwrap();
        assert_eq!(out["pw"], Value::from("adm$in!"));
    }

    #[test]
    fn test_nested_expansion() {
        let out = interpolate(
            &yaml("name: ((certs_matching_certs))"),
            &vars(&[
                ("certs_matching_certs", "((prefix))_certs"),
                ("prefix", "certuser"),
            ]),
            EvaluateOptions::default(),
        )
        .unwrap();
        assert_eq!(out["name"], Value::from("certuser_certs"));
    }

    #[test]
    fn test_missing_kept_unless_required() {
        let template = yaml("a: ((known))\nb: ((unknown))\nc: ((other.field))");
        let lookup = vars(&[("known", "1")]);

        let lenient = interpolate(&template, &lookup, EvaluateOptions::default()).unwrap();
        assert_eq!(lenient["b"], Value::from("((unknown))"));

        let err = interpolate(
            &template,
            &lookup,
            EvaluateOptions {
                expect_all_keys: true,
            },
        )
        .unwrap_err();
        match err {
            ManifestError::MissingVariables(names) => {
                assert_eq!(names, vec!["other.field".to_string(), "unknown".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_recursive_variables_rejected() {
        let err = interpolate(
            &yaml("a: ((loop))"),
            &vars(&[("loop", "x((loop))")]),
            EvaluateOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidVariable(_)));
    }

    #[test]
    fn test_referenced_variables() {
        let names = referenced_variables(&yaml(
            "a: ((one))\nb: [x-((two.public_key))]\n((three)): c",
        ));
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["one", "three", "two"]
        );
    }
}

mod variables_tests {
    use super::*;

    fn definitions(s: &str) -> Vec<VariableDefinition> {
        serde_yaml::from_str(s).unwrap()
    }

    const CERTS: &str = r#"
- name: postgres_cert
  type: certificate
  options:
    ca: postgres_ca
    common_name: 10.0.0.5
    alternative_names: [10.0.0.5]
    extended_key_usage: [server_auth]
- name: postgres_ca
  type: certificate
  options:
    is_ca: true
    common_name: postgres_ca
- name: sshkey
  type: ssh
- name: pw
  type: password
"#;

    #[test]
    fn test_generates_every_kind() {
        let mut store = VariableStore::new();
        store.generate(&definitions(CERTS)).unwrap();
        assert_eq!(store.len(), 4);

        assert_eq!(store.get("pw").unwrap().as_str().unwrap().len(), 20);
        assert!(store
            .get_field("sshkey", "public_key")
            .unwrap()
            .starts_with("ssh-ed25519 "));
        assert!(store
            .get_field("postgres_cert", "certificate")
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
        assert_eq!(
            store.get_field("postgres_cert", "ca"),
            store.get_field("postgres_ca", "certificate")
        );
    }

    #[test]
    fn test_unchanged_definitions_are_reused() {
        let defs = definitions(CERTS);
        let mut store = VariableStore::new();
        store.generate(&defs).unwrap();
        let key = store.get_field("sshkey", "private_key").unwrap().to_string();
        let cert = store.get_field("postgres_cert", "certificate").unwrap().to_string();

        store.generate(&defs).unwrap();
        assert_eq!(store.get_field("sshkey", "private_key").unwrap(), key);
        assert_eq!(store.get_field("postgres_cert", "certificate").unwrap(), cert);
    }

    #[test]
    fn test_changed_certificate_regenerated_under_same_ca() {
        let mut store = VariableStore::new();
        store.generate(&definitions(CERTS)).unwrap();
        let ca = store.get_field("postgres_ca", "certificate").unwrap().to_string();
        let cert = store.get_field("postgres_cert", "certificate").unwrap().to_string();

        store
            .generate(&definitions(&CERTS.replace("10.0.0.5", "q-s0.postgres.bosh")))
            .unwrap();
        assert_ne!(store.get_field("postgres_cert", "certificate").unwrap(), cert);
        assert_eq!(store.get_field("postgres_cert", "ca").unwrap(), ca);
    }

    #[test]
    fn test_changed_ca_resigns_leaf_listed_before_it() {
        let mut store = VariableStore::new();
        store.generate(&definitions(CERTS)).unwrap();
        let old_ca = store.get_field("postgres_ca", "certificate").unwrap().to_string();
        let cert = store.get_field("postgres_cert", "certificate").unwrap().to_string();

        store
            .generate(&definitions(
                &CERTS.replace("common_name: postgres_ca", "common_name: postgres_ca_2"),
            ))
            .unwrap();
        let new_ca = store.get_field("postgres_ca", "certificate").unwrap();
        assert_ne!(new_ca, old_ca);
        assert_ne!(store.get_field("postgres_cert", "certificate").unwrap(), cert);
        assert_eq!(store.get_field("postgres_cert", "ca").unwrap(), new_ca);
    }

    #[test]
    fn test_supplied_values_never_regenerated() {
        let mut store = VariableStore::new();
        store.insert("pw", Value::from("fixed"));
        store.generate(&definitions("- {name: pw, type: password}")).unwrap();
        assert_eq!(store.get("pw"), Some(&Value::from("fixed")));
    }

    #[test]
    fn test_unknown_ca_fails() {
        let mut store = VariableStore::new();
        let err = store
            .generate(&definitions(
                "- {name: c, type: certificate, options: {ca: nope, common_name: c}}",
            ))
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingVariables(ref n) if n == &vec!["nope".to_string()]));
    }

    #[test]
    fn test_non_ca_signer_rejected() {
        let mut store = VariableStore::new();
        let err = store
            .generate(&definitions(
                r#"
- {name: leaf, type: certificate, options: {common_name: leaf}}
- {name: child, type: certificate, options: {ca: leaf, common_name: child}}
"#,
            ))
            .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidVariable(_)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let parsed: Result<Vec<VariableDefinition>, _> =
            serde_yaml::from_str("- {name: x, type: rsa}");
        assert!(parsed.is_err());
        assert_eq!(
            definitions("- {name: x, type: ssh}")[0].kind,
            VariableKind::Ssh
        );
    }
}

mod manifest_tests {
    use super::*;

    const TEMPLATE: &str = r#"
name: template
releases:
- name: postgres
  version: latest
- name: os-conf
  version: latest
instance_groups:
- name: postgres
  jobs:
  - name: postgres
    properties:
      databases:
        roles:
        - name: ((defuser_name))
      host: ((postgres_host))
      key: ((sshkey.public_key))
variables:
- name: sshkey
  type: ssh
"#;

    #[test]
    fn test_name_required() {
        let manifest = Manifest::parse("releases: []").unwrap();
        assert!(matches!(
            manifest.name(),
            Err(ManifestError::MissingDeploymentName)
        ));
        let manifest = Manifest::parse("name: ''").unwrap();
        assert!(manifest.name().is_err());
    }

    #[test]
    fn test_set_name_and_release_versions() {
        let mut manifest = Manifest::parse(TEMPLATE).unwrap();
        manifest.set_name("pgats-test");
        let overrides = BTreeMap::from([("postgres".to_string(), "30".to_string())]);
        let defaults = BTreeMap::from([("postgres".to_string(), "latest".to_string())]);
        manifest.set_release_versions(&overrides, &defaults);

        assert_eq!(manifest.name().unwrap(), "pgats-test");
        assert_eq!(manifest.value()["releases"][0]["version"], Value::from("30"));
        assert_eq!(manifest.value()["releases"][1]["version"], Value::from("latest"));
    }

    #[test]
    fn test_apply_cloud_config() {
        let mut manifest = Manifest::parse(TEMPLATE).unwrap();
        manifest.apply_cloud_config(&CloudConfig::default()).unwrap();
        let group = manifest.instance_group("postgres").unwrap();
        assert_eq!(group["azs"], yaml("[z1]"));
        assert_eq!(group["vm_type"], Value::from("m3.medium"));
        assert_eq!(group["persistent_disk_type"], Value::from("10GB"));
        assert!(group["networks"].is_sequence());
    }

    #[test]
    fn test_evaluate_generates_and_interpolates() {
        let manifest = Manifest::parse(TEMPLATE).unwrap();
        assert!(manifest.contains_variables());

        let mut store = VariableStore::new();
        let evaluated = manifest
            .evaluate(
                &vars(&[("defuser_name", "pgadmin"), ("postgres_host", "1.1.1.1")]),
                &mut store,
                &[],
                EvaluateOptions {
                    expect_all_keys: true,
                },
            )
            .unwrap();

        let props = &evaluated.value()["instance_groups"][0]["jobs"][0]["properties"];
        assert_eq!(props["databases"]["roles"][0]["name"], Value::from("pgadmin"));
        assert_eq!(props["host"], Value::from("1.1.1.1"));
        assert_eq!(
            props["key"].as_str(),
            store.get_field("sshkey", "public_key")
        );
        // The template itself is not modified
        assert_eq!(
            manifest.value()["instance_groups"][0]["jobs"][0]["properties"]["host"],
            Value::from("((postgres_host))")
        );
    }

    #[test]
    fn test_evaluate_reports_missing_scalars() {
        let manifest = Manifest::parse(TEMPLATE).unwrap();
        let err = manifest
            .evaluate(
                &Mapping::new(),
                &mut VariableStore::new(),
                &[],
                EvaluateOptions {
                    expect_all_keys: true,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingVariables(ref n) if n.len() == 2));
    }
}
