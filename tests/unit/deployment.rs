//! Unit tests for deployment handling against the in-memory director

use std::collections::BTreeMap;
use std::sync::Arc;

use pgats::director::{DiffLine, DirectorError, JobState};
use pgats::manifest::{EvaluateOptions, Manifest, ManifestError};
use pgats::{DeploymentData, Error};
use serde_yaml::{Mapping, Value};

use crate::common::*;

fn deployment(director: Arc<FakeDirector>) -> DeploymentData {
    let file = write_manifest(SIMPLE_MANIFEST);
    DeploymentData::from_file(
        director,
        &test_config(),
        file.path(),
        "pgats-unit",
        &BTreeMap::new(),
    )
    .unwrap()
}

fn job_props(data: &DeploymentData) -> pgats::Properties {
    data.jobs_properties()
        .first_job_properties("postgres")
        .unwrap()
}

fn scenario_vars() -> Mapping {
    let mut vars = Mapping::new();
    vars.insert("defuser_name".into(), "pgadmin".into());
    vars.insert("defuser_password".into(), "pw".into());
    vars
}

mod manifest_tests {
    use super::*;

    #[test]
    fn test_from_file_prepares_manifest() {
        let data = deployment(Arc::new(FakeDirector::new()));
        assert_eq!(data.name(), "pgats-unit");
        let manifest = data.manifest().value();
        assert_eq!(manifest["name"], Value::from("pgats-unit"));
        assert_eq!(manifest["releases"][0]["version"], Value::from("latest"));
        assert_eq!(
            manifest["instance_groups"][0]["networks"][0]["name"],
            Value::from("private")
        );
        assert!(!data.contains_variables());
    }

    #[test]
    fn test_release_override() {
        let file = write_manifest(SIMPLE_MANIFEST);
        let releases = BTreeMap::from([("postgres".to_string(), "28".to_string())]);
        let data = DeploymentData::from_file(
            Arc::new(FakeDirector::new()),
            &test_config(),
            file.path(),
            "pgats-unit",
            &releases,
        )
        .unwrap();
        assert_eq!(
            data.manifest().value()["releases"][0]["version"],
            Value::from("28")
        );
    }

    #[test]
    fn test_unnamed_manifest_rejected() {
        let manifest = Manifest::parse("instance_groups: []").unwrap();
        let err = DeploymentData::new(Arc::new(FakeDirector::new()), manifest).unwrap_err();
        assert!(matches!(
            err,
            Error::ManifestError(ManifestError::MissingDeploymentName)
        ));
    }

    #[test]
    fn test_evaluate_keeps_template() {
        let mut data = deployment(Arc::new(FakeDirector::new()));
        data.evaluate_template(&scenario_vars(), &[], EvaluateOptions::default())
            .unwrap();
        let props = job_props(&data);
        assert_eq!(props.databases.roles[0].name, "pgadmin");

        let mut other = Mapping::new();
        other.insert("defuser_name".into(), "someone".into());
        data.evaluate_template(&other, &[], EvaluateOptions::default())
            .unwrap();
        assert_eq!(
            job_props(&data).databases.roles[0].name,
            "someone"
        );
    }

    #[test]
    fn test_generated_variables_survive_template_reload() {
        let mut data = deployment(Arc::new(FakeDirector::new()));
        let mut manifest = Manifest::parse(BOOTSTRAP_MANIFEST).unwrap();
        manifest.set_name("pgats-unit");
        data.set_manifest(manifest.clone()).unwrap();
        data.evaluate_template(&scenario_vars(), &[], EvaluateOptions::default())
            .unwrap();
        let key = data.get_variable("sshkey").cloned().unwrap();

        data.set_manifest(manifest).unwrap();
        data.evaluate_template(&scenario_vars(), &[], EvaluateOptions::default())
            .unwrap();
        assert_eq!(data.get_variable("sshkey"), Some(&key));
        assert!(data.variables().contains("sshkey"));
    }
}

mod director_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_or_update_sends_manifest() {
        let director = Arc::new(FakeDirector::new());
        let mut data = deployment(director.clone());
        data.evaluate_template(&scenario_vars(), &[], EvaluateOptions::default())
            .unwrap();
        data.create_or_update().await.unwrap();

        let deployed = director.deployed();
        assert_eq!(deployed.len(), 1);
        let sent = Manifest::parse(&deployed[0]).unwrap();
        assert_eq!(sent.name().unwrap(), "pgats-unit");
        assert_eq!(&sent, data.manifest());
    }

    #[tokio::test]
    async fn test_create_or_update_propagates_failure() {
        let director = Arc::new(FakeDirector::new());
        director.fail_updates("fake-error");
        let data = deployment(director);
        let err = data.create_or_update().await.unwrap_err();
        assert!(matches!(
            err,
            Error::DirectorError(DirectorError::Status { ref body, .. }) if body == "fake-error"
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let director = Arc::new(FakeDirector::new());
        deployment(director.clone()).delete().await.unwrap();
        assert_eq!(director.deleted(), vec!["pgats-unit".to_string()]);
    }

    #[tokio::test]
    async fn test_vm_host_prefers_dns() {
        let director = Arc::new(FakeDirector::with_vms(vec![postgres_vm(
            "10.0.0.5",
            Some("q-s0.postgres.private.pgats-unit.bosh"),
        )]));
        let data = deployment(director);
        assert_eq!(data.vm_address("postgres").await.unwrap(), "10.0.0.5");
        assert_eq!(
            data.vm_host("postgres").await.unwrap(),
            "q-s0.postgres.private.pgats-unit.bosh"
        );
    }

    #[tokio::test]
    async fn test_vm_host_falls_back_to_ip() {
        let director = Arc::new(FakeDirector::with_vms(vec![postgres_vm("10.0.0.5", None)]));
        let data = deployment(director);
        assert!(data.vm_dns("postgres").await.is_err());
        assert_eq!(data.vm_host("postgres").await.unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_missing_vm() {
        let data = deployment(Arc::new(FakeDirector::new()));
        let err = data.vm_address("postgres").await.unwrap_err();
        assert!(matches!(
            err,
            Error::DirectorError(DirectorError::VmNotFound(ref vm)) if vm == "postgres"
        ));
        assert!(err.to_string().starts_with(pgats::director::VM_NOT_PRESENT_MSG));
    }

    #[tokio::test]
    async fn test_process_state() {
        let director = Arc::new(FakeDirector::with_vms(vec![postgres_vm("10.0.0.5", None)]));
        let data = deployment(director);
        assert!(data.is_vm_process_running("postgres", "postgres").await.unwrap());
        assert!(!data.is_vm_process_running("postgres", "pg_janitor").await.unwrap());
        assert!(matches!(
            data.is_vm_process_running("postgres", "monit").await,
            Err(Error::DirectorError(DirectorError::ProcessNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_job_state_changes() {
        let director = Arc::new(FakeDirector::new());
        let data = deployment(director.clone());
        data.stop("postgres").await.unwrap();
        data.start("postgres").await.unwrap();
        data.restart("postgres").await.unwrap();
        let states: Vec<JobState> = director.job_changes().into_iter().map(|(_, _, s)| s).collect();
        assert_eq!(
            states,
            vec![JobState::Stopped, JobState::Started, JobState::Restarted]
        );
        assert!(director
            .job_changes()
            .iter()
            .all(|(d, j, _)| d == "pgats-unit" && j == "postgres"));
    }

    #[tokio::test]
    async fn test_resurrection_toggled_per_vm() {
        let mut backup = postgres_vm("10.0.0.7", None);
        backup.job_name = "backup".to_string();
        backup.id = "backup-id".to_string();
        let director = Arc::new(FakeDirector::with_vms(vec![
            postgres_vm("10.0.0.5", None),
            backup,
        ]));
        let data = deployment(director.clone());
        data.enable_resurrection(false).await.unwrap();

        let calls = director.resurrection();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, _, _, enabled)| !enabled));
        assert_eq!(calls[1].1, "backup");
        assert_eq!(calls[1].2, "backup-id");
    }

    #[tokio::test]
    async fn test_print_diffs() {
        let director = Arc::new(FakeDirector::new());
        director.set_diff(vec![
            DiffLine {
                text: "instance_groups:".to_string(),
                state: String::new(),
            },
            DiffLine {
                text: "  port: 6000".to_string(),
                state: "added".to_string(),
            },
        ]);
        let data = deployment(director);
        let lines = data.print_diffs().await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].to_string(), "+   port: 6000");
    }

    #[tokio::test]
    async fn test_postgres_url() {
        let director = Arc::new(FakeDirector::with_vms(vec![postgres_vm("10.0.0.5", None)]));
        let mut data = deployment(director);
        data.evaluate_template(&scenario_vars(), &[], EvaluateOptions::default())
            .unwrap();
        assert_eq!(
            data.postgres_url().await.unwrap(),
            "postgres://pgadmin:pw@10.0.0.5:5524/postgres?sslmode=disable"
        );
    }
}
