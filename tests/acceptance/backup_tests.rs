//! Backup and restore through `bbr`

use std::path::PathBuf;

use pgats::bbr::Bbr;
use pgats::manifest::OpDefinition;
use pgats::manifest::ops;
use pgats::postgres::LoadType;
use tempfile::TempDir;

use crate::{Scenario, setup};

const RESTORE_PREFIX: &str = "restore";
const RESTORE_TABLE: &str = "restore_0";

/// A deployed scenario with a bbr runner working in a temp dir
struct BackupScenario {
    scenario: Scenario,
    bbr: Bbr,
    work_dir: TempDir,
}

impl BackupScenario {
    async fn deploy(prefix: &str, op_defs: Vec<OpDefinition>) -> Self {
        let ctx = setup();
        let mut helper = ctx.deploy_helper(prefix, None);
        helper.set_op_defs(op_defs);
        let mut scenario = Scenario::deploy(helper).await;

        let ca_cert_path = scenario.temp_file(&ctx.config.bosh.director_ca_cert);
        let work_dir = TempDir::new().expect("Failed to create bbr work dir");
        let bbr = Bbr::new(
            &ctx.config.bosh,
            ca_cert_path,
            scenario.helper.name(),
            work_dir.path(),
        );
        Self {
            scenario,
            bbr,
            work_dir,
        }
    }

    fn missing_artifact(&self) -> PathBuf {
        self.work_dir.path().join("doesnotexist")
    }

    async fn assert_backup_and_restore(&mut self) {
        let output = self.bbr.pre_backup_check().await.unwrap();
        assert!(output.success, "pre-backup-check failed: {:?}", output);

        let dbname = self.scenario.database_name();
        let db = &mut self.scenario.db;
        db.create_and_populate_tables_with_prefix(&dbname, LoadType::Test1, RESTORE_PREFIX)
            .await
            .unwrap();
        assert!(db.check_table_exist(RESTORE_TABLE, &dbname).await.unwrap());

        let output = self.bbr.backup().await.unwrap();
        assert!(output.success, "backup failed: {:?}", output);
        let artifacts = self.bbr.find_backup_artifacts().unwrap();
        let artifact = artifacts.first().expect("No backup artifact was written");

        db.drop_table(&dbname, RESTORE_TABLE).await.unwrap();

        let artifact_dir = artifact.parent().expect("Artifact has no parent dir");
        let output = self.bbr.restore(artifact_dir).await.unwrap();
        assert!(output.success, "restore failed: {:?}", output);

        // The restore replaces the database, so earlier connections are gone
        self.scenario.reconnect().await.unwrap();
        let db = &mut self.scenario.db;
        assert!(db.check_table_exist(RESTORE_TABLE, &dbname).await.unwrap());
        db.drop_table(&dbname, RESTORE_TABLE).await.unwrap();
    }

    async fn cleanup(self) {
        self.scenario.cleanup().await;
    }
}

/// Test: Without the bbr job nothing can be backed up or restored
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_bbr_disabled() {
    let backup = BackupScenario::deploy("bbr-off", Vec::new()).await;

    let output = backup.bbr.backup().await.unwrap();
    assert!(!output.success, "backup succeeded without the bbr job");

    let output = backup.bbr.restore(&backup.missing_artifact()).await.unwrap();
    assert!(!output.success, "restore succeeded without the bbr job");

    backup.cleanup().await;
}

/// Test: Colocated bbr job found through links
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_bbr_colocated_with_links() {
    let mut backup = BackupScenario::deploy("bbr-link", ops::bbr_ops().unwrap()).await;

    let output = backup.bbr.restore(&backup.missing_artifact()).await.unwrap();
    assert!(!output.success, "restore of a missing artifact succeeded");

    backup.assert_backup_and_restore().await;
    backup.cleanup().await;
}

/// Test: Colocated bbr job configured explicitly
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_bbr_colocated_without_links() {
    let mut backup = BackupScenario::deploy("bbr-nolink", ops::bbr_no_link_ops().unwrap()).await;
    backup.assert_backup_and_restore().await;
    backup.cleanup().await;
}

/// Test: bbr job on its own instance group, each connection variant
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_bbr_not_colocated() {
    let cloud = setup().config.cloud_config;
    let variants = [
        ("bbr-plain", ops::bbr_not_colocated_ops(&cloud).unwrap()),
        ("bbr-verify-ca", ops::bbr_ssl_verify_ca(&cloud).unwrap()),
        ("bbr-verify-full", ops::bbr_ssl_verify_full(&cloud).unwrap()),
        ("bbr-certs", ops::bbr_client_certs(&cloud, ops::MATCHING_CERTS).unwrap()),
    ];
    for (prefix, op_defs) in variants {
        tracing::info!(variant = prefix, "Backing up a non-colocated deployment");
        let mut backup = BackupScenario::deploy(prefix, op_defs).await;
        backup.assert_backup_and_restore().await;
        backup.cleanup().await;
    }
}
