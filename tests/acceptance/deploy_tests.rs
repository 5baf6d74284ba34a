//! Fresh deployments, SSL and certificate authentication

use pgats::manifest::ops;
use pgats::postgres::SslMode;
use pgats::validator::Validator;
use pgats::wait::{CERT_AUTH_INTERVAL, CERT_AUTH_TIMEOUT, eventually};

use crate::{Scenario, setup};

const LOCAL_PSQL: &str = "source /var/vcap/jobs/postgres/bin/pgconfig.sh; export PGPASSWORD='{password}'; $PACKAGE_DIR/bin/psql -p 5524 -U {user} postgres -c 'select now()'";

fn local_psql(user: &str, password: &str) -> String {
    LOCAL_PSQL
        .replace("{user}", user)
        .replace("{password}", password)
}

/// Test: A fresh deployment matches its manifest and trusts vcap locally
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_fresh_deployment() {
    let ctx = setup();
    let mut scenario = Scenario::deploy(ctx.deploy_helper("fresh", None)).await;

    let data = scenario.db.get_data().await.expect("Failed to read server state");
    let validator = Validator::new(
        scenario.props.databases.clone(),
        data,
        &scenario.db,
        ctx.postgresql_version(),
    );
    validator.validate_all().await.expect("Deployment does not match manifest");

    let output = scenario.ssh(&local_psql("vcap", "fake")).await;
    assert!(output.success, "vcap local connection failed: {:?}", output);

    let defuser = scenario.variable("defuser_name");
    let output = scenario.ssh(&local_psql(&defuser, "fake")).await;
    assert!(!output.success, "untrusted local connection succeeded");

    let password = scenario.variable("defuser_password");
    let output = scenario.ssh(&local_psql(&defuser, &password)).await;
    assert!(output.success, "password local connection failed: {:?}", output);

    scenario.cleanup().await;
}

/// Test: The release rejects a role with an unknown permission
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_bad_role_fails_to_deploy() {
    let ctx = setup();
    let mut scenario = Scenario::deploy(ctx.deploy_helper("bad-role", None)).await;

    scenario
        .helper
        .set_op_defs(ops::add_bad_role_ops().unwrap());
    let result = scenario.helper.deploy().await;
    assert!(result.is_err(), "deploying a bad role should fail");

    scenario.cleanup().await;
}

/// Test: Server certificates are verified against the generated CA
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_ssl_connections() {
    let ctx = setup();
    let mut helper = ctx.deploy_helper("ssl", None);
    helper.set_op_defs(ops::ssl_ops().unwrap());
    let mut scenario = Scenario::deploy(helper).await;

    scenario
        .db
        .get_postgresql_version()
        .await
        .expect("Non-secure connection failed");

    let bad_ca_name = scenario.variable("certs_bad_ca");
    let bad_ca = scenario.generated(&bad_ca_name, "certificate");
    let bad_ca_path = scenario.temp_file(&bad_ca);
    let result = async {
        scenario
            .db
            .change_ssl_mode(SslMode::VerifyFull, Some(&bad_ca_path))
            .await?;
        scenario.db.get_postgresql_version().await
    }
    .await;
    let err = result.expect_err("A certificate from another CA was accepted");
    assert!(err.to_string().contains("x509"), "unexpected error: {}", err);

    let ca = scenario.generated("postgres_cert", "ca");
    let ca_path = scenario.temp_file(&ca);
    for mode in [SslMode::VerifyCa, SslMode::VerifyFull] {
        scenario
            .db
            .change_ssl_mode(mode, Some(&ca_path))
            .await
            .unwrap_or_else(|e| panic!("{} connection failed: {}", mode, e));
        scenario.db.get_postgresql_version().await.unwrap();
    }

    scenario.cleanup().await;
}

/// Test: Client certificates authenticate roles by name or mapped common name
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a BOSH director"]
async fn test_mutual_tls() {
    let ctx = setup();
    let mut helper = ctx.deploy_helper("mtls", None);
    helper.set_op_defs(ops::mutual_ssl_ops().unwrap());
    let mut scenario = Scenario::deploy(helper).await;

    let ca = scenario.generated("postgres_cert", "ca");
    let ca_path = scenario.temp_file(&ca);
    scenario
        .db
        .change_ssl_mode(SslMode::VerifyFull, Some(&ca_path))
        .await
        .unwrap();

    let matching_name = scenario.variable("certs_matching_name");
    let (cert, key) = scenario.client_certificate("certs_matching_certs");
    scenario
        .db
        .set_cert_user_certificates(&matching_name, &cert, &key);
    let db = tokio::sync::Mutex::new(scenario.db);
    let db_ref = &db;
    eventually(CERT_AUTH_TIMEOUT, CERT_AUTH_INTERVAL, move || async move {
        let mut db = db_ref.lock().await;
        db.use_cert_authentication(true).await?;
        db.get_postgresql_version().await
    })
    .await
    .expect("Certificate authentication never succeeded");
    scenario.db = db.into_inner();

    let (cert, key) = scenario.client_certificate("certs_wrong_certs");
    scenario
        .db
        .set_cert_user_certificates(&matching_name, &cert, &key);
    let result = async {
        scenario.db.use_cert_authentication(true).await?;
        scenario.db.get_postgresql_version().await
    }
    .await;
    let err = result.expect_err("A certificate with the wrong common name was accepted");
    assert!(
        err.to_string().contains("certificate authentication failed"),
        "unexpected error: {}",
        err
    );

    let mapped_name = scenario.variable("certs_mapped_name");
    let (cert, key) = scenario.client_certificate("certs_mapped_certs");
    scenario
        .db
        .set_cert_user_certificates(&mapped_name, &cert, &key);
    scenario.db.use_cert_authentication(true).await.unwrap();
    scenario.db.get_postgresql_version().await.unwrap();

    scenario.cleanup().await;
}
