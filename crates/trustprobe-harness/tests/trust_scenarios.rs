//! Transport-trust end-to-end tests

use std::time::Duration;

use trustprobe_harness::{
    expected_pull_error, ClientOutcome, ClientUnderTest, Platform, PingFailure, RegistryClient,
    ScenarioError, TestCertificates, TrustFailure, TrustScenario, TrustServer, TrustServerConfig,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing and crypto provider for tests
fn init_test() {
    // Install rustls crypto provider (ignore if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("trustprobe_harness=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_plaintext_server_rejected() {
    init_test();

    let client = RegistryClient::untrusting(CLIENT_TIMEOUT).unwrap();
    let report = TrustScenario::plaintext(Platform::Other)
        .run(&client)
        .await
        .expect("plaintext scenario failed");

    assert!(report
        .stderr
        .ends_with("http: server gave HTTP response to HTTPS client\n"));
    assert!(report.stderr.starts_with(&format!(
        "Error: pinging container registry {}: ",
        report.registry
    )));
}

#[tokio::test]
async fn test_unknown_certificate_rejected() {
    init_test();

    let dir = tempfile::tempdir().unwrap();
    let certs = TestCertificates::self_signed("test.podman.io").unwrap();
    let material = certs.write_to(dir.path()).unwrap();

    // rustls wording matches the non-Darwin verifier on every platform
    let client = RegistryClient::untrusting(CLIENT_TIMEOUT).unwrap();
    let report = TrustScenario::untrusted(material, "test.podman.io", Platform::Other)
        .run(&client)
        .await
        .expect("untrusted certificate scenario failed");

    assert!(report
        .stderr
        .ends_with("certificate signed by unknown authority\n"));
}

#[tokio::test]
async fn test_trusted_client_is_logged() {
    init_test();

    let dir = tempfile::tempdir().unwrap();
    let certs = TestCertificates::ca_signed("localhost").unwrap();
    let material = certs.write_to(dir.path()).unwrap();

    let (mut server, completion) = TrustServer::start(TrustServerConfig::tls(material))
        .await
        .unwrap();
    assert!(server.is_tls());

    let client =
        RegistryClient::trusting(certs.ca_cert_pem.as_deref().unwrap(), CLIENT_TIMEOUT).unwrap();
    let resp = client.ping(server.addr()).await.expect("trusted ping failed");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body.as_ref(), b"Hello");

    server.stop();
    completion.wait().await.unwrap();
    assert_eq!(server.recorded_paths(), vec!["/v2/".to_string()]);
}

#[tokio::test]
async fn test_in_memory_material_with_ca_file_client() {
    init_test();

    let dir = tempfile::tempdir().unwrap();
    let certs = TestCertificates::ca_signed("localhost").unwrap();
    let ca_path = certs.write_ca_to(dir.path()).unwrap();

    let (mut server, completion) =
        TrustServer::start(TrustServerConfig::tls(certs.pem_material()))
            .await
            .unwrap();
    assert!(server.is_tls());

    let client = RegistryClient::trusting_file(&ca_path, CLIENT_TIMEOUT).unwrap();
    let resp = client.ping(server.addr()).await.expect("trusted ping failed");
    assert_eq!(resp.status, 200);

    server.stop();
    completion.wait().await.unwrap();
    assert_eq!(server.recorded_paths(), vec!["/v2/".to_string()]);
}

#[tokio::test]
async fn test_unrelated_ca_file_still_rejected() {
    init_test();

    let dir = tempfile::tempdir().unwrap();
    let other_ca = TestCertificates::ca_signed("localhost").unwrap();
    let ca_path = other_ca.write_ca_to(dir.path()).unwrap();
    let certs = TestCertificates::self_signed("test.podman.io").unwrap();

    let client = RegistryClient::trusting_file(&ca_path, CLIENT_TIMEOUT).unwrap();
    let report = TrustScenario::untrusted(certs.pem_material(), "test.podman.io", Platform::Other)
        .run(&client)
        .await
        .expect("unrelated CA should not be trusted");

    assert!(report
        .stderr
        .ends_with("certificate signed by unknown authority\n"));
}

#[tokio::test]
async fn test_trusting_scenario_reports_accepted_client() {
    init_test();

    let dir = tempfile::tempdir().unwrap();
    let certs = TestCertificates::ca_signed("localhost").unwrap();
    let material = certs.write_to(dir.path()).unwrap();

    let client =
        RegistryClient::trusting(certs.ca_cert_pem.as_deref().unwrap(), CLIENT_TIMEOUT).unwrap();
    let err = TrustScenario::untrusted(material, "localhost", Platform::Other)
        .run(&client)
        .await
        .unwrap_err();

    match err {
        ScenarioError::RequestsLogged(paths) => assert_eq!(paths, vec!["/v2/".to_string()]),
        other => panic!("unexpected scenario error: {}", other),
    }
}

#[tokio::test]
async fn test_handshake_failure_keeps_server_running() {
    init_test();

    let dir = tempfile::tempdir().unwrap();
    let certs = TestCertificates::ca_signed("localhost").unwrap();
    let material = certs.write_to(dir.path()).unwrap();

    let (mut server, completion) = TrustServer::start(TrustServerConfig::tls(material))
        .await
        .unwrap();

    let untrusting = RegistryClient::untrusting(CLIENT_TIMEOUT).unwrap();
    for _ in 0..3 {
        let err = untrusting.ping(server.addr()).await.unwrap_err();
        assert!(matches!(err.cause, PingFailure::UnknownAuthority));
    }
    assert!(server.request_log().is_empty());

    // Same server still completes a trusted handshake afterwards
    let trusting =
        RegistryClient::trusting(certs.ca_cert_pem.as_deref().unwrap(), CLIENT_TIMEOUT).unwrap();
    trusting.ping(server.addr()).await.expect("trusted ping failed");

    server.stop();
    completion.wait().await.unwrap();
    assert_eq!(server.recorded_paths().len(), 1);
}

#[tokio::test]
async fn test_plaintext_round_trip() {
    init_test();

    let (mut server, completion) = TrustServer::start(TrustServerConfig::plaintext())
        .await
        .unwrap();

    let http_client = reqwest::Client::builder().no_proxy().build().unwrap();
    for i in 0..3 {
        let resp = http_client
            .get(format!("http://{}/request/{}", server.addr(), i))
            .send()
            .await
            .expect("HTTP request failed");
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"Hello");
    }

    assert!(server.stop());
    completion.wait().await.unwrap();

    assert_eq!(
        server.recorded_paths(),
        vec!["/request/0", "/request/1", "/request/2"]
    );
}

#[tokio::test]
async fn test_registry_client_outcome_text() {
    init_test();

    let (mut server, completion) = TrustServer::start(TrustServerConfig::plaintext())
        .await
        .unwrap();
    let client = RegistryClient::untrusting(CLIENT_TIMEOUT).unwrap();

    let outcome = client.fetch(server.addr()).await;
    let expected = expected_pull_error(server.addr(), &TrustFailure::PlaintextServer, Platform::Other);
    assert_eq!(outcome, ClientOutcome::Rejected { stderr: expected });

    server.stop();
    completion.wait().await.unwrap();
    assert!(server.recorded_paths().is_empty());
}

/// A client that reports a fixed stderr, to check the comparison itself
struct ScriptedClient(String);

#[async_trait::async_trait]
impl ClientUnderTest for ScriptedClient {
    async fn fetch(&self, _registry: std::net::SocketAddr) -> ClientOutcome {
        ClientOutcome::Rejected {
            stderr: self.0.clone(),
        }
    }
}

#[tokio::test]
async fn test_wrong_error_text_is_reported() {
    init_test();

    let client = ScriptedClient("Error: wrong manifest type for disk artifact: text/plain\n".into());
    let err = TrustScenario::plaintext(Platform::Other)
        .run(&client)
        .await
        .unwrap_err();

    match err {
        ScenarioError::ErrorMismatch { expected, actual } => {
            assert!(expected.ends_with("http: server gave HTTP response to HTTPS client\n"));
            assert!(actual.contains("wrong manifest type"));
        }
        other => panic!("unexpected scenario error: {}", other),
    }
}
