//! End-to-end tests for the agent driver against a mock controller.
//!
//! These tests verify the full flow:
//! 1. First-run registration persists the identity
//! 2. Restarts reuse the identity without registering again
//! 3. The bundle poller feeds the reconcile loops, which delete orphans
//! 4. Shutdown during registration and after start is clean

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use deviceplane_agent::agent::{Agent, AgentError, ShutdownSignal};
use deviceplane_agent::config::{Config, RegistrationToken};
use deviceplane_agent::identity::IdentityStore;
use deviceplane_agent::reconciler::LoopState;
use deviceplane_agent::supervisor::LoggingSupervisor;
use deviceplane_id::ProjectId;
use serde_json::json;
use wiremock::matchers::{basic_auth, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEVICE_PREFIX: &str = "/api/projects/prj_1/devices/dev_1";

fn test_config(server: &MockServer, dir: &Path) -> Config {
    let mut config = Config::new(
        format!("{}/api", server.uri()),
        ProjectId::parse("prj_1").unwrap(),
    );
    config.registration_token = Some(RegistrationToken::new("T"));
    config.state_dir = dir.join("state");
    config.conf_dir = dir.join("conf");
    config.os_release_path = dir.join("os-release");
    config.registration_retry_interval = Duration::from_millis(50);
    config.bundle_poll_interval = Duration::from_millis(50);
    config.reconciler.tick_interval = Duration::from_millis(50);
    config.stop_grace = Duration::from_secs(5);
    config
}

async fn mount_registration(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/projects/prj_1/devices/register"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"deviceId": "dev_1", "accessKey": "k"})),
        )
        .mount(server)
        .await;
}

async fn mount_device_info(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("{DEVICE_PREFIX}/info")))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Wait until the server has received a request matching `method` and `path`.
async fn wait_for_request(server: &MockServer, method: &str, path: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests
            .iter()
            .any(|r| r.method.as_str() == method && r.url.path() == path)
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {method} {path}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn count_requests(requests: &[wiremock::Request], method: &str, path: &str) -> usize {
    requests
        .iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == path)
        .count()
}

#[tokio::test]
async fn test_first_run_registers_and_persists_identity() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_registration(&server).await;
    mount_device_info(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{DEVICE_PREFIX}/bundle")))
        .and(basic_auth("k", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let config = test_config(&server, dir.path());
    let state_dir = config.state_dir.clone();
    let agent = Agent::start(
        config,
        Arc::new(LoggingSupervisor::new()),
        None,
        ShutdownSignal::new(),
    )
    .await
    .unwrap();

    assert_eq!(agent.identity().device_id.as_str(), "dev_1");
    let stored = IdentityStore::new(&state_dir).load().await.unwrap().unwrap();
    assert_eq!(stored.device_id.as_str(), "dev_1");
    assert_eq!(stored.access_key.expose(), "k");

    wait_for_request(&server, "GET", &format!("{DEVICE_PREFIX}/bundle")).await;
    assert!(agent.stop().await.is_empty());

    // Restart without a token: the stored identity is reused.
    let mut config = test_config(&server, dir.path());
    config.registration_token = None;
    let agent = Agent::start(
        config,
        Arc::new(LoggingSupervisor::new()),
        None,
        ShutdownSignal::new(),
    )
    .await
    .unwrap();
    assert_eq!(agent.identity().device_id.as_str(), "dev_1");
    assert!(agent.stop().await.is_empty());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        count_requests(&requests, "POST", "/api/projects/prj_1/devices/register"),
        1
    );
}

#[tokio::test]
async fn test_registration_retries_until_success() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("POST"))
        .and(path("/api/projects/prj_1/devices/register"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_registration(&server).await;
    mount_device_info(&server).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let agent = Agent::start(
        test_config(&server, dir.path()),
        Arc::new(LoggingSupervisor::new()),
        None,
        ShutdownSignal::new(),
    )
    .await
    .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        count_requests(&requests, "POST", "/api/projects/prj_1/devices/register"),
        3
    );
    agent.stop().await;
}

#[tokio::test]
async fn test_shutdown_during_registration() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = test_config(&server, dir.path());
    let state_dir = config.state_dir.clone();
    let shutdown = ShutdownSignal::new();

    let start = tokio::spawn(Agent::start(
        config,
        Arc::new(LoggingSupervisor::new()),
        None,
        shutdown.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown.trigger();

    let result = tokio::time::timeout(Duration::from_secs(2), start)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AgentError::Canceled)));
    assert!(IdentityStore::new(&state_dir).load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_orphaned_observations_are_deleted() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_registration(&server).await;
    mount_device_info(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{DEVICE_PREFIX}/bundle")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "applications": [
                {
                    "application": {"id": "A"},
                    "latestRelease": {"id": "r1", "config": {"web": {"image": "nginx"}}}
                }
            ],
            "applicationStatuses": [
                {"applicationId": "A", "currentReleaseId": "r1"},
                {"applicationId": "B", "currentReleaseId": "r1"}
            ],
            "serviceStatuses": [
                {"applicationId": "A", "service": "web", "currentReleaseId": "r1"},
                {"applicationId": "A", "service": "db", "currentReleaseId": "r1"}
            ],
            "serviceStates": [
                {"applicationId": "A", "service": "web", "state": "running"},
                {"applicationId": "C", "service": "worker", "state": "exited"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(format!("^{DEVICE_PREFIX}/applications/.*")))
        .and(basic_auth("k", ""))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let agent = Agent::start(
        test_config(&server, dir.path()),
        Arc::new(LoggingSupervisor::new()),
        None,
        ShutdownSignal::new(),
    )
    .await
    .unwrap();

    let orphans = [
        format!("{DEVICE_PREFIX}/applications/B/deviceapplicationstatuses"),
        format!("{DEVICE_PREFIX}/applications/A/services/db/deviceservicestatuses"),
        format!("{DEVICE_PREFIX}/applications/C/services/worker/deviceservicestates"),
    ];
    for orphan in &orphans {
        wait_for_request(&server, "DELETE", orphan).await;
    }

    assert!(agent
        .loop_states()
        .iter()
        .all(|(_, state)| *state == LoopState::Reconciling));

    let aborted = agent.stop().await;
    assert!(aborted.is_empty());

    // Desired observations are never deleted.
    let requests = server.received_requests().await.unwrap();
    let deletes: Vec<String> = requests
        .iter()
        .filter(|r| r.method.as_str() == "DELETE")
        .map(|r| r.url.path().to_string())
        .collect();
    assert!(deletes.iter().all(|p| orphans.contains(p)));
}
