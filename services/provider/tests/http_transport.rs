//! Integration tests for the HTTP transport.
//!
//! Runs the transport against a local mock server and checks the requests it
//! sends and how it classifies the responses.

use std::sync::Arc;
use std::time::Duration;

use flintlock_provider::client::{HttpTransport, RemoteStatus, TransportClient};
use flintlock_provider::config::{AuthToken, ClientConfig, Configured, ProviderConfig};
use flintlock_provider::spec::{VmSpec, VmSpecPatch};
use flintlock_provider::{Provider, RawVmConfig, TransportError};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn remote_vm(uid: &str, id: &str) -> Value {
    json!({
        "uid": uid,
        "id": id,
        "status": "running",
        "vcpu": 2,
        "memory_mb": 512,
        "image": "img",
        "labels": {"team": "a"},
        "ip_address": "10.0.0.2",
        "pid": 4242
    })
}

fn transport(server: &MockServer, token: Option<&str>) -> HttpTransport {
    let config = ClientConfig::new(&server.uri(), token.map(AuthToken::new))
        .unwrap()
        .with_request_timeout(Duration::from_secs(2));
    HttpTransport::new(Arc::new(config)).unwrap()
}

#[tokio::test]
async fn test_create_sends_spec_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1alpha1/microvm"))
        .and(header("authorization", "Bearer s3cret"))
        .and(body_json(json!({
            "id": "vm-1",
            "vcpu": 2,
            "memory_mb": 512,
            "image": "img",
            "network_interfaces": [],
            "labels": {"team": "a"}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(remote_vm("uid-1", "vm-1")))
        .expect(1)
        .mount(&server)
        .await;

    let spec = VmSpec::new("vm-1", 2, 512, "img").with_label("team", "a");
    let vm = transport(&server, Some("s3cret")).create(&spec).await.unwrap();

    assert_eq!(vm.uid, "uid-1");
    assert_eq!(vm.status, RemoteStatus::Running);
    assert_eq!(vm.pid, Some(4242));
}

#[tokio::test]
async fn test_no_authorization_header_without_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1alpha1/microvm/uid-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_vm("uid-1", "vm-1")))
        .mount(&server)
        .await;

    transport(&server, None).get("uid-1").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_update_sends_only_patched_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/v1alpha1/microvm/uid-1"))
        .and(body_json(json!({"labels": {"team": "b"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_vm("uid-1", "vm-1")))
        .expect(1)
        .mount(&server)
        .await;

    let patch = VmSpecPatch {
        labels: Some([("team".to_string(), "b".to_string())].into()),
        ..Default::default()
    };
    transport(&server, None).update("uid-1", &patch).await.unwrap();
}

#[tokio::test]
async fn test_delete_treats_not_found_as_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1alpha1/microvm/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    assert!(transport(&server, None).delete("gone").await.is_ok());
}

#[tokio::test]
async fn test_remote_id_stays_in_its_path_segment() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1alpha1/microvm/a%2Fb%3Fforce=1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    transport(&server, None).delete("a/b?force=1").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].url.query().is_none());
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1alpha1/microvm/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1alpha1/microvm/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1alpha1/microvm/bad"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid uid"))
        .mount(&server)
        .await;

    let transport = transport(&server, None);
    assert!(matches!(transport.get("missing").await, Err(TransportError::NotFound(_))));
    assert!(matches!(transport.get("busy").await, Err(TransportError::Transient(_))));
    match transport.get("bad").await {
        Err(TransportError::Permanent(message)) => assert!(message.contains("invalid uid")),
        other => panic!("expected permanent error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transient() {
    // Nothing listens on port 1
    let config = ClientConfig::new("http://127.0.0.1:1", None).unwrap();
    let transport = HttpTransport::new(Arc::new(config)).unwrap();

    assert!(matches!(transport.get("uid-1").await, Err(TransportError::Transient(_))));
}

#[tokio::test]
async fn test_provider_over_http_retries_transient_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1alpha1/microvm"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1alpha1/microvm"))
        .respond_with(ResponseTemplate::new(201).set_body_json(remote_vm("uid-7", "vm-1")))
        .mount(&server)
        .await;

    let config = ProviderConfig {
        endpoint: Configured::Value(server.uri()),
        ..Default::default()
    };
    let provider = Provider::configure(&config, |_| None).unwrap();

    let result = provider
        .apply(&[RawVmConfig {
            id: Configured::Value("vm-1".to_string()),
            vcpu: Configured::Value(2),
            image: Configured::Value("img".to_string()),
            labels: Configured::Value([("team".to_string(), "a".to_string())].into()),
            ..Default::default()
        }])
        .await;

    assert!(result.diagnostics.is_empty(), "{}", result.diagnostics);
    assert_eq!(result.snapshot["vm-1"].remote_id, "uid-7");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
