//! HTTP-level tests for the control plane client, against a wiremock
//! server speaking the control plane API.

use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelplane_worker_agent::client::{ClientError, ControlPlane, ControlPlaneClient};
use modelplane_worker_agent::config::Config;
use modelplane_worker_agent::patch::ModelInstancePatch;
use modelplane_worker_agent::ports::PortRange;
use modelplane_worker_agent::types::{EventType, InstanceState};

fn config(server: &MockServer) -> Config {
    Config {
        worker_id: 1,
        server_url: server.uri(),
        log_dir: "/tmp/modelplane-test".to_string(),
        service_port_range: PortRange {
            start: 40000,
            end: 41024,
        },
    }
}

fn instance_json(id: i64, state: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("llama-7b-{id}"),
        "model_id": 3,
        "model_name": "llama-7b",
        "worker_id": 1,
        "worker_ip": "10.0.0.5",
        "state": state
    })
}

#[tokio::test]
async fn test_get_instance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/model-instances/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(instance_json(7, "scheduled")))
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    let mi = client.get_instance(7).await.unwrap();
    assert_eq!(mi.id, 7);
    assert_eq!(mi.state, InstanceState::Scheduled);
    assert_eq!(mi.worker_id, Some(1));
}

#[tokio::test]
async fn test_get_instance_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/model-instances/7"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    assert!(matches!(
        client.get_instance(7).await,
        Err(ClientError::NotFound)
    ));
}

#[tokio::test]
async fn test_get_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 3,
            "name": "llama-7b",
            "backend": "vllm",
            "source": "/models/llama-7b",
            "restart_on_error": true
        })))
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    let model = client.get_model(3).await.unwrap();
    assert_eq!(model.name, "llama-7b");
    assert!(model.restart_on_error);
    assert!(model.backend_parameters.is_empty());
}

#[tokio::test]
async fn test_patch_sends_only_set_fields() {
    let server = MockServer::start().await;
    // Exact body match: unset patch fields must not appear on the wire.
    Mock::given(method("PATCH"))
        .and(path("/v1/model-instances/7"))
        .and(body_json(json!({
            "state": "initializing",
            "state_message": "",
            "port": 40001,
            "ports": [40001],
            "pid": 4200
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    let patch = ModelInstancePatch {
        state: Some(InstanceState::Initializing),
        state_message: Some(String::new()),
        port: Some(40001),
        ports: Some(vec![40001]),
        pid: Some(4200),
        ..Default::default()
    };
    client.patch_instance(7, &patch).await.unwrap();
}

#[tokio::test]
async fn test_patch_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/v1/model-instances/7"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    let patch = ModelInstancePatch::state_change(InstanceState::Running, "");
    assert!(matches!(
        client.patch_instance(7, &patch).await,
        Err(ClientError::NotFound)
    ));
}

#[tokio::test]
async fn test_server_error_surfaces_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/model-instances/7"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    match client.get_instance(7).await {
        Err(ClientError::Api { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_watch_stream_yields_events_until_close() {
    let server = MockServer::start().await;
    let body = format!(
        "{}\n{}\n",
        json!({"type": "CREATED", "data": instance_json(7, "scheduled")}),
        json!({"type": "DELETED", "data": instance_json(8, "running")}),
    );
    Mock::given(method("GET"))
        .and(path("/v1/model-instances"))
        .and(query_param("watch", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    let mut stream = client.watch_instances().await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.event_type, EventType::Created);
    assert_eq!(first.data.id, 7);

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.event_type, EventType::Deleted);
    assert_eq!(second.data.id, 8);

    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_watch_stream_handles_unterminated_final_line() {
    let server = MockServer::start().await;
    let body = json!({"type": "UPDATED", "data": instance_json(7, "running")}).to_string();
    Mock::given(method("GET"))
        .and(path("/v1/model-instances"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let client = ControlPlaneClient::new(&config(&server));
    let mut stream = client.watch_instances().await.unwrap();

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.event_type, EventType::Updated);
    assert!(stream.next().await.unwrap().is_none());
}
