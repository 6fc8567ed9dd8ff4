use futures::StreamExt;
use lumen_client::{
    CircuitBreakerConfig, CircuitState, ClientError, ClientOptions, GatewayConfig, NetworkGateway,
    RequestContext, ServiceRequest,
};
use mockito::Matcher;
use serde_json::json;
use std::time::Duration;

fn gateway_with_threshold(threshold: u32, recovery: Duration, trials: u32) -> NetworkGateway {
    NetworkGateway::new(GatewayConfig::default().with_breaker(CircuitBreakerConfig {
        failure_threshold: threshold,
        recovery_timeout: recovery,
        half_open_max_calls: trials,
    }))
}

/// Accepts connections and never writes a byte back.
async fn silent_listener() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_get_decodes_json_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/credits/me")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":{"balance":12.5,"status":"ACTIVE"}}"#)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let client = gateway.client(&server.url()).unwrap();
    let response = client.get("credits/me").await.unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["data"]["status"], "ACTIVE");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_open_circuit_skips_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/flaky")
        .with_status(503)
        .with_body(r#"{"detail":"overloaded"}"#)
        .expect(3)
        .create_async()
        .await;

    let gateway = gateway_with_threshold(3, Duration::from_secs(60), 1);
    let client = gateway.client(&server.url()).unwrap();

    for _ in 0..3 {
        let err = client.get("flaky").await.unwrap_err();
        match err {
            ClientError::Upstream { status_code, message } => {
                assert_eq!(status_code, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(client.breaker().state(), CircuitState::Open);

    let err = client.get("flaky").await.unwrap_err();
    assert!(matches!(err, ClientError::CircuitOpen { .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_half_open_trial_recovers() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("GET", "/svc")
        .with_status(500)
        .expect(2)
        .create_async()
        .await;

    let gateway = gateway_with_threshold(2, Duration::from_millis(50), 2);
    let client = gateway.client(&server.url()).unwrap();
    client.get("svc").await.unwrap_err();
    client.get("svc").await.unwrap_err();
    assert_eq!(client.breaker().state(), CircuitState::Open);
    failing.assert_async().await;
    failing.remove_async().await;

    let healthy = server
        .mock("GET", "/svc")
        .with_status(200)
        .with_body("{}")
        .expect(2)
        .create_async()
        .await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    client.get("svc").await.unwrap();
    assert_eq!(client.breaker().state(), CircuitState::HalfOpen);
    client.get("svc").await.unwrap();

    let snapshot = client.breaker().snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
    healthy.assert_async().await;
}

#[tokio::test]
async fn test_client_errors_leave_circuit_closed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/missing")
        .with_status(404)
        .with_body(r#"{"message":"no such thread"}"#)
        .expect(5)
        .create_async()
        .await;

    let gateway = gateway_with_threshold(2, Duration::from_secs(60), 1);
    let client = gateway.client(&server.url()).unwrap();
    for _ in 0..5 {
        let err = client.get("missing").await.unwrap_err();
        assert_eq!(err.status_code(), Some(404));
    }
    assert_eq!(client.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_connection_failure_counts_against_breaker() {
    let gateway = gateway_with_threshold(1, Duration::from_secs(60), 1);
    let client = gateway
        .client_with("http://127.0.0.1:1", ClientOptions::default().with_timeout(Duration::from_secs(2)))
        .unwrap();

    let err = client.get("anything").await.unwrap_err();
    assert!(matches!(err, ClientError::Connection { .. } | ClientError::Timeout { .. }));
    assert_eq!(client.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_unanswered_request_surfaces_timeout() {
    let base_url = silent_listener().await;
    let gateway = gateway_with_threshold(1, Duration::from_secs(60), 1);
    let client = gateway
        .client_with(&base_url, ClientOptions::default().with_timeout(Duration::from_millis(100)))
        .unwrap();

    let err = client.get("slow").await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }), "unexpected error: {err:?}");
    assert_eq!(client.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_cancelled_trial_gives_its_slot_back() {
    let base_url = silent_listener().await;
    let gateway = gateway_with_threshold(1, Duration::from_millis(50), 1);
    let client = gateway
        .client_with(&base_url, ClientOptions::default().with_timeout(Duration::from_secs(5)))
        .unwrap();

    client.breaker().record_failure();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let abandoned = tokio::time::timeout(Duration::from_millis(30), client.get("credits/me")).await;
    assert!(abandoned.is_err());
    assert_eq!(client.breaker().state(), CircuitState::HalfOpen);

    client.breaker().try_acquire().unwrap();
    client.breaker().record_success();
    assert_eq!(client.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_identity_headers_come_from_request_context() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/messages/t-1")
        .match_header("authorization", "Bearer tok-123")
        .match_header("x-user-id", "u-1")
        .match_header("x-tenant-id", "acme")
        .match_body(Matcher::PartialJson(json!({"role": "user"})))
        .with_status(201)
        .with_body(r#"{"data":{"id":"m-1"}}"#)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let client = gateway.client(&server.url()).unwrap();
    let ctx = RequestContext::new()
        .with_bearer_token("tok-123")
        .with_user_id("u-1")
        .with_tenant_id("acme");

    let response = ctx
        .scope(client.post("messages/t-1", &json!({"role": "user", "content": "hi"})))
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_vendor_clients_do_not_leak_identity() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/models")
        .match_header("authorization", Matcher::Missing)
        .match_header("x-user-id", Matcher::Missing)
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let client = gateway
        .client_with(&server.url(), ClientOptions::default().without_identity())
        .unwrap();

    RequestContext::new()
        .with_bearer_token("tok")
        .with_user_id("u-1")
        .scope(client.get("models"))
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_query_parameters_are_encoded() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/messages/t-9")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("skip".into(), "0".into()),
            Matcher::UrlEncoded("limit".into(), "10".into()),
            Matcher::UrlEncoded("group_by".into(), "bot_id".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"data":[]}"#)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let client = gateway.client(&server.url()).unwrap();
    client
        .send(
            ServiceRequest::get("messages/t-9")
                .query("skip", 0)
                .query("limit", 10)
                .query("group_by", "bot_id"),
        )
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_stream_yields_body_bytes() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("data: one\n\ndata: two\n\n")
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let client = gateway.client(&server.url()).unwrap();
    let response = client
        .stream(ServiceRequest::post("chat").json(&json!({"stream": true})).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut bytes = Vec::new();
    let mut stream = response.into_byte_stream();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(String::from_utf8(bytes).unwrap(), "data: one\n\ndata: two\n\n");
}

#[tokio::test]
async fn test_stream_rejects_error_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat")
        .with_status(401)
        .with_body(r#"{"message":"bad key"}"#)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let client = gateway.client(&server.url()).unwrap();
    let err = client.stream(ServiceRequest::post("chat")).await.err().unwrap();
    assert_eq!(err.status_code(), Some(401));
    assert_eq!(err.to_string(), "upstream returned 401: bad key");
}
