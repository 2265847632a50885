//! End-to-end tests over real sockets, selected through the registry.

use ferry_core::{
    ChannelHandler, Endpoint, Method, RpcError, Server, Service, TransportRegistry, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn demo_service() -> Service {
    let service = Service::new();
    service
        .expose(
            Method::sync(|params| {
                let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
                Ok(Value::from(sum))
            }),
            Some("add"),
        )
        .unwrap();
    service
        .expose(
            Method::new(|params: Vec<Value>| async move {
                let f = params.into_iter().next().unwrap_or_default();
                f.call(vec![]).await
            }),
            Some("baz"),
        )
        .unwrap();
    service
}

async fn start(registry: &TransportRegistry, address: &str, service: Service) -> (Box<dyn Server>, String) {
    let server = registry
        .create_server(address, Arc::new(service))
        .unwrap_or_else(|e| panic!("create server for {}: {}", address, e));
    let bound = tokio::time::timeout(TIMEOUT, server.listen())
        .await
        .expect("listen timed out")
        .expect("listen failed");
    (server, bound.to_string())
}

async fn connect(registry: &TransportRegistry, address: &str) -> (Endpoint, Box<dyn ferry_core::Client>) {
    let endpoint = Endpoint::new();
    let handler: Arc<dyn ChannelHandler> = Arc::new(endpoint.clone());
    let client = registry
        .create_client(address, handler)
        .unwrap_or_else(|e| panic!("create client for {}: {}", address, e));
    tokio::time::timeout(TIMEOUT, client.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    (endpoint, client)
}

async fn exercise(endpoint: &Endpoint) {
    let sum = tokio::time::timeout(
        TIMEOUT,
        endpoint.invoke("add", vec![Value::from(23), Value::from(19)]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sum, Value::from(42));

    let f = Method::sync(|_| Ok(Value::from("baz")));
    let result = tokio::time::timeout(TIMEOUT, endpoint.invoke("baz", vec![Value::from(f)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::from("baz"));
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let registry = TransportRegistry::with_defaults();
    let (server, bound) = start(&registry, "tcp://127.0.0.1:0", demo_service()).await;
    assert!(bound.starts_with("tcp://127.0.0.1:"));

    let (endpoint, client) = connect(&registry, &bound).await;
    exercise(&endpoint).await;

    client.close();
    tokio::time::timeout(TIMEOUT, endpoint.closed()).await.unwrap();
    server.close().await;
}

#[tokio::test]
async fn test_http_end_to_end() {
    let registry = TransportRegistry::with_defaults();
    let (server, bound) = start(&registry, "http://127.0.0.1:0/rpc", demo_service()).await;
    assert!(bound.starts_with("http://127.0.0.1:"));
    assert!(bound.ends_with("/rpc"));

    let (endpoint, client) = connect(&registry, &bound).await;
    exercise(&endpoint).await;

    client.close();
    tokio::time::timeout(TIMEOUT, endpoint.closed()).await.unwrap();
    server.close().await;
}

const ADD_REQUEST_LINE: &str = "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"add\",\"params\":[23,19]}\n";

#[tokio::test]
async fn test_http_finite_post_gets_its_reply() {
    let registry = TransportRegistry::with_defaults();
    let (server, bound) = start(&registry, "http://127.0.0.1:0/rpc", demo_service()).await;

    let response = tokio::time::timeout(
        TIMEOUT,
        reqwest::Client::new().post(bound.as_str()).body(ADD_REQUEST_LINE).send(),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(response.status().is_success());

    let body = tokio::time::timeout(TIMEOUT, response.text())
        .await
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"], 42);

    server.close().await;
}

#[tokio::test]
async fn test_tcp_write_shutdown_still_gets_reply() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let registry = TransportRegistry::with_defaults();
    let (server, bound) = start(&registry, "tcp://127.0.0.1:0", demo_service()).await;
    let addr = bound.trim_start_matches("tcp://");

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(ADD_REQUEST_LINE.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut received = String::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_string(&mut received))
        .await
        .expect("server should close after replying")
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(received.trim()).unwrap();
    assert_eq!(reply["result"], 42);

    server.close().await;
}

#[tokio::test]
async fn test_server_calls_back_into_connected_clients() {
    let registry = TransportRegistry::with_defaults();
    let service = Service::new();
    let endpoints = Arc::new(Mutex::new(Vec::new()));
    let e = endpoints.clone();
    service.connected().on(move |endpoint: Endpoint| {
        e.lock().unwrap().push(endpoint);
    });
    let (server, bound) = start(&registry, "tcp://127.0.0.1:0", service).await;

    let accepted = Arc::new(AtomicUsize::new(0));
    let a = accepted.clone();
    server.connections().on(move |_| {
        a.fetch_add(1, Ordering::SeqCst);
    });

    let (client_endpoint, client) = connect(&registry, &bound).await;
    client_endpoint
        .expose(Method::sync(|_| Ok(Value::from("moo"))), Some("cow"))
        .unwrap();

    let server_side = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(endpoint) = endpoints.lock().unwrap().first().cloned() {
                return endpoint;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("server never saw the connection");

    let moo = tokio::time::timeout(TIMEOUT, server_side.invoke("cow", vec![]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moo, Value::from("moo"));
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    client.close();
    server.close().await;
}

#[tokio::test]
async fn test_connect_to_nothing_fails_eagerly() {
    let registry = TransportRegistry::with_defaults();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let endpoint = Endpoint::new();
    let client = registry
        .create_client(&format!("tcp://127.0.0.1:{}", port), Arc::new(endpoint.clone()))
        .unwrap();
    let err = tokio::time::timeout(TIMEOUT, client.connect())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport { .. }));
    // Nothing was bound, so the endpoint can still be used elsewhere.
    assert!(!endpoint.is_closed());
}

#[tokio::test]
async fn test_unsupported_scheme() {
    let registry = TransportRegistry::with_defaults();
    let err = registry
        .create_server("ws://127.0.0.1:0", Arc::new(Service::new()))
        .err()
        .expect("ws is not a registered transport");
    assert!(matches!(err, RpcError::NoSuitableFactory { kind: "server", .. }));
}
