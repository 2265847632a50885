//! End-to-end tests of two endpoints over an in-memory connection.

use ferry_core::codec::{decode_stream, encode_message, Decoded};
use ferry_core::protocol::{Message, SuccessMessage};
use ferry_core::{Connection, Endpoint, EndpointOptions, EventEmitter, Method, RpcError, Value};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn connected() -> (Endpoint, Endpoint) {
    let (left, right) = Connection::pair();
    let client = Endpoint::new();
    let server = Endpoint::new();
    client.bind(left).expect("client bind");
    server.bind(right).expect("server bind");
    (client, server)
}

/// Methods from the demo: foo, bar returns a function, baz calls its argument.
fn expose_demo(endpoint: &Endpoint) {
    endpoint
        .expose(Method::sync(|_| Ok(Value::from("foo"))), Some("foo"))
        .unwrap();
    endpoint
        .expose(
            Method::sync(|_| Ok(Value::from(Method::sync(|_| Ok(Value::from("bar")))))),
            Some("bar"),
        )
        .unwrap();
    endpoint
        .expose(
            Method::new(|params: Vec<Value>| async move {
                match params.into_iter().next() {
                    Some(f) => f.call(vec![]).await,
                    None => Err(RpcError::InvalidParams {
                        message: "baz expects a function".into(),
                    }),
                }
            }),
            Some("baz"),
        )
        .unwrap();
    endpoint
        .expose(
            Method::sync(|params| {
                let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
                Ok(Value::from(sum))
            }),
            Some("add"),
        )
        .unwrap();
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("operation timed out")
}

#[tokio::test]
async fn test_add() {
    let (client, server) = connected();
    expose_demo(&server);

    let sum = within(client.invoke("add", vec![Value::from(23), Value::from(19)]))
        .await
        .unwrap();
    assert_eq!(sum, Value::from(42));
}

#[tokio::test]
async fn test_plain_result() {
    let (client, server) = connected();
    expose_demo(&server);

    let result = within(client.invoke("foo", vec![])).await.unwrap();
    assert_eq!(result, Value::from("foo"));
}

#[tokio::test]
async fn test_function_argument_is_called_back() {
    let (client, server) = connected();
    expose_demo(&server);

    let f = Method::sync(|_| Ok(Value::from("baz")));
    let result = within(client.invoke("baz", vec![Value::from(f)]))
        .await
        .unwrap();
    assert_eq!(result, Value::from("baz"));

    // The callback was scoped to that invocation.
    assert!(client.provider().is_empty());
}

#[tokio::test]
async fn test_returned_function_is_callable() {
    let (client, server) = connected();
    expose_demo(&server);

    let stub = within(client.invoke("bar", vec![])).await.unwrap();
    let stub = stub.as_function().expect("bar returns a function").clone();

    assert_eq!(within(stub.call(vec![])).await.unwrap(), Value::from("bar"));
    // Returned functions stay callable for the endpoint's lifetime.
    assert_eq!(within(stub.call(vec![])).await.unwrap(), Value::from("bar"));
}

#[tokio::test]
async fn test_returned_functions_are_cleared_on_close() {
    let (client, server) = connected();
    expose_demo(&server);
    let base = server.provider().len();

    within(client.invoke("bar", vec![])).await.unwrap();
    within(client.invoke("bar", vec![])).await.unwrap();
    assert_eq!(server.provider().len(), base + 2);

    client.close();
    within(server.closed()).await;
    assert_eq!(server.provider().len(), base);
    assert!(server.provider().names().iter().all(|n| !n.starts_with('#')));
}

#[tokio::test]
async fn test_server_invokes_client() {
    let (client, server) = connected();
    client
        .expose(Method::sync(|_| Ok(Value::from("moo"))), Some("cow"))
        .unwrap();

    let result = within(server.invoke("cow", vec![])).await.unwrap();
    assert_eq!(result, Value::from("moo"));
}

#[tokio::test]
async fn test_unknown_method_is_answered() {
    let (client, _server) = connected();

    let err = within(client.invoke("missing", vec![])).await.unwrap_err();
    match err {
        RpcError::Remote { code, data, .. } => {
            assert_eq!(code, -32601);
            assert_eq!(data, Some(json!("missing")));
        }
        other => panic!("Expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_method_failure_carries_message() {
    let (client, server) = connected();
    server
        .expose(Method::sync(|_| Err(RpcError::failed("disk on fire"))), Some("explode"))
        .unwrap();

    let err = within(client.invoke("explode", vec![])).await.unwrap_err();
    match err {
        RpcError::Remote { code, data, .. } => {
            assert_eq!(code, -32603);
            assert_eq!(data, Some(json!("disk on fire")));
        }
        other => panic!("Expected remote error, got {:?}", other),
    }

    // The connection survives a failed invocation.
    expose_demo(&server);
    assert_eq!(
        within(client.invoke("foo", vec![])).await.unwrap(),
        Value::from("foo")
    );
}

#[tokio::test]
async fn test_nested_remote_error_keeps_code() {
    let (client, server) = connected();
    // The server calls the client's function, which is missing on purpose.
    server
        .expose(
            Method::new(|params: Vec<Value>| async move {
                let f = params.into_iter().next().unwrap_or_default();
                f.call(vec![]).await
            }),
            Some("relay"),
        )
        .unwrap();
    client
        .expose(
            Method::sync(|_| {
                Err(RpcError::Remote {
                    code: -32001,
                    message: "Custom".into(),
                    data: None,
                })
            }),
            Some("custom"),
        )
        .unwrap();
    let custom = client.provider().get("custom").unwrap();

    let err = within(client.invoke("relay", vec![Value::from(custom)]))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote { code: -32001, .. }));
}

#[tokio::test]
async fn test_concurrent_invokes_answered_in_reverse() {
    const N: usize = 8;
    let (left, right) = Connection::pair();
    let client = Endpoint::new();
    client.bind(left).unwrap();

    let calls: Vec<_> = (0..N)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.invoke("echo", vec![Value::from(i as i64)]).await })
        })
        .collect();

    // Act as the peer by hand: collect every request, then answer backwards.
    let (readable, mut writable, _handle) = right.into_parts();
    let mut incoming = Box::pin(decode_stream(readable));
    let mut requests = Vec::new();
    while requests.len() < N {
        match within(incoming.next()).await {
            Some(Decoded::Message(Message::Request(request))) => requests.push(request),
            other => panic!("Expected request, got {:?}", other),
        }
    }
    for request in requests.into_iter().rev() {
        let echoed = request.params[0].clone();
        let reply = Message::Success(SuccessMessage::new(request.id, echoed));
        writable.send(encode_message(&reply).unwrap()).await.unwrap();
    }

    for (i, call) in calls.into_iter().enumerate() {
        let result = within(call).await.unwrap().unwrap();
        assert_eq!(result, Value::from(i as i64));
    }
    assert_eq!(client.consumer().pending_count(), 0);
}

#[tokio::test]
async fn test_malformed_line_gets_parse_error() {
    let (left, right) = Connection::pair();
    let server = Endpoint::new();
    expose_demo(&server);
    server.bind(right).unwrap();

    let (readable, mut writable, _handle) = left.into_parts();
    let mut incoming = Box::pin(decode_stream(readable));

    writable
        .send(bytes::Bytes::from_static(b"this is not json\n"))
        .await
        .unwrap();
    match within(incoming.next()).await {
        Some(Decoded::Message(Message::Error(error))) => {
            assert_eq!(error.code, -32700);
            assert_eq!(error.id, None);
        }
        other => panic!("Expected parse error, got {:?}", other),
    }

    // The server keeps serving after the bad line.
    writable
        .send(bytes::Bytes::from_static(
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"foo\",\"params\":[]}\n",
        ))
        .await
        .unwrap();
    match within(incoming.next()).await {
        Some(Decoded::Message(Message::Success(reply))) => assert_eq!(reply.result, json!("foo")),
        other => panic!("Expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_fails_pending_invocations() {
    let (client, server) = connected();
    server
        .expose(
            Method::new(|_| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
            Some("hang"),
        )
        .unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.invoke("hang", vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.consumer().pending_count(), 1);

    client.close();
    let outcome = within(call).await.unwrap();
    assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
    within(server.closed()).await;
}

#[tokio::test]
async fn test_peer_drop_fails_pending_invocations() {
    let (left, right) = Connection::pair();
    let client = Endpoint::new();
    client.bind(left).unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.invoke("anything", vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(right);

    assert!(matches!(
        within(call).await.unwrap(),
        Err(RpcError::ConnectionClosed)
    ));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_default_invoke_timeout() {
    let (left, right) = Connection::pair();
    let client = Endpoint::with_options(
        EndpointOptions::default().with_invoke_timeout(Duration::from_millis(50)),
    );
    client.bind(left).unwrap();
    let server = Endpoint::new();
    server
        .expose(
            Method::new(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
            Some("slow"),
        )
        .unwrap();
    expose_demo(&server);
    server.bind(right).unwrap();

    let err = within(client.invoke("slow", vec![])).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    // Other calls are unaffected.
    assert_eq!(
        within(client.invoke("foo", vec![])).await.unwrap(),
        Value::from("foo")
    );
}

#[tokio::test]
async fn test_notification_runs_without_reply() {
    let (client, server) = connected();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    server
        .expose(
            Method::sync(move |params| {
                h.fetch_add(params[0].as_i64().unwrap_or(0) as usize, Ordering::SeqCst);
                Ok(Value::Null)
            }),
            Some("tick"),
        )
        .unwrap();

    client.notify("tick", vec![Value::from(2)]).unwrap();
    client.notify("tick", vec![Value::from(3)]).unwrap();
    // A notification for an unknown method is dropped quietly.
    client.notify("nobody-home", vec![]).unwrap();

    within(async {
        while hits.load(Ordering::SeqCst) != 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(client.consumer().pending_count(), 0);
}

#[tokio::test]
async fn test_remote_event_binding() {
    let (client, server) = connected();

    // The server exposes an event source whose `on` keeps the callback.
    let events = EventEmitter::<Value>::new();
    let source = events.clone();
    let on = Method::sync(move |params| {
        let callback = params
            .into_iter()
            .next()
            .and_then(|p| p.as_function().cloned())
            .ok_or_else(|| RpcError::InvalidParams {
                message: "on expects a callback".into(),
            })?;
        source.on(move |event| {
            let callback = callback.clone();
            tokio::spawn(async move {
                let _ = callback.call(vec![event]).await;
            });
        });
        Ok(Value::Null)
    });
    let mock: Value = vec![("on".to_string(), Value::from(on))].into_iter().collect();
    let exposed = server.expose_object("mock", &mock).unwrap();
    assert_eq!(exposed, vec!["mock.on"]);

    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();
    let listener = Method::sync(move |params| {
        r.lock().unwrap().extend(params);
        Ok(Value::Null)
    })
    .persistent();

    within(client.invoke("mock.on", vec![Value::from(listener)]))
        .await
        .unwrap();
    // The persistent callback outlives the invocation that carried it.
    assert_eq!(client.provider().len(), 1);

    events.emit(Value::from("first"));
    events.emit(Value::from("second"));
    within(async {
        while received.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let mut got = received.lock().unwrap().clone();
    got.sort_by_key(|v| v.as_str().map(str::to_string));
    assert_eq!(got, vec![Value::from("first"), Value::from("second")]);

    // Closing the endpoint clears generated callbacks.
    client.close();
    assert!(client.provider().is_empty());
}

#[tokio::test]
async fn test_stub_after_close_reports_closed() {
    let (client, server) = connected();
    expose_demo(&server);

    let stub = within(client.invoke("bar", vec![])).await.unwrap();
    client.close();
    let err = within(stub.call(vec![])).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed));
}
