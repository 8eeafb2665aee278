//! End-to-end tests: a `Server` and a `Client` talking WebSocket over an
//! in-memory duplex pipe.

use std::sync::Arc;
use std::time::Duration;

use echowire::codec::{RpcArray, Value};
use echowire::config::Config;
use echowire::error::EchowireError;
use echowire::handler::{Context, Registry};
use echowire::protocol::Stream;
use echowire::transport::{Client, Server};
use futures::{SinkExt, StreamExt};
use tokio::io::duplex;
use tokio_tungstenite::tungstenite::Message;

fn test_config() -> Config {
    Config::default()
        .with_num_slots(2)
        .with_workers_per_slot(8)
        .with_gc_sweep_batch(8)
        .with_sweep_interval(Duration::from_millis(1))
}

fn registry(config: &Config) -> Registry {
    let mut registry = Registry::from_config(config);
    let user = registry.add_service("$", "user").unwrap();
    registry
        .add_echo(&user, "sayHello", true, |ctx: &mut Context, name: String| {
            ctx.ok(format!("hello {}", name))
        })
        .unwrap();
    registry
        .add_echo(&user, "sum", true, |ctx: &mut Context, items: RpcArray| {
            let total: i64 = (0..items.len()).filter_map(|i| items.get_i64(i)).sum();
            ctx.ok(total)
        })
        .unwrap();
    registry
        .add_echo(&user, "blob", true, |ctx: &mut Context, size: u64| {
            ctx.ok(vec![7u8; size as usize])
        })
        .unwrap();
    registry
        .add_echo(&user, "ignore", true, |ctx: &mut Context| {
            ctx.close();
            ctx.ok(())
        })
        .unwrap();
    registry
}

/// Start a server and connect one client to it.
async fn connect(config: Config) -> (Arc<Server>, Client) {
    let server = Arc::new(Server::new(registry(&config), config).unwrap());
    let (server_io, client_io) = duplex(64 * 1024);

    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve_connection(server_io).await;
    });

    let client = Client::connect_with("ws://localhost/", client_io).await.unwrap();
    (server, client)
}

/// Call round trip over a real WebSocket handshake.
#[tokio::test]
async fn test_call_say_hello() {
    let (server, client) = connect(test_config()).await;

    let reply = client
        .call("$.user:sayHello", &[Value::from("world")])
        .await
        .unwrap();

    assert_eq!(reply.as_str(), Some("hello world"));
    assert_eq!(server.connection_count(), 1);
}

/// Error replies surface as `EchowireError::Rpc`.
#[tokio::test]
async fn test_call_error_reply() {
    let (_server, client) = connect(test_config()).await;

    let err = client
        .call("$.user:sayHello", &[Value::Int(42)])
        .await
        .unwrap_err();

    match err {
        EchowireError::Rpc(rpc) => {
            assert!(rpc.message.starts_with("rpc echo arguments not match"));
            assert!(rpc.message.contains("int64"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = client.call("$.user:nothing", &[]).await.unwrap_err();
    assert!(matches!(err, EchowireError::Rpc(ref rpc) if rpc.message.contains("is not mounted")));
}

/// Many concurrent calls on one connection each get their own reply.
#[tokio::test]
async fn test_concurrent_calls() {
    let (server, client) = connect(test_config()).await;
    let client = Arc::new(client);

    let mut tasks = Vec::new();
    for n in 0..64i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let items = RpcArray::try_from_iter(0..=n).unwrap();
            let reply = client
                .call("$.user:sum", &[Value::Array(items)])
                .await
                .unwrap();
            (n, reply.as_i64().unwrap())
        }));
    }

    for task in tasks {
        let (n, total) = task.await.unwrap();
        assert_eq!(total, n * (n + 1) / 2);
    }
    assert_eq!(client.pending_calls(), 0);

    let stats = server.stats();
    let sum = stats.iter().find(|s| s.path == "$.user:sum").unwrap();
    assert_eq!(sum.indicator.total(), 64);
}

/// A closed context sends nothing, so the call times out.
#[tokio::test]
async fn test_closed_context_sends_no_reply() {
    let (_server, client) = connect(test_config()).await;
    let client = client.with_timeout(Duration::from_millis(100));

    let err = client.call("$.user:ignore", &[]).await.unwrap_err();

    assert!(matches!(err, EchowireError::Timeout));
    assert_eq!(client.pending_calls(), 0);
}

/// Requests deeper than the limit are refused.
#[tokio::test]
async fn test_depth_limit_over_the_wire() {
    let (_server, client) = connect(test_config().with_max_call_depth(2)).await;
    let client = client.with_depth(3);

    let err = client
        .call("$.user:sayHello", &[Value::from("x")])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EchowireError::Rpc(ref rpc) if rpc.message == "rpc current call depth (3) is overflow. limit(2)"
    ));
}

/// A text frame closes the connection and fails pending calls.
#[tokio::test]
async fn test_text_frame_closes_connection() {
    let config = test_config();
    let server = Arc::new(Server::new(registry(&config), config).unwrap());
    let (server_io, client_io) = duplex(64 * 1024);

    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve_connection(server_io).await });

    let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
        .await
        .unwrap();
    ws.send(Message::Text("hello".into())).await.unwrap();

    let result = handle.await.unwrap();
    assert!(result.is_err());
    assert_eq!(server.connection_count(), 0);

    // the server sends a close frame on the way out
    while let Some(Ok(message)) = ws.next().await {
        if message.is_close() {
            break;
        }
    }
}

/// An idle connection is dropped once the read deadline passes.
#[tokio::test]
async fn test_read_timeout_closes_connection() {
    let config = test_config().with_read_timeout(Duration::from_millis(50));
    let server = Arc::new(Server::new(registry(&config), config).unwrap());
    let (server_io, client_io) = duplex(64 * 1024);

    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve_connection(server_io).await });
    let _client = Client::connect_with("ws://localhost/", client_io).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(EchowireError::Timeout)));
}

fn blob_request(size: u64) -> Message {
    let mut stream = Stream::new();
    stream.write_string("$.user:blob").unwrap();
    stream.write_u64(0);
    stream.write_string("@").unwrap();
    stream.write_u64(size);
    Message::binary(Vec::from(stream.to_bytes()))
}

/// A peer that stops reading its replies is disconnected once the outbound
/// queue stays full past the send timeout.
#[tokio::test]
async fn test_stalled_reader_is_disconnected() {
    let config = test_config()
        .with_reply_channel_capacity(1)
        .with_reply_send_timeout(Duration::from_millis(50));
    let server = Arc::new(Server::new(registry(&config), config).unwrap());
    let (server_io, client_io) = duplex(4096);

    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve_connection(server_io).await });

    let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
        .await
        .unwrap();
    for _ in 0..4 {
        ws.send(blob_request(16 * 1024)).await.unwrap();
    }

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(EchowireError::BackpressureTimeout)));
    assert_eq!(server.connection_count(), 0);
}
