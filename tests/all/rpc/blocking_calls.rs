use crate::helpers::{get_connector, get_sync_client, spawn_sync_server, unique_method};
use carrot_rpc::clients::CallOptions;
use carrot_rpc::routing::RouteOptions;
use carrot_rpc::servers::RpcSyncServer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn echo(payload: Value) -> Result<Value, anyhow::Error> {
    Ok(payload)
}

#[test]
#[ignore = "requires a running RabbitMQ broker"]
fn blocking_echo_returns_its_input_unchanged() {
    // Arrange
    let method = unique_method("echo");
    let mut server = RpcSyncServer::new(get_connector());
    server
        .register(&method, echo, RouteOptions::default())
        .unwrap();
    let server = spawn_sync_server(server);
    let client = get_sync_client();

    // Act
    let reply = client
        .rpc_call(
            &method,
            &json!({"msg": "hi"}),
            CallOptions::default().timeout(Duration::from_secs(2)),
        )
        .unwrap();

    // Assert
    assert_eq!(reply, Some(json!({"msg": "hi"})));
    client.close().unwrap();
    server.stop();
}

#[test]
#[ignore = "requires a running RabbitMQ broker"]
fn blocking_calls_to_an_unregistered_method_time_out() {
    let client = get_sync_client();
    let timeout = Duration::from_millis(500);
    let start = Instant::now();

    let reply = client
        .rpc_call(
            &unique_method("ghost"),
            &json!({}),
            CallOptions::default().timeout(timeout),
        )
        .unwrap();

    assert_eq!(reply, None);
    assert!(start.elapsed() >= timeout);
}

#[test]
#[ignore = "requires a running RabbitMQ broker"]
fn threads_sharing_a_client_receive_their_own_reply() {
    // Arrange
    let method = unique_method("echo");
    let mut server = RpcSyncServer::new(get_connector());
    server
        .register(&method, echo, RouteOptions::default())
        .unwrap();
    let server = spawn_sync_server(server);
    let client = get_sync_client();
    let options = CallOptions::default().timeout(Duration::from_secs(5));

    // Act
    let replies: Vec<_> = std::thread::scope(|scope| {
        let calls: Vec<_> = (0..8)
            .map(|n| {
                let (client, method) = (&client, &method);
                scope.spawn(move || (n, client.rpc_call(method, &json!(n), options).unwrap()))
            })
            .collect();
        calls.into_iter().map(|call| call.join().unwrap()).collect()
    });

    // Assert
    for (n, reply) in replies {
        assert_eq!(reply, Some(json!(n)));
    }
    client.close().unwrap();
    server.stop();
}

#[test]
#[ignore = "requires a running RabbitMQ broker"]
fn blocking_handlers_can_call_other_methods() {
    // Arrange: `relay` forwards its payload to `echo`, served by another server
    let (echo_method, relay_method) = (unique_method("echo"), unique_method("relay"));
    let mut echo_server = RpcSyncServer::new(get_connector());
    echo_server
        .register(&echo_method, echo, RouteOptions::default())
        .unwrap();
    let echo_server = spawn_sync_server(echo_server);

    let downstream = Arc::new(get_sync_client());
    let relay = {
        let (downstream, echo_method) = (Arc::clone(&downstream), echo_method.clone());
        move |payload: Value| {
            downstream
                .rpc_call(
                    &echo_method,
                    &payload,
                    CallOptions::default().timeout(Duration::from_secs(2)),
                )
                .map_err(|e| anyhow::anyhow!("{e}"))
        }
    };
    let mut relay_server = RpcSyncServer::new(get_connector());
    relay_server
        .register(&relay_method, relay, RouteOptions::default())
        .unwrap();
    let relay_server = spawn_sync_server(relay_server);
    let client = get_sync_client();

    // Act
    let reply = client
        .rpc_call(
            &relay_method,
            &json!({"msg": "hi"}),
            CallOptions::default().timeout(Duration::from_secs(5)),
        )
        .unwrap();

    // Assert
    assert_eq!(reply, Some(json!({"msg": "hi"})));
    client.close().unwrap();
    relay_server.stop();
    echo_server.stop();
}
