use crate::helpers::{get_async_client, get_async_connector, spawn_async_server, unique_method};
use carrot_rpc::clients::CallOptions;
use carrot_rpc::routing::{AsyncRouter, RouteOptions};
use carrot_rpc::servers::RpcAsyncServer;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

async fn echo(payload: Value) -> Result<Value, anyhow::Error> {
    Ok(payload)
}

async fn slow(payload: Value) -> Result<Value, anyhow::Error> {
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(json!({"slow": payload}))
}

async fn nap(payload: Value) -> Result<Value, anyhow::Error> {
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(payload)
}

async fn fast(payload: Value) -> Result<Value, anyhow::Error> {
    Ok(json!({"fast": payload}))
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn echo_returns_its_input_unchanged() {
    // Arrange
    let method = unique_method("echo");
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(&method, echo, RouteOptions::default())
        .unwrap();
    let server = spawn_async_server(server).await;
    let client = get_async_client();

    // Act
    let reply = client
        .rpc_call(
            &method,
            &json!({"msg": "hi"}),
            CallOptions::default().timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(reply, Some(json!({"msg": "hi"})));
    assert_eq!(client.in_flight(), 0);
    server.stop().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn calls_to_an_unregistered_method_time_out_without_error() {
    let client = get_async_client();
    let timeout = Duration::from_millis(500);
    let start = Instant::now();

    let reply = client
        .rpc_call(
            &unique_method("ghost"),
            &json!({}),
            CallOptions::default().timeout(timeout),
        )
        .await
        .unwrap();

    assert_eq!(reply, None);
    assert!(start.elapsed() >= timeout);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn concurrent_calls_receive_their_own_reply() {
    // Arrange
    let mut timing = AsyncRouter::new();
    timing
        .register("slow", slow, RouteOptions::default())
        .unwrap()
        .register("fast", fast, RouteOptions::default())
        .unwrap();
    let prefix = unique_method("timing") + ".";
    let mut server = RpcAsyncServer::new(get_async_connector());
    server.include_router(timing, &prefix).unwrap();
    let server = spawn_async_server(server).await;
    let client = get_async_client();
    let options = CallOptions::default().timeout(Duration::from_secs(2));
    let (slow_method, fast_method) = (format!("{prefix}slow"), format!("{prefix}fast"));
    let (slow_body, fast_body) = (json!("a"), json!("b"));

    // Act
    let timed = |method: String, body: Value| {
        let client = client.clone();
        async move {
            let reply = client.rpc_call(&method, &body, options).await.unwrap();
            (reply, Instant::now())
        }
    };
    let ((slow_reply, slow_done), (fast_reply, fast_done)) = tokio::join!(
        timed(slow_method, slow_body),
        timed(fast_method, fast_body)
    );

    // Assert
    assert_eq!(slow_reply, Some(json!({"slow": "a"})));
    assert_eq!(fast_reply, Some(json!({"fast": "b"})));
    assert!(fast_done < slow_done);
    server.stop().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn route_timeouts_apply_when_the_call_does_not_set_one() {
    // Arrange
    let method = unique_method("slow");
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(
            &method,
            slow,
            RouteOptions::default().timeout(Duration::from_millis(300)),
        )
        .unwrap();
    let route_table = server.route_table();
    let server = spawn_async_server(server).await;
    let client = get_async_client().with_route_timeouts(route_table);

    // Act
    let start = Instant::now();
    let reply = client
        .rpc_call(&method, &json!(null), CallOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(reply, None);
    assert!(start.elapsed() < Duration::from_secs(1));
    server.stop().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn the_server_exits_after_the_requested_number_of_requests() {
    // Arrange
    let method = unique_method("echo");
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(&method, echo, RouteOptions::default())
        .unwrap()
        .exit_after(2);
    let server = spawn_async_server(server).await;
    let client = get_async_client();
    let options = CallOptions::default().timeout(Duration::from_secs(2));

    // Act
    for n in 0..2 {
        let reply = client.rpc_call(&method, &json!(n), options).await.unwrap();
        assert_eq!(reply, Some(json!(n)));
    }

    // Assert
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_route_prefetch_count_bounds_its_concurrent_requests() {
    // Arrange
    let method = unique_method("nap");
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(&method, nap, RouteOptions::default().prefetch_count(1))
        .unwrap();
    let server = spawn_async_server(server).await;
    let client = get_async_client();
    let options = CallOptions::default().timeout(Duration::from_secs(3));

    // Act
    let (one, two) = (json!(1), json!(2));
    let started = Instant::now();
    let (first, second) = tokio::join!(
        client.rpc_call(&method, &one, options),
        client.rpc_call(&method, &two, options)
    );

    // Assert: one request at a time, one after the other
    assert_eq!(first.unwrap(), Some(json!(1)));
    assert_eq!(second.unwrap(), Some(json!(2)));
    assert!(started.elapsed() >= Duration::from_secs(1));
    server.stop().await;
}
