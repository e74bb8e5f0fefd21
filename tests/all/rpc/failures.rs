use crate::helpers::{
    get_async_client, get_async_connector, get_rabbitmq_settings, get_rpc_settings,
    spawn_async_server, unique_method,
};
use carrot_rpc::amqp::configuration::RpcSettings;
use carrot_rpc::amqp::topology::{declare_reply_queue, QueueOptions};
use carrot_rpc::clients::{CallOptions, RpcAsyncClient};
use carrot_rpc::connectors::AsyncConnector;
use carrot_rpc::routing::RouteOptions;
use carrot_rpc::servers::RpcAsyncServer;
use carrot_rpc::RpcError;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeleteOptions};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde::Deserialize;
use serde_json::{json, Value};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn echo(payload: Value) -> Result<Value, anyhow::Error> {
    Ok(payload)
}

#[derive(Deserialize)]
struct Withdrawal {
    amount: u64,
}

async fn withdraw(withdrawal: Withdrawal) -> Result<u64, anyhow::Error> {
    if withdrawal.amount > 100 {
        anyhow::bail!("insufficient funds");
    }
    Ok(100 - withdrawal.amount)
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn failures_are_answered_with_an_error_payload_and_the_server_keeps_going() {
    // Arrange
    let method = unique_method("withdraw");
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(&method, withdraw, RouteOptions::default())
        .unwrap();
    let server = spawn_async_server(server).await;
    let client = get_async_client();
    let options = CallOptions::default().timeout(Duration::from_secs(2));

    // Act
    let failed = client
        .rpc_call(&method, &json!({"amount": 500}), options)
        .await
        .unwrap()
        .unwrap();
    let mismatched = client
        .rpc_call(&method, &json!("not a withdrawal"), options)
        .await
        .unwrap()
        .unwrap();
    let succeeded = client
        .rpc_call(&method, &json!({"amount": 40}), options)
        .await
        .unwrap();

    // Assert
    assert_eq!(failed["error"]["kind"], json!("failed"));
    assert_eq!(mismatched["error"]["kind"], json!("invalid_arguments"));
    assert_eq!(succeeded, Some(json!(60)));
    server.stop().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn unroutable_requests_fail_fast_with_publisher_confirms() {
    let settings = RpcSettings {
        publisher_confirms: true,
        ..get_rpc_settings()
    };
    let connector = AsyncConnector::new(&get_rabbitmq_settings(), settings).unwrap();
    let client = RpcAsyncClient::new(connector);

    let outcome = client
        .rpc_call(
            &unique_method("ghost"),
            &Value::Null,
            CallOptions::default().timeout(Duration::from_secs(5)),
        )
        .await;

    assert!(matches!(outcome, Err(RpcError::Unroutable(_))));
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn conflicting_declarations_are_reported_as_protocol_errors() {
    // Arrange: declare the queue as durable...
    let method = unique_method("echo");
    let connector = get_async_connector();
    let channel = connector.open_channel().await.unwrap();
    connector
        .setup_queue_declare(
            &channel,
            &method,
            QueueOptions {
                durable: true,
                auto_delete: true,
                exclusive: false,
            },
        )
        .await
        .unwrap();

    // Act: ...then ask a server to declare it again as transient.
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(
            &method,
            |payload: Value| async move { Ok::<_, anyhow::Error>(payload) },
            RouteOptions::default().durable(false),
        )
        .unwrap();
    let outcome = server
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await;

    // Assert
    let err = outcome.unwrap_err();
    assert!(err.is_protocol_error(), "{err:?}");
    channel
        .queue_delete(&method, QueueDeleteOptions::default())
        .await
        .unwrap();
    connector.close_channel(channel).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn undecodable_requests_are_answered_and_the_route_keeps_serving() {
    // Arrange
    let method = unique_method("echo");
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(&method, echo, RouteOptions::default())
        .unwrap();
    let server = spawn_async_server(server).await;
    let connector = get_async_connector();
    let channel = connector.open_channel().await.unwrap();
    let reply_queue = declare_reply_queue(&channel).await.unwrap();
    let mut replies = channel
        .basic_consume(
            &reply_queue,
            "",
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    // Act: bytes no converter can make sense of
    channel
        .basic_publish(
            "",
            &method,
            BasicPublishOptions::default(),
            b"{not json",
            BasicProperties::default()
                .with_reply_to(reply_queue.as_str().into())
                .with_correlation_id("garbage".into()),
        )
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let next = get_async_client()
        .rpc_call(
            &method,
            &json!({"msg": "hi"}),
            CallOptions::default().timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    // Assert
    let reply: Value = serde_json::from_slice(&reply.data).unwrap();
    assert_eq!(reply["error"]["kind"], json!("malformed_request"));
    assert_eq!(next, Some(json!({"msg": "hi"})));
    connector.close_channel(channel).await.unwrap();
    server.stop().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_route_that_fails_to_bind_releases_the_routes_bound_before_it() {
    // Arrange: the queue of the second route exists with conflicting flags
    let (served, conflicting) = (unique_method("echo"), unique_method("echo"));
    let connector = get_async_connector();
    let channel = connector.open_channel().await.unwrap();
    connector
        .setup_queue_declare(
            &channel,
            &conflicting,
            QueueOptions {
                durable: true,
                auto_delete: true,
                exclusive: false,
            },
        )
        .await
        .unwrap();
    let mut failing = RpcAsyncServer::new(get_async_connector());
    failing
        .register(&served, echo, RouteOptions::default())
        .unwrap()
        .register(&conflicting, echo, RouteOptions::default())
        .unwrap();
    let routes: Vec<_> = failing.router().routes().cloned().collect();

    // Act
    let outcome = failing
        .run_until_shutdown(Arc::new(ShutdownHandler::new()))
        .await;

    // Assert: nothing is left consuming from the first route's queue
    assert!(outcome.unwrap_err().is_protocol_error());
    assert!(routes.iter().all(|route| !route.is_bound()));
    let mut server = RpcAsyncServer::new(get_async_connector());
    server
        .register(&served, echo, RouteOptions::default())
        .unwrap();
    let server = spawn_async_server(server).await;
    let client = get_async_client();
    let options = CallOptions::default().timeout(Duration::from_secs(2));
    for n in 0..4 {
        let reply = client.rpc_call(&served, &json!(n), options).await.unwrap();
        assert_eq!(reply, Some(json!(n)));
    }
    server.stop().await;
    channel
        .queue_delete(&conflicting, QueueDeleteOptions::default())
        .await
        .unwrap();
    connector.close_channel(channel).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn the_timeout_covers_the_wait_for_a_pooled_channel() {
    // Arrange: the only channel of the pool is checked out
    let settings = RpcSettings {
        channel_pool_max_size: 1,
        ..get_rpc_settings()
    };
    let connector = AsyncConnector::new(&get_rabbitmq_settings(), settings).unwrap();
    let _held = connector.get_channel().await.unwrap();
    let client = RpcAsyncClient::new(connector.clone());
    let timeout = Duration::from_millis(300);

    // Act
    let started = Instant::now();
    let reply = client
        .rpc_call(
            &unique_method("echo"),
            &json!({}),
            CallOptions::default().timeout(timeout),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(reply, None);
    assert!(started.elapsed() >= timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
}
