use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
use carrot_rpc::clients::{CallOptions, RpcSyncClient};
use carrot_rpc::connectors::Connector;
use carrot_rpc::routing::RouteOptions;
use carrot_rpc::servers::RpcSyncServer;
use serde_json::{json, Value};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use std::time::Duration;

fn echo(payload: Value) -> Result<Value, anyhow::Error> {
    Ok(payload)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rabbitmq = RabbitMqSettings::default();

    // The blocking flavour holds a single connection, established right away:
    // an unreachable broker fails here, after `connection_attempts` attempts.
    let mut server = RpcSyncServer::new(Connector::new(&rabbitmq, RpcSettings::default())?);
    server.register("blocking.echo", echo, RouteOptions::default())?;

    // The server blocks the thread it runs on.
    let shutdown = Arc::new(ShutdownHandler::new());
    let server = std::thread::spawn({
        let shutdown = Arc::clone(&shutdown);
        move || server.run_until_shutdown(shutdown)
    });
    // Give the server some time to declare its queue.
    std::thread::sleep(Duration::from_secs(1));

    let client = RpcSyncClient::new(Connector::new(&rabbitmq, RpcSettings::default())?)?;
    let reply = client.rpc_call(
        "blocking.echo",
        &json!({"msg": "hi"}),
        CallOptions::default().timeout(Duration::from_secs(2)),
    )?;
    println!("blocking.echo: {reply:?}");

    client.close()?;
    shutdown.shutdown();
    server.join().expect("the server thread panicked")?;
    Ok(())
}
