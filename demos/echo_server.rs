use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
use carrot_rpc::connectors::AsyncConnector;
use carrot_rpc::routing::{AsyncRouter, RouteOptions};
use carrot_rpc::servers::RpcAsyncServer;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

async fn echo(payload: Value) -> Result<Value, anyhow::Error> {
    Ok(payload)
}

#[derive(Deserialize)]
struct Nap {
    seconds: u64,
}

async fn slow(nap: Nap) -> Result<String, anyhow::Error> {
    tokio::time::sleep(Duration::from_secs(nap.seconds)).await;
    Ok(format!("slept for {}s", nap.seconds))
}

async fn fast(_: Value) -> Result<&'static str, anyhow::Error> {
    Ok("done")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    // Nothing is established yet: connections and channels are opened lazily, from the pools.
    let connector = AsyncConnector::new(&RabbitMqSettings::default(), RpcSettings::default())?;

    // Related methods can be grouped in their own router and mounted under a prefix.
    // Each route can carry its own queue options - `timing.slow` advertises a longer
    // default timeout to the clients that load the route table.
    let mut timing = AsyncRouter::new();
    timing
        .register(
            "slow",
            slow,
            RouteOptions::default().timeout(Duration::from_secs(5)),
        )?
        .register("fast", fast, RouteOptions::default())?;

    let mut server = RpcAsyncServer::new(connector);
    server
        .register("echo", echo, RouteOptions::default())?
        .include_router(timing, "timing.")?;

    for route in server.route_table() {
        println!("serving {} (default timeout: {:?})", route.method, route.timeout);
    }

    // One queue per method: `echo`, `timing.slow` and `timing.fast`.
    // `launch` returns when the process receives SIGTERM.
    server.launch().await?;
    Ok(())
}
