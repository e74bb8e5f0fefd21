use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
use carrot_rpc::clients::{CallOptions, RpcAsyncClient};
use carrot_rpc::connectors::AsyncConnector;
use serde_json::json;
use std::time::{Duration, Instant};

// Run the `echo_server` demo first.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let connector = AsyncConnector::new(&RabbitMqSettings::default(), RpcSettings::default())?;
    let client = RpcAsyncClient::new(connector);
    let options = CallOptions::default().timeout(Duration::from_secs(2));

    let reply = client
        .rpc_call("echo", &json!({"msg": "hi"}), options)
        .await?;
    println!("echo: {reply:?}");

    // Nobody serves `ghost`: the call resolves to `None` once the timeout elapses.
    let start = Instant::now();
    let reply = client
        .rpc_call(
            "ghost",
            &json!({}),
            CallOptions::default().timeout(Duration::from_millis(500)),
        )
        .await?;
    println!("ghost: {reply:?} after {:?}", start.elapsed());

    // Calls issued concurrently on the same client are matched to their own reply,
    // whatever the order replies come back in.
    let nap = json!({"seconds": 1});
    let nothing = json!(null);
    let (slow, fast) = tokio::join!(
        client.rpc_call("timing.slow", &nap, options),
        client.rpc_call("timing.fast", &nothing, options),
    );
    println!("slow: {:?}, fast: {:?}", slow?, fast?);

    Ok(())
}
