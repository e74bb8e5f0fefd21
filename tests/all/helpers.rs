use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
use carrot_rpc::clients::{RpcAsyncClient, RpcSyncClient};
use carrot_rpc::connectors::{AsyncConnector, Connector};
use carrot_rpc::routing::Route;
use carrot_rpc::servers::{RpcAsyncServer, RpcSyncServer};
use carrot_rpc::RpcError;
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub fn get_rabbitmq_settings() -> RabbitMqSettings {
    RabbitMqSettings::default()
}

/// Queues are auto-deleted, so that test runs do not leave garbage behind in the broker.
pub fn get_rpc_settings() -> RpcSettings {
    RpcSettings {
        auto_delete: true,
        ..RpcSettings::default()
    }
}

pub fn get_async_connector() -> AsyncConnector {
    AsyncConnector::new(&get_rabbitmq_settings(), get_rpc_settings()).unwrap()
}

pub fn get_async_client() -> RpcAsyncClient {
    RpcAsyncClient::new(get_async_connector())
}

pub fn get_connector() -> Connector {
    Connector::new(&get_rabbitmq_settings(), get_rpc_settings()).unwrap()
}

pub fn get_sync_client() -> RpcSyncClient {
    RpcSyncClient::new(get_connector()).unwrap()
}

/// A method name no other test uses.
pub fn unique_method(name: &str) -> String {
    format!("{name}.{}", Uuid::new_v4())
}

/// Wait for the server to consume from the queues of `routes`.
pub async fn wait_until_bound<H: ?Sized>(routes: &[Arc<Route<H>>]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !routes.iter().all(|route| route.is_bound()) {
        assert!(Instant::now() < deadline, "The server did not bind its routes");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub struct RunningServer {
    pub shutdown: Arc<ShutdownHandler>,
    pub handle: tokio::task::JoinHandle<Result<(), RpcError>>,
}

impl RunningServer {
    pub async fn stop(self) {
        self.shutdown.shutdown();
        self.handle.await.unwrap().unwrap();
    }
}

/// Launch `server` in the background, returning once all its routes are bound.
pub async fn spawn_async_server(server: RpcAsyncServer) -> RunningServer {
    let routes: Vec<_> = server.router().routes().cloned().collect();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = tokio::spawn(server.run_until_shutdown(Arc::clone(&shutdown)));
    wait_until_bound(&routes).await;
    RunningServer { shutdown, handle }
}

pub struct RunningSyncServer {
    pub shutdown: Arc<ShutdownHandler>,
    pub handle: std::thread::JoinHandle<Result<(), RpcError>>,
}

impl RunningSyncServer {
    pub fn stop(self) {
        self.shutdown.shutdown();
        self.handle.join().unwrap().unwrap();
    }
}

/// Launch `server` on its own thread, returning once all its routes are bound.
pub fn spawn_sync_server(server: RpcSyncServer) -> RunningSyncServer {
    let routes: Vec<_> = server.router().routes().cloned().collect();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = std::thread::spawn({
        let shutdown = Arc::clone(&shutdown);
        move || server.run_until_shutdown(shutdown)
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while !routes.iter().all(|route| route.is_bound()) {
        assert!(Instant::now() < deadline, "The server did not bind its routes");
        std::thread::sleep(Duration::from_millis(20));
    }
    RunningSyncServer { shutdown, handle }
}
