use super::processing::{decode_request, drop_unroutable, encode_reply, reply_and_ack};
use super::{BoundRoutes, RouteDelivery};
use crate::connectors::Connector;
use crate::converter::{JsonConverter, MessageConverter};
use crate::error::RpcError;
use crate::routing::{BlockingHandler, BlockingRouter, HandlerError, RouteInfo, RouteOptions};
use futures_util::FutureExt;
use lapin::message::Delivery;
use lapin::Channel;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shutdown_handler::ShutdownHandler;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Serve methods to blocking handlers.
///
/// Each route gets its own channel and consumer, but requests are processed one at a time,
/// on the thread that called [`RpcSyncServer::launch`].
///
/// Handlers run outside of the connector's runtime, so they are free to block - including
/// on calls to other methods through an [`RpcSyncClient`].
///
/// [`RpcSyncClient`]: crate::clients::RpcSyncClient
///
/// # Example
///
/// ```rust,no_run
/// use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
/// use carrot_rpc::connectors::Connector;
/// use carrot_rpc::routing::RouteOptions;
/// use carrot_rpc::servers::RpcSyncServer;
///
/// fn add(numbers: Vec<i64>) -> Result<i64, anyhow::Error> {
///     Ok(numbers.into_iter().sum())
/// }
///
/// # fn run() -> Result<(), carrot_rpc::RpcError> {
/// let connector = Connector::new(&RabbitMqSettings::default(), RpcSettings::default())?;
/// let mut server = RpcSyncServer::new(connector);
/// server.register("add", add, RouteOptions::default())?;
/// server.launch()
/// # }
/// ```
pub struct RpcSyncServer {
    connector: Connector,
    router: BlockingRouter,
    converter: Arc<dyn MessageConverter>,
    exit_after: Option<usize>,
}

impl RpcSyncServer {
    /// A server decoding requests and encoding replies as JSON.
    pub fn new(connector: Connector) -> Self {
        Self {
            connector,
            router: BlockingRouter::new(),
            converter: Arc::new(JsonConverter),
            exit_after: None,
        }
    }

    /// Decode requests and encode replies with `converter`.
    #[must_use]
    pub fn with_converter(mut self, converter: impl MessageConverter) -> Self {
        self.converter = Arc::new(converter);
        self
    }

    /// Serve all the routes of `router`, prefixing their method names with `prefix`.
    pub fn include_router(
        &mut self,
        router: BlockingRouter,
        prefix: &str,
    ) -> Result<&mut Self, RpcError> {
        self.router.include_router(router, prefix)?;
        Ok(self)
    }

    /// Serve `method` with the blocking function `f`. See [`Router::register`].
    ///
    /// [`Router::register`]: crate::routing::Router::register
    pub fn register<F, Args, R, E>(
        &mut self,
        method: impl Into<String>,
        f: F,
        options: RouteOptions,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Args) -> Result<R, E> + Send + Sync + 'static,
        Args: DeserializeOwned + 'static,
        R: Serialize,
        E: Into<HandlerError>,
    {
        self.router.register(method, f, options)?;
        Ok(self)
    }

    /// Stop serving after `n` requests.
    pub fn exit_after(&mut self, n: usize) -> &mut Self {
        self.exit_after = Some(n);
        self
    }

    pub fn router(&self) -> &BlockingRouter {
        &self.router
    }

    /// The route list to hand over to callers, see [`RpcSyncClient::with_route_timeouts`].
    ///
    /// [`RpcSyncClient::with_route_timeouts`]: crate::clients::RpcSyncClient::with_route_timeouts
    pub fn route_table(&self) -> Vec<RouteInfo> {
        self.router.route_table()
    }

    /// Serve requests until the process receives SIGTERM, blocking the calling thread.
    pub fn launch(self) -> Result<(), RpcError> {
        let shutdown = self
            .connector
            .block_on(async { ShutdownHandler::sigterm() })
            .map_err(RpcError::Shutdown)?;
        self.run_until_shutdown(shutdown)
    }

    /// Serve requests until `shutdown` is signalled, blocking the calling thread.
    ///
    /// If the server stops for any other reason, it signals `shutdown` for the rest of the
    /// application.
    #[tracing::instrument(skip_all, name = "rpc_server_run")]
    pub fn run_until_shutdown(self, shutdown: Arc<ShutdownHandler>) -> Result<(), RpcError> {
        if self.router.is_empty() {
            return Err(RpcError::Configuration("no method is registered".into()));
        }
        let Self {
            connector,
            router,
            converter,
            exit_after,
        } = self;

        let manager = connector.channel_pool().manager();
        let mut bound =
            match connector.block_on(BoundRoutes::bind(manager, connector.settings(), &router)) {
                Ok(bound) => bound,
                Err(e) => {
                    shutdown.shutdown();
                    return Err(e);
                }
            };
        let mut counter = 0;
        let mut cancelled = false;

        let signal = shutdown.wait_for_signal().fuse();
        tokio::pin!(signal);

        let result = 'event_loop: loop {
            if exit_after == Some(counter) {
                break 'event_loop Ok(());
            }

            let event = connector.block_on(async {
                tokio::select! {
                    biased;

                    _ = &mut signal, if !cancelled => Event::Shutdown,
                    delivery = bound.next() => Event::Delivery(delivery),
                }
            });
            match event {
                Event::Shutdown => {
                    tracing::info!("rpc server received shutdown event");
                    connector.block_on(bound.cancel());
                    cancelled = true;
                }
                // all consumers have been cancelled
                Event::Delivery(None) => break 'event_loop Ok(()),
                Event::Delivery(Some((_, Err(e)))) => {
                    tracing::error!(error = ?e, "Consumer error");
                    break 'event_loop Err(RpcError::from(e));
                }
                Event::Delivery(Some((channel, Ok(delivery)))) => {
                    process(&connector, &channel, &delivery, &router, converter.as_ref());
                    counter += 1;
                }
            }
        };

        connector.block_on(bound.close());
        shutdown.shutdown();
        result
    }
}

enum Event {
    Shutdown,
    Delivery(Option<RouteDelivery>),
}

/// Process a request - dispatch to its handler, reply, ack against the AMQP broker.
///
/// Only the broker round trips go through the connector's runtime: the handler runs on the
/// calling thread, outside of it.
#[tracing::instrument(
    name = "process_request",
    skip_all,
    fields(method = delivery.routing_key.as_str()),
    level = tracing::Level::DEBUG
)]
fn process(
    connector: &Connector,
    channel: &Channel,
    delivery: &Delivery,
    router: &BlockingRouter,
    converter: &dyn MessageConverter,
) {
    let Some(route) = router.get(delivery.routing_key.as_str()) else {
        connector.block_on(drop_unroutable(delivery));
        return;
    };
    let outcome = decode_request(converter, &delivery.data)
        .and_then(|payload| call_guarded(route.handler().as_ref(), payload));
    let reply = encode_reply(converter, route.method(), outcome);
    connector.block_on(reply_and_ack(channel, delivery, converter, reply));
}

/// Call a blocking handler, turning a panic into a handler failure.
fn call_guarded(handler: &dyn BlockingHandler, payload: Value) -> Result<Value, HandlerError> {
    catch_unwind(AssertUnwindSafe(|| handler.call(payload)))
        .unwrap_or_else(|_| Err(anyhow::anyhow!("The handler panicked").into()))
}
