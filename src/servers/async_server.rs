use super::processing::{decode_request, drop_unroutable, encode_reply, reply_and_ack};
use super::BoundRoutes;
use crate::connectors::AsyncConnector;
use crate::converter::{JsonConverter, MessageConverter};
use crate::error::RpcError;
use crate::routing::{AsyncRouter, Handler, HandlerError, RouteInfo, RouteOptions};
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::Channel;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shutdown_handler::ShutdownHandler;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinError;

/// Serve methods to async handlers.
///
/// Each route gets its own channel and consumer. Requests are processed concurrently, each in
/// its own task, up to the prefetch count of its route.
///
/// # Example
///
/// ```rust,no_run
/// use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
/// use carrot_rpc::connectors::AsyncConnector;
/// use carrot_rpc::routing::RouteOptions;
/// use carrot_rpc::servers::RpcAsyncServer;
/// use serde_json::Value;
///
/// async fn echo(payload: Value) -> Result<Value, anyhow::Error> {
///     Ok(payload)
/// }
///
/// # async fn run() -> Result<(), carrot_rpc::RpcError> {
/// let connector = AsyncConnector::new(&RabbitMqSettings::default(), RpcSettings::default())?;
/// let mut server = RpcAsyncServer::new(connector);
/// server.register("echo", echo, RouteOptions::default())?;
/// server.launch().await
/// # }
/// ```
pub struct RpcAsyncServer {
    connector: AsyncConnector,
    router: AsyncRouter,
    converter: Arc<dyn MessageConverter>,
    /// The number of requests the server processes before exiting.
    /// Unlimited if `None`.
    exit_after: Option<usize>,
}

impl RpcAsyncServer {
    /// A server decoding requests and encoding replies as JSON.
    pub fn new(connector: AsyncConnector) -> Self {
        Self {
            connector,
            router: AsyncRouter::new(),
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
        router: AsyncRouter,
        prefix: &str,
    ) -> Result<&mut Self, RpcError> {
        self.router.include_router(router, prefix)?;
        Ok(self)
    }

    /// Serve `method` with the async function `f`. See [`Router::register`].
    ///
    /// [`Router::register`]: crate::routing::Router::register
    pub fn register<F, Args, Fut, R, E>(
        &mut self,
        method: impl Into<String>,
        f: F,
        options: RouteOptions,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Serialize + Send,
        E: Into<HandlerError> + Send,
    {
        self.router.register(method, f, options)?;
        Ok(self)
    }

    /// Stop serving after `n` requests, once they have all been processed.
    pub fn exit_after(&mut self, n: usize) -> &mut Self {
        self.exit_after = Some(n);
        self
    }

    pub fn router(&self) -> &AsyncRouter {
        &self.router
    }

    /// The route list to hand over to callers, see [`RpcAsyncClient::with_route_timeouts`].
    ///
    /// [`RpcAsyncClient::with_route_timeouts`]: crate::clients::RpcAsyncClient::with_route_timeouts
    pub fn route_table(&self) -> Vec<RouteInfo> {
        self.router.route_table()
    }

    /// Serve requests until the process receives SIGTERM.
    ///
    /// You usually want to invoke `launch` at the end of your `main` function.
    pub async fn launch(self) -> Result<(), RpcError> {
        let shutdown = ShutdownHandler::sigterm().map_err(RpcError::Shutdown)?;
        self.run_until_shutdown(shutdown).await
    }

    /// Serve requests until `shutdown` is signalled.
    ///
    /// On shutdown the consumers are cancelled and the requests already received are processed
    /// before returning. If the server stops for any other reason, it signals `shutdown`
    /// for the rest of the application.
    #[tracing::instrument(skip_all, name = "rpc_server_run")]
    pub async fn run_until_shutdown(
        self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), RpcError> {
        if self.router.is_empty() {
            return Err(RpcError::Configuration("no method is registered".into()));
        }
        let manager = self.connector.channel_pool().manager();
        let mut bound =
            match BoundRoutes::bind(manager, self.connector.settings(), &self.router).await {
                Ok(bound) => bound,
                Err(e) => {
                    shutdown.shutdown();
                    return Err(e);
                }
            };

        let router = Arc::new(self.router);
        let mut task_handles = FuturesUnordered::new();
        let mut counter = 0;
        let mut cancelled = false;

        let signal = shutdown.wait_for_signal().fuse();
        tokio::pin!(signal);

        let result = 'event_loop: loop {
            // have we processed all the requests we want?
            if self.exit_after == Some(counter) {
                break 'event_loop Ok(());
            }

            tokio::select! {
                // prefer handling shutdowns over processing more requests
                biased;

                _ = &mut signal, if !cancelled => {
                    tracing::info!("rpc server received shutdown event");
                    bound.cancel().await;
                    cancelled = true;
                }

                // clear out some of our task handles
                Some(joined) = task_handles.next(), if !task_handles.is_empty() => {
                    log_task_failure(joined);
                }

                event = bound.next() => {
                    match event {
                        // all consumers have been cancelled
                        None => break 'event_loop Ok(()),
                        Some((_, Err(e))) => {
                            tracing::error!(error = ?e, "Consumer error");
                            break 'event_loop Err(RpcError::from(e));
                        }
                        Some((channel, Ok(delivery))) => {
                            // Spawn a task per request: a failure while processing one request
                            // does not tear the server down.
                            let future = process(
                                channel,
                                delivery,
                                Arc::clone(&router),
                                Arc::clone(&self.converter),
                            );
                            task_handles.push(tokio::spawn(future));
                            counter += 1;
                        }
                    }
                }
            }
        };

        // Make sure all tasks in flight complete before returning.
        while let Some(joined) = task_handles.next().await {
            log_task_failure(joined);
        }
        bound.close().await;
        shutdown.shutdown();

        result
    }
}

/// Process a request - dispatch to its handler, reply, ack against the AMQP broker.
#[tracing::instrument(
    name = "process_request",
    skip_all,
    fields(method = delivery.routing_key.as_str()),
    level = tracing::Level::DEBUG
)]
async fn process(
    channel: Channel,
    delivery: Delivery,
    router: Arc<AsyncRouter>,
    converter: Arc<dyn MessageConverter>,
) {
    let Some(route) = router.get(delivery.routing_key.as_str()) else {
        drop_unroutable(&delivery).await;
        return;
    };
    let outcome = match decode_request(converter.as_ref(), &delivery.data) {
        Ok(payload) => call_guarded(route.handler().as_ref(), payload).await,
        Err(e) => Err(e),
    };
    let reply = encode_reply(converter.as_ref(), route.method(), outcome);
    reply_and_ack(&channel, &delivery, converter.as_ref(), reply).await;
}

/// Call an async handler, turning a panic into a handler failure.
async fn call_guarded(handler: &dyn Handler, payload: Value) -> Result<Value, HandlerError> {
    AssertUnwindSafe(handler.call(payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("The handler panicked").into()))
}

fn log_task_failure(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = ?e, "A request processing task failed");
    }
}
