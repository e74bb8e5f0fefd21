use super::{decode_reply, ensure_open, CallOptions, RouteTimeouts};
use crate::amqp::convenience::{request_properties, RpcPropertiesExt};
use crate::amqp::publish;
use crate::amqp::topology::declare_reply_queue;
use crate::connectors::AsyncConnector;
use crate::converter::{JsonConverter, MessageConverter};
use crate::correlation::{get_correlation_id, PendingRequests, Reply};
use crate::error::RpcError;
use crate::routing::RouteInfo;
use futures_util::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::{Channel, Consumer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::warn;

/// Issue calls from async code.
///
/// Every call checks a channel out of the [`AsyncConnector`]'s pool and consumes its reply from
/// a transient queue of its own: any number of calls can be in flight on the same client, each
/// waiting for the reply carrying its correlation id.
///
/// `RpcAsyncClient` is cheap to clone: clones share the same pools and pending-request table.
///
/// # Example
///
/// ```rust,no_run
/// use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
/// use carrot_rpc::clients::{CallOptions, RpcAsyncClient};
/// use carrot_rpc::connectors::AsyncConnector;
/// use serde_json::json;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), carrot_rpc::RpcError> {
/// let connector = AsyncConnector::new(&RabbitMqSettings::default(), RpcSettings::default())?;
/// let client = RpcAsyncClient::new(connector);
///
/// let options = CallOptions::default().timeout(Duration::from_secs(2));
/// match client.rpc_call("echo", &json!({"msg": "hi"}), options).await? {
///     Some(reply) => println!("{reply}"),
///     None => println!("nobody answered in time"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcAsyncClient {
    connector: AsyncConnector,
    converter: Arc<dyn MessageConverter>,
    pending: Arc<PendingRequests>,
    route_timeouts: RouteTimeouts,
}

impl RpcAsyncClient {
    /// A client encoding payloads as JSON.
    pub fn new(connector: AsyncConnector) -> Self {
        Self {
            connector,
            converter: Arc::new(JsonConverter),
            pending: Arc::default(),
            route_timeouts: RouteTimeouts::default(),
        }
    }

    /// Encode requests and decode replies with `converter`.
    /// It must match the converter used by the server.
    #[must_use]
    pub fn with_converter(mut self, converter: impl MessageConverter) -> Self {
        self.converter = Arc::new(converter);
        self
    }

    /// Honour the per-route default timeouts of the server's route table when a call does not
    /// specify its own timeout.
    #[must_use]
    pub fn with_route_timeouts(mut self, routes: impl IntoIterator<Item = RouteInfo>) -> Self {
        self.route_timeouts.extend(routes);
        self
    }

    /// Number of calls still waiting for their reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Call the method served on `queue_name` with `body`.
    ///
    /// Returns `Ok(None)` if no reply arrived within the timeout - or if the reply could not
    /// be decoded. The call is not retried.
    ///
    /// The timeout covers the whole call, including the wait for a pooled channel.
    #[tracing::instrument(
        name = "rpc_call",
        skip(self, body, options),
        fields(correlation_id = tracing::field::Empty)
    )]
    pub async fn rpc_call(
        &self,
        queue_name: &str,
        body: &Value,
        options: CallOptions,
    ) -> Result<Option<Value>, RpcError> {
        let timeout = self.route_timeouts.resolve(
            queue_name,
            &options,
            self.connector.settings().default_timeout(),
        )?;
        let payload = self.converter.encode(body).map_err(RpcError::Conversion)?;

        let deadline = Instant::now() + timeout;
        let Some(channel) = self.connector.get_channel_within(timeout).await? else {
            return Ok(None);
        };
        let reply_queue = declare_reply_queue(&channel).await?;
        let consumer = channel
            .basic_consume(
                &reply_queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let replies = ReplyConsumer::spawn(&channel, consumer, Arc::clone(&self.pending));

        let correlation_id = get_correlation_id();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        // Register before publishing, the reply could beat us otherwise.
        let pending = self.pending.register(correlation_id.clone());

        let properties = request_properties(
            &correlation_id,
            &reply_queue,
            self.converter.content_type(),
            options.expiration.then_some(timeout),
        );
        publish(
            &channel,
            self.connector.setup().exchange_name(),
            queue_name,
            self.connector.publisher_confirms(),
            &payload,
            properties,
        )
        .await?;

        let reply = pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await;
        replies.cancel().await;

        match reply {
            Some(body) => Ok(decode_reply(self.converter.as_ref(), &body)),
            None => {
                ensure_open(&channel)?;
                Ok(None)
            }
        }
    }
}

/// The consumer of a call's reply queue, forwarding replies to the pending-request table.
///
/// Cancelling the consumer makes the broker delete the queue.
/// If the call is abandoned before [`ReplyConsumer::cancel`], dropping cancels it
/// in the background.
struct ReplyConsumer {
    channel: Channel,
    consumer_tag: ShortString,
    forwarder: JoinHandle<()>,
    cancelled: bool,
}

impl ReplyConsumer {
    fn spawn(channel: &Channel, mut consumer: Consumer, pending: Arc<PendingRequests>) -> Self {
        let consumer_tag = consumer.tag();
        let forwarder = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => pending.dispatch(Reply {
                        correlation_id: delivery.properties.correlation_id_str().map(str::to_owned),
                        body: delivery.data,
                    }),
                    Err(e) => {
                        warn!(error = ?e, "The reply consumer failed");
                        break;
                    }
                }
            }
        });
        Self {
            channel: channel.clone(),
            consumer_tag,
            forwarder,
            cancelled: false,
        }
    }

    async fn cancel(mut self) {
        self.forwarder.abort();
        self.cancelled = true;
        if let Err(e) = self
            .channel
            .basic_cancel(self.consumer_tag.as_str(), BasicCancelOptions::default())
            .await
        {
            warn!(error = ?e, "Failed to cancel the reply consumer");
        }
    }
}

impl Drop for ReplyConsumer {
    fn drop(&mut self) {
        self.forwarder.abort();
        if self.cancelled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = self.channel.clone();
        let consumer_tag = self.consumer_tag.clone();
        runtime.spawn(async move {
            let _ = channel
                .basic_cancel(consumer_tag.as_str(), BasicCancelOptions::default())
                .await;
        });
    }
}
