use super::{decode_reply, ensure_open, CallOptions, RouteTimeouts};
use crate::amqp::convenience::{request_properties, RpcPropertiesExt};
use crate::amqp::publish;
use crate::amqp::topology::declare_reply_queue;
use crate::connectors::Connector;
use crate::converter::{JsonConverter, MessageConverter};
use crate::correlation::{get_correlation_id, Reply, ReplyMultiplexer, ReplySource};
use crate::error::RpcError;
use crate::routing::RouteInfo;
use futures_util::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use lapin::{Channel, ChannelState, Consumer};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Issue calls from blocking code.
///
/// All replies land in a single queue, `callback_queue`, consumed on a channel dedicated to
/// the client. Calls can be issued from several threads at once: each call occupies a pooled
/// channel until its reply arrives, so the channel pool bounds how many calls are in flight.
///
/// # Throughput
///
/// Only one caller at a time drains the callback queue, handing other callers' replies over
/// to them. Calls issued faster than they are answered queue up behind it.
///
/// # Example
///
/// ```rust,no_run
/// use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
/// use carrot_rpc::clients::{CallOptions, RpcSyncClient};
/// use carrot_rpc::connectors::Connector;
/// use serde_json::json;
///
/// # fn run() -> Result<(), carrot_rpc::RpcError> {
/// let connector = Connector::new(&RabbitMqSettings::default(), RpcSettings::default())?;
/// let client = RpcSyncClient::new(connector)?;
///
/// let reply = client.rpc_call("echo", &json!({"msg": "hi"}), CallOptions::default())?;
/// assert_eq!(reply, Some(json!({"msg": "hi"})));
/// # Ok(())
/// # }
/// ```
pub struct RpcSyncClient {
    connector: Connector,
    converter: Arc<dyn MessageConverter>,
    callback_channel: Channel,
    callback_queue: String,
    replies: ReplyMultiplexer<CallbackConsumer>,
    route_timeouts: RouteTimeouts,
}

impl RpcSyncClient {
    /// Declare the callback queue and start consuming from it.
    pub fn new(connector: Connector) -> Result<Self, RpcError> {
        let callback_channel = connector.open_channel()?;
        let callback_queue = connector.block_on(declare_reply_queue(&callback_channel))?;
        let consumer = connector.block_on(callback_channel.basic_consume(
            &callback_queue,
            "",
            BasicConsumeOptions {
                no_ack: true,
                exclusive: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        ))?;
        let replies = ReplyMultiplexer::new(CallbackConsumer {
            connector: connector.clone(),
            consumer,
        });

        Ok(Self {
            connector,
            converter: Arc::new(JsonConverter),
            callback_channel,
            callback_queue,
            replies,
            route_timeouts: RouteTimeouts::default(),
        })
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

    /// The name of the queue replies are published to.
    pub fn callback_queue(&self) -> &str {
        &self.callback_queue
    }

    /// Call the method served on `queue_name` with `body`, blocking until the reply arrives.
    ///
    /// Returns `Ok(None)` if no reply arrived within the timeout - or if the reply could not
    /// be decoded. The timeout covers the whole call, including the wait for a pooled channel.
    /// Fails with [`RpcError::ChannelClosedByBroker`] if the broker closed the
    /// channel the request was published on.
    #[tracing::instrument(
        name = "rpc_call",
        skip(self, body, options),
        fields(correlation_id = tracing::field::Empty)
    )]
    pub fn rpc_call(
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

        // Held until the reply arrives: the pool bounds the number of blocking calls.
        let deadline = Instant::now() + timeout;
        let Some(channel) = self.connector.get_channel_within(timeout)? else {
            return Ok(None);
        };

        let correlation_id = get_correlation_id();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        self.replies.register(&correlation_id);

        let properties = request_properties(
            &correlation_id,
            &self.callback_queue,
            self.converter.content_type(),
            options.expiration.then_some(timeout),
        );
        let published = self.connector.block_on(publish(
            &channel,
            self.connector.setup().exchange_name(),
            queue_name,
            self.connector.publisher_confirms(),
            &payload,
            properties,
        ));
        if let Err(e) = published {
            self.replies.forget(&correlation_id);
            return Err(e);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.replies.wait_for(&correlation_id, remaining)? {
            Some(body) => Ok(decode_reply(self.converter.as_ref(), &body)),
            None => {
                ensure_open(&channel)?;
                Ok(None)
            }
        }
    }

    /// Stop consuming replies and close the callback channel.
    /// The broker deletes the callback queue.
    pub fn close(self) -> Result<(), RpcError> {
        self.connector.close_channel(self.callback_channel)
    }
}

/// The consumer of the callback queue, polled on the connector's runtime.
struct CallbackConsumer {
    connector: Connector,
    consumer: Consumer,
}

impl ReplySource for CallbackConsumer {
    type Error = RpcError;

    fn next_reply(&mut self, wait: Duration) -> Result<Option<Reply>, RpcError> {
        let consumer = &mut self.consumer;
        let next = self
            .connector
            .block_on(async move { tokio::time::timeout(wait, consumer.next()).await });
        match next {
            Err(_elapsed) => Ok(None),
            // The stream ends once the broker closed the channel or cancelled the consumer.
            Ok(None) => Err(RpcError::ChannelClosedByBroker(
                lapin::Error::InvalidChannelState(ChannelState::Closed),
            )),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(delivery))) => Ok(Some(Reply {
                correlation_id: delivery.properties.correlation_id_str().map(str::to_owned),
                body: delivery.data,
            })),
        }
    }
}
