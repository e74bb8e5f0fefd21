use crate::error::RpcError;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};

/// Reply Code 312 - NO_ROUTE.
/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;

/// Publish a payload on a RabbitMq exchange, waiting for publisher confirmation from the
/// RabbitMq broker if the channel has them enabled.
///
/// The mandatory flag tells the broker how to react if the message cannot be routed to a queue.
/// If this flag is `true`, the broker will return an unroutable message with a Return method.
/// If this flag is `false`, the broker silently drops the message.
#[tracing::instrument(level = "debug", skip(channel, payload, properties))]
pub(crate) async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    mandatory: bool,
    payload: &[u8],
    properties: BasicProperties,
) -> Result<(), RpcError> {
    let options = BasicPublishOptions {
        mandatory,
        // The immediate flag was dropped in RabbitMQ 3.0, setting it causes a not-supported error.
        immediate: false,
    };
    let confirm = channel
        .basic_publish(exchange, routing_key, options, payload, properties)
        .await?
        .await?;

    match confirm {
        Confirmation::Ack(Some(return_message)) if return_message.reply_code == NO_ROUTE => {
            Err(RpcError::Unroutable(return_message))
        }
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(nack) => Err(RpcError::NegativeAck(nack)),
    }
}
