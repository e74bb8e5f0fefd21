//! Request processing shared by the async and blocking servers: decode, dispatch,
//! reply, ack.
use crate::amqp::convenience::{reply_properties, RpcPropertiesExt};
use crate::amqp::publish;
use crate::converter::MessageConverter;
use crate::error::RpcError;
use crate::routing::HandlerError;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::Channel;
use serde_json::Value;
use tracing::{error, warn};

/// Decode the body of a request.
pub(crate) fn decode_request(
    converter: &dyn MessageConverter,
    body: &[u8],
) -> Result<Value, HandlerError> {
    converter.decode(body).map_err(HandlerError::MalformedRequest)
}

/// Turn the outcome of a handler into the body of the reply.
///
/// Failures are logged and converted into an error payload for the caller.
/// `None` if not even that can be encoded: the request gets acked without a reply.
pub(crate) fn encode_reply(
    converter: &dyn MessageConverter,
    method: &str,
    outcome: Result<Value, HandlerError>,
) -> Option<Vec<u8>> {
    let payload = match outcome {
        Ok(result) => result,
        Err(e) => {
            error!(
                method,
                error.kind = e.kind(),
                error.message = %e,
                error.details = ?e,
                "Failed to process the request"
            );
            e.to_payload()
        }
    };
    match converter.encode(&payload) {
        Ok(body) => Some(body),
        Err(e) => {
            error!(method, error = ?e, "Failed to encode the reply, the caller will time out");
            None
        }
    }
}

/// Publish the reply to the request's `reply_to` queue, then ack the request.
///
/// The request is acked only once the reply is out. If publishing the reply fails the request
/// is nacked and requeued, for another attempt.
pub(crate) async fn reply_and_ack(
    channel: &Channel,
    delivery: &Delivery,
    converter: &dyn MessageConverter,
    reply: Option<Vec<u8>>,
) {
    let properties = &delivery.properties;
    match (properties.reply_to_str(), reply) {
        (Some(reply_to), Some(body)) => {
            let reply_properties =
                reply_properties(properties.correlation_id_str(), converter.content_type());
            if let Err(e) = publish(channel, "", reply_to, false, &body, reply_properties).await {
                error!(reply_to, error = ?e, "Failed to publish the reply");
                nack(delivery).await;
                return;
            }
        }
        (None, _) => warn!("The request carries no reply_to queue, no reply is sent"),
        (Some(_), None) => {}
    }
    ack(delivery).await;
}

/// Drop a request nobody serves: there is no reply, the caller will time out.
pub(crate) async fn drop_unroutable(delivery: &Delivery) {
    warn!(
        routing_key = delivery.routing_key.as_str(),
        "No handler is registered for the requested method, dropping the request"
    );
    ack(delivery).await;
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
        error!(error = ?RpcError::from(e), "Failed to ack the request");
    }
}

async fn nack(delivery: &Delivery) {
    let options = BasicNackOptions {
        multiple: false,
        requeue: true,
    };
    if let Err(e) = delivery.acker.nack(options).await {
        error!(error = ?RpcError::from(e), "Failed to nack the request");
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_request, encode_reply};
    use crate::converter::JsonConverter;
    use crate::routing::HandlerError;
    use fake::{faker::lorem::en::Sentence, Fake};
    use serde_json::{json, Value};

    #[test]
    fn malformed_requests_turn_into_an_error_reply() {
        // Arrange
        let request = b"{not json";

        // Act
        let outcome = decode_request(&JsonConverter, request);
        let reply = encode_reply(&JsonConverter, "echo", outcome).unwrap();

        // Assert
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["error"]["kind"], json!("malformed_request"));
        assert!(reply["error"]["message"].is_string());
    }

    #[test]
    fn well_formed_requests_are_decoded() {
        let payload = decode_request(&JsonConverter, br#"{"msg": "hi"}"#).unwrap();

        assert_eq!(payload, json!({"msg": "hi"}));
    }

    #[test]
    fn handler_failures_carry_their_message() {
        let message: String = Sentence(3..6).fake();

        let reply = encode_reply(
            &JsonConverter,
            "transfer",
            Err(HandlerError::from(anyhow::anyhow!(message.clone()))),
        )
        .unwrap();

        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["error"]["kind"], json!("failed"));
        assert!(reply["error"]["message"]
            .as_str()
            .unwrap()
            .ends_with(&message));
    }

    #[test]
    fn results_are_encoded_as_is() {
        let reply = encode_reply(&JsonConverter, "echo", Ok(json!({"msg": "hi"}))).unwrap();

        assert_eq!(
            serde_json::from_slice::<Value>(&reply).unwrap(),
            json!({"msg": "hi"})
        );
    }
}
