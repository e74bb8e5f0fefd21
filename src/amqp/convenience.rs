//! Helpers to read and write the AMQP properties the request/reply idiom relies on.
use lapin::{types::ShortString, BasicProperties};
use std::time::Duration;

/// Delivery mode for requests and replies: non-persistent.
///
/// RPC messages are only meaningful while the caller is waiting for them.
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Convenience accessors for the request/reply properties of [`lapin::BasicProperties`].
pub trait RpcPropertiesExt {
    /// The correlation id, if any.
    fn correlation_id_str(&self) -> Option<&str>;

    /// The queue the reply must be published to, if any.
    fn reply_to_str(&self) -> Option<&str>;
}

impl RpcPropertiesExt for BasicProperties {
    fn correlation_id_str(&self) -> Option<&str> {
        self.correlation_id().as_ref().map(ShortString::as_str)
    }

    fn reply_to_str(&self) -> Option<&str> {
        self.reply_to().as_ref().map(ShortString::as_str)
    }
}

/// Properties of an outgoing request.
///
/// When `expiration` is set the broker discards the request if it has not been consumed
/// within that window.
pub fn request_properties(
    correlation_id: &str,
    reply_to: &str,
    content_type: &str,
    expiration: Option<Duration>,
) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_correlation_id(correlation_id.into())
        .with_reply_to(reply_to.into())
        .with_content_type(content_type.into())
        .with_delivery_mode(TRANSIENT_DELIVERY_MODE);
    match expiration {
        Some(ttl) => properties.with_expiration(expiration_header(ttl)),
        None => properties,
    }
}

/// Properties of the reply to a request carrying `correlation_id`.
pub fn reply_properties(correlation_id: Option<&str>, content_type: &str) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(content_type.into())
        .with_delivery_mode(TRANSIENT_DELIVERY_MODE);
    match correlation_id {
        Some(id) => properties.with_correlation_id(id.into()),
        None => properties,
    }
}

/// AMQP expresses per-message TTLs as a string holding a number of milliseconds.
///
/// A zero TTL would make the broker drop the message right away, so we round up to 1ms.
pub fn expiration_header(ttl: Duration) -> ShortString {
    ttl.as_millis().max(1).to_string().into()
}
