//! Clients issuing calls: publish a request tagged with a fresh correlation id and a reply-to
//! queue, then wait for the matching reply, bounded by a timeout.
//!
//! A call that times out resolves to `Ok(None)`: the caller cannot tell whether the request
//! was never processed, was processed too slowly or was addressed to a method nobody serves.
//! Enable `publisher_confirms` in [`RpcSettings`] to get [`RpcError::Unroutable`] for requests
//! addressed to a queue that does not exist.
//!
//! [`RpcSettings`]: crate::amqp::configuration::RpcSettings
//! [`RpcError::Unroutable`]: crate::RpcError::Unroutable
mod async_client;
mod options;
mod sync_client;

pub use async_client::RpcAsyncClient;
pub use options::CallOptions;
pub use sync_client::RpcSyncClient;

use crate::converter::MessageConverter;
use crate::error::RpcError;
use crate::routing::RouteInfo;
use lapin::{Channel, ChannelState};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Default timeouts advertised by the server's routes, keyed by method name.
#[derive(Clone, Debug, Default)]
struct RouteTimeouts(HashMap<String, Duration>);

impl RouteTimeouts {
    fn extend(&mut self, routes: impl IntoIterator<Item = RouteInfo>) {
        self.0.extend(
            routes
                .into_iter()
                .filter_map(|route| Some((route.method, route.timeout?))),
        );
    }

    /// The explicit timeout wins over the route default, which wins over `fallback`.
    fn resolve(
        &self,
        queue_name: &str,
        options: &CallOptions,
        fallback: Duration,
    ) -> Result<Duration, RpcError> {
        let timeout = options
            .timeout
            .or_else(|| self.0.get(queue_name).copied())
            .unwrap_or(fallback);
        if timeout.is_zero() {
            return Err(RpcError::Configuration(format!(
                "the timeout of a call to `{queue_name}` must be positive"
            )));
        }
        Ok(timeout)
    }
}

/// A reply that cannot be decoded is treated like no reply at all.
fn decode_reply(converter: &dyn MessageConverter, body: &[u8]) -> Option<Value> {
    match converter.decode(body) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = ?e, "Discarding an undecodable reply");
            None
        }
    }
}

/// A call that got no reply on a channel the broker closed was never accepted.
fn ensure_open(channel: &Channel) -> Result<(), RpcError> {
    match channel.status().state() {
        ChannelState::Connected => Ok(()),
        state => Err(RpcError::ChannelClosedByBroker(
            lapin::Error::InvalidChannelState(state),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_reply, CallOptions, RouteTimeouts};
    use crate::converter::JsonConverter;
    use crate::routing::RouteInfo;
    use crate::RpcError;
    use serde_json::json;
    use std::time::Duration;

    fn route(method: &str, timeout: Option<u64>) -> RouteInfo {
        RouteInfo {
            method: method.into(),
            timeout: timeout.map(Duration::from_secs),
        }
    }

    #[test]
    fn explicit_timeouts_win_over_route_defaults() {
        let mut timeouts = RouteTimeouts::default();
        timeouts.extend([route("slow", Some(30)), route("fast", None)]);
        let fallback = Duration::from_secs(10);

        let explicit = CallOptions::default().timeout(Duration::from_secs(1));

        assert_eq!(
            timeouts.resolve("slow", &explicit, fallback).unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            timeouts
                .resolve("slow", &CallOptions::default(), fallback)
                .unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            timeouts
                .resolve("fast", &CallOptions::default(), fallback)
                .unwrap(),
            fallback
        );
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let options = CallOptions::default().timeout(Duration::ZERO);

        let outcome = RouteTimeouts::default().resolve("echo", &options, Duration::from_secs(1));

        assert!(matches!(outcome, Err(RpcError::Configuration(_))));
    }

    #[test]
    fn undecodable_replies_are_treated_as_missing() {
        assert_eq!(decode_reply(&JsonConverter, b"{\"msg\":\"hi\"}"), Some(json!({"msg": "hi"})));
        assert_eq!(decode_reply(&JsonConverter, b"\xff\xfe"), None);
    }

    #[test]
    fn calls_expire_by_default() {
        assert!(CallOptions::default().expiration);
        assert!(!CallOptions::default().expiration(false).expiration);
    }
}
