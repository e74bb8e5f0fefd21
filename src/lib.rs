//! `carrot-rpc` is a request/reply framework, built on top of [`lapin`],
//! to call functions served by another process through RabbitMq.
//!
//! A server registers handlers on a [`Router`](crate::routing::Router), one per method name,
//! and consumes requests from one queue per method. A client publishes a request on the
//! method's queue, tagged with a correlation id and the queue it expects the reply on, and
//! waits for the matching reply - up to a timeout.
//!
//! Both sides come in two flavours:
//! - [`RpcAsyncClient`](crate::clients::RpcAsyncClient) and
//!   [`RpcAsyncServer`](crate::servers::RpcAsyncServer), for async code, on top of pooled
//!   connections and channels ([`AsyncConnector`](crate::connectors::AsyncConnector));
//! - [`RpcSyncClient`](crate::clients::RpcSyncClient) and
//!   [`RpcSyncServer`](crate::servers::RpcSyncServer), for blocking code, on top of a single
//!   connection ([`Connector`](crate::connectors::Connector)).
//!
//! Payloads are [`serde_json::Value`]s, encoded on the wire by a
//! [`MessageConverter`](crate::converter::MessageConverter) - JSON by default.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.
pub mod amqp;
pub mod clients;
pub mod connectors;
pub mod converter;
pub mod correlation;
mod error;
pub mod pool;
pub mod routing;
pub mod servers;

pub use error::RpcError;
