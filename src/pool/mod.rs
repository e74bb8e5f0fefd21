//! Provides pooling for a [`lapin::Channel`] and [`lapin::Connection`] using [`deadpool`].
//!
//! This module provides three key guarantees:
//! - No more than `max_size` objects are ever checked out of a pool at the same time;
//!   callers beyond that wait for a release.
//! - Disposing of broken channels and recreating new ones on-demand.
//! - Reusing connection objects across channels to limit overhead.
//!
//! Checked out objects return to their pool when dropped, on every exit path.
//!
//! ```rust
//! use carrot_rpc::pool::{ChannelManager, ChannelPool, ConnectionPool};
//! use carrot_rpc::amqp::ConnectionFactory;
//! use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
//! use carrot_rpc::amqp::topology::ChannelSetup;
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!
//!     let connection_pool = ConnectionPool::builder(ConnectionFactory::from_settings(&settings)?)
//!             .max_size(2)
//!             .build()?;
//!
//!     let setup = ChannelSetup::from_settings(&RpcSettings::default());
//!     let pool = ChannelPool::builder(ChannelManager::new(connection_pool, setup))
//!         .max_size(10)
//!         .build()?;
//!
//!     // get a new Channel from the pool.
//!     let channel = pool.get().await?;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelManager, ChannelPool, PooledChannel};
pub use connection::ConnectionPool;
pub use error::Error;
