//! Implements [`Manager`] for [`Channel`].
use crate::amqp::topology::ChannelSetup;
use deadpool::managed::{self, Manager};
use lapin::{options::ConfirmSelectOptions, Channel, ChannelState, Connection};
use std::sync::Arc;

use super::connection::ConnectionPool;

/// `ChannelPool` pools [`Channel`]s.
///
/// It maintains an internal pool of connections to the rabbitmq instance.
pub type ChannelPool = deadpool::managed::Pool<ChannelManager>;

/// A channel checked out of a [`ChannelPool`].
///
/// It goes back to the pool when dropped.
pub type PooledChannel = managed::Object<ChannelManager>;

/// Where a [`ChannelManager`] carves its channels from.
enum ConnectionSource {
    /// A pool of connections, for the cooperative mode.
    Pooled(ConnectionPool),
    /// A single long-lived connection, for the blocking mode.
    Shared(Arc<Connection>),
}

/// `ChannelManager` implements [Manager] to manage a pool of [`Channel`]s.
///
/// `ChannelManager` keeps an internal [`ConnectionPool`] (or a single shared connection)
/// in order to reuse connections across channels.
/// Every channel it creates is prepared with the configured [`ChannelSetup`].
pub struct ChannelManager {
    source: ConnectionSource,
    setup: ChannelSetup,
    pub(crate) publisher_confirms: bool,
}

impl ChannelManager {
    /// Construct `ChannelManager` on top of a connection pool.
    ///
    /// By default, channels are created without publisher confirmations,
    /// but you can opt in using [`ChannelManager::with_publisher_confirmations`]
    pub fn new(connection_pool: ConnectionPool, setup: ChannelSetup) -> Self {
        Self {
            source: ConnectionSource::Pooled(connection_pool),
            setup,
            publisher_confirms: false,
        }
    }

    /// Construct `ChannelManager` multiplexing all its channels over one connection.
    pub fn over_connection(connection: Arc<Connection>, setup: ChannelSetup) -> Self {
        Self {
            source: ConnectionSource::Shared(connection),
            setup,
            publisher_confirms: false,
        }
    }

    /// Enable publisher confirmations on every channel.
    #[must_use]
    pub fn with_publisher_confirmations(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }

    pub(crate) fn setup(&self) -> &ChannelSetup {
        &self.setup
    }

    /// Open a new, prepared channel.
    ///
    /// The connection it was carved from stays in its pool: connections multiplex many
    /// channels, so there is no need to hold on to the pooled object.
    pub(crate) async fn open_channel(&self) -> Result<Channel, super::Error> {
        let channel = self.create_channel().await?;
        self.setup.prepare(&channel).await?;
        Ok(channel)
    }

    /// Same as [`ChannelManager::open_channel`], with its own prefetch count.
    pub(crate) async fn open_channel_with_prefetch(
        &self,
        prefetch_count: u16,
    ) -> Result<Channel, super::Error> {
        let channel = self.create_channel().await?;
        self.setup
            .prepare_with_prefetch(&channel, prefetch_count)
            .await?;
        Ok(channel)
    }

    async fn create_channel(&self) -> Result<Channel, super::Error> {
        let channel = match &self.source {
            ConnectionSource::Pooled(pool) => pool.get().await?.create_channel().await?,
            ConnectionSource::Shared(connection) => connection.create_channel().await?,
        };
        Ok(channel)
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = Channel;
    type Error = super::Error;

    async fn create(&self) -> Result<Channel, super::Error> {
        let channel = self.open_channel().await?;
        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(channel)
    }

    async fn recycle(&self, obj: &mut Channel) -> managed::RecycleResult<super::Error> {
        match obj.status().state() {
            ChannelState::Connected => Ok(()),
            state => Err(managed::RecycleError::Message(format!(
                "Channel is not in an healthy state {state:?}",
            ))),
        }
    }
}
