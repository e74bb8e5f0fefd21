use crate::amqp::configuration::{RabbitMqSettings, RpcSettings};
use crate::amqp::topology::{ChannelSetup, QueueOptions};
use crate::amqp::ConnectionFactory;
use crate::error::RpcError;
use crate::pool::{ChannelManager, ChannelPool, ConnectionPool, PooledChannel};
use lapin::{Channel, ChannelState};
use std::sync::Arc;
use std::time::Duration;

/// Owns a pool of connections to RabbitMq and a pool of channels carved from them,
/// for async callers.
///
/// Nothing is established eagerly: connections and channels are created on first use,
/// going through the retry policy of [`ConnectionFactory::connect`].
///
/// `AsyncConnector` is cheap to clone: clones share the same pools.
///
/// # Example
///
/// ```rust
/// use carrot_rpc::amqp::configuration::{RabbitMqSettings, RpcSettings};
/// use carrot_rpc::connectors::AsyncConnector;
///
/// let connector = AsyncConnector::new(&RabbitMqSettings::default(), RpcSettings::default())
///     .unwrap();
/// assert_eq!(connector.channel_pool().status().max_size, 10);
/// ```
#[derive(Clone)]
pub struct AsyncConnector {
    connection_pool: ConnectionPool,
    channel_pool: ChannelPool,
    settings: Arc<RpcSettings>,
}

impl AsyncConnector {
    pub fn new(rabbitmq: &RabbitMqSettings, settings: RpcSettings) -> Result<Self, RpcError> {
        let factory = ConnectionFactory::from_settings(rabbitmq)
            .map_err(|e| RpcError::Configuration(format!("{e:#}")))?;
        Self::with_factory(factory, settings)
    }

    /// Build the pools on top of a pre-configured [`ConnectionFactory`] - e.g. with a custom
    /// TLS connector.
    pub fn with_factory(
        factory: ConnectionFactory,
        settings: RpcSettings,
    ) -> Result<Self, RpcError> {
        let connection_pool = super::build_pool(factory, settings.connection_pool_max_size)?;
        let manager = ChannelManager::new(
            connection_pool.clone(),
            ChannelSetup::from_settings(&settings),
        )
        .with_publisher_confirmations(settings.publisher_confirms);
        let channel_pool = super::build_pool(manager, settings.channel_pool_max_size)?;

        Ok(Self {
            connection_pool,
            channel_pool,
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &RpcSettings {
        &self.settings
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connection_pool
    }

    pub fn channel_pool(&self) -> &ChannelPool {
        &self.channel_pool
    }

    pub(crate) fn setup(&self) -> &ChannelSetup {
        self.channel_pool.manager().setup()
    }

    pub(crate) fn publisher_confirms(&self) -> bool {
        self.channel_pool.manager().publisher_confirms
    }

    /// Check a prepared channel out of the pool. It goes back to the pool when dropped,
    /// whichever way the caller exits.
    ///
    /// Waits while all channels are checked out.
    pub async fn get_channel(&self) -> Result<PooledChannel, RpcError> {
        Ok(self.channel_pool.get().await?)
    }

    /// Same as [`AsyncConnector::get_channel`], waiting at most `budget`.
    /// `None` if no channel became available in time.
    pub async fn get_channel_within(
        &self,
        budget: Duration,
    ) -> Result<Option<PooledChannel>, RpcError> {
        super::checkout_within(budget, self.channel_pool.get()).await
    }

    /// Open a dedicated channel, outside of the channel pool - e.g. for a long-lived consumer.
    ///
    /// The connection it is carved from stays in the connection pool.
    pub async fn open_channel(&self) -> Result<Channel, RpcError> {
        Ok(self.channel_pool.manager().open_channel().await?)
    }

    /// Close a channel obtained from [`AsyncConnector::open_channel`].
    ///
    /// A channel the broker already closed is released without error.
    pub async fn close_channel(&self, channel: Channel) -> Result<(), RpcError> {
        if !matches!(channel.status().state(), ChannelState::Connected) {
            return Ok(());
        }
        channel.close(200, "Bye").await?;
        Ok(())
    }

    /// Declare the configured exchange. A no-op for the broker's default exchange.
    pub async fn setup_exchange(&self, channel: &Channel) -> Result<(), RpcError> {
        self.setup().setup_exchange(channel).await?;
        Ok(())
    }

    /// Declare `queue_name` and, with a named exchange, bind it using `queue_name` as routing key.
    pub async fn setup_queue_declare(
        &self,
        channel: &Channel,
        queue_name: &str,
        options: QueueOptions,
    ) -> Result<(), RpcError> {
        self.setup()
            .setup_queue_declare(channel, queue_name, options)
            .await?;
        Ok(())
    }
}
