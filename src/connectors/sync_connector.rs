use crate::amqp::configuration::{RabbitMqSettings, RpcSettings};
use crate::amqp::topology::{ChannelSetup, QueueOptions};
use crate::amqp::ConnectionFactory;
use crate::error::RpcError;
use crate::pool::{ChannelManager, ChannelPool, PooledChannel};
use lapin::{Channel, ChannelState, Connection};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Owns a single connection to RabbitMq and the channels carved from it, for blocking callers.
///
/// Every operation blocks the calling thread until the broker answered.
/// `Connector` drives the underlying I/O on a small private runtime: it must **not** be used
/// from within an async context (use [`AsyncConnector`] there).
///
/// `Connector` is cheap to clone: clones share the same connection and channel pool.
///
/// [`AsyncConnector`]: crate::connectors::AsyncConnector
#[derive(Clone)]
pub struct Connector {
    runtime: Arc<Runtime>,
    connection: Arc<Connection>,
    channel_pool: ChannelPool,
    settings: Arc<RpcSettings>,
}

impl Connector {
    /// Connect to RabbitMq.
    ///
    /// The connection is attempted `connection_attempts` times before giving up with
    /// [`RpcError::Connection`].
    pub fn new(rabbitmq: &RabbitMqSettings, settings: RpcSettings) -> Result<Self, RpcError> {
        let factory = ConnectionFactory::from_settings(rabbitmq)
            .map_err(|e| RpcError::Configuration(format!("{e:#}")))?;
        Self::with_factory(&factory, settings)
    }

    /// Connect to RabbitMq using a pre-configured [`ConnectionFactory`] - e.g. with a custom
    /// TLS connector.
    pub fn with_factory(
        factory: &ConnectionFactory,
        settings: RpcSettings,
    ) -> Result<Self, RpcError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("carrot-rpc-io")
            .enable_all()
            .build()
            .map_err(RpcError::Runtime)?;
        let connection = Arc::new(runtime.block_on(factory.connect())?);

        let setup = ChannelSetup::from_settings(&settings);
        let manager = ChannelManager::over_connection(Arc::clone(&connection), setup)
            .with_publisher_confirmations(settings.publisher_confirms);
        let channel_pool = super::build_pool(manager, settings.channel_pool_max_size)?;

        Ok(Self {
            runtime: Arc::new(runtime),
            connection,
            channel_pool,
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &RpcSettings {
        &self.settings
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

    /// Drive `future` to completion on the connector's runtime.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Open a dedicated channel, with the configured prefetch count and exchange in place.
    ///
    /// The caller owns the channel until it hands it back to [`Connector::close_channel`].
    pub fn open_channel(&self) -> Result<Channel, RpcError> {
        let manager = self.channel_pool.manager();
        Ok(self.block_on(manager.open_channel())?)
    }

    /// Check a prepared channel out of the pool. It goes back to the pool when dropped.
    ///
    /// Blocks while all channels are checked out.
    pub fn get_channel(&self) -> Result<PooledChannel, RpcError> {
        Ok(self.block_on(self.channel_pool.get())?)
    }

    /// Same as [`Connector::get_channel`], blocking at most `budget`.
    /// `None` if no channel became available in time.
    pub fn get_channel_within(
        &self,
        budget: Duration,
    ) -> Result<Option<PooledChannel>, RpcError> {
        self.block_on(super::checkout_within(budget, self.channel_pool.get()))
    }

    /// Close a channel obtained from [`Connector::open_channel`].
    ///
    /// A channel the broker already closed is released without error.
    pub fn close_channel(&self, channel: Channel) -> Result<(), RpcError> {
        if !matches!(channel.status().state(), ChannelState::Connected) {
            return Ok(());
        }
        self.block_on(channel.close(200, "Bye"))?;
        Ok(())
    }

    /// Declare the configured exchange. A no-op for the broker's default exchange.
    pub fn setup_exchange(&self, channel: &Channel) -> Result<(), RpcError> {
        self.block_on(self.setup().setup_exchange(channel))?;
        Ok(())
    }

    /// Declare `queue_name` and, with a named exchange, bind it using `queue_name` as routing key.
    pub fn setup_queue_declare(
        &self,
        channel: &Channel,
        queue_name: &str,
        options: QueueOptions,
    ) -> Result<(), RpcError> {
        self.block_on(self.setup().setup_queue_declare(channel, queue_name, options))?;
        Ok(())
    }

    /// Close the connection to RabbitMq, for every clone of this connector.
    pub fn close(&self) -> Result<(), RpcError> {
        self.block_on(self.connection.close(200, "Bye"))?;
        Ok(())
    }
}
