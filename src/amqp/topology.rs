//! Channel preparation and idempotent queue/exchange declarations.
use crate::amqp::configuration::RpcSettings;
use lapin::options::{
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};

/// Declaration flags of a request queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Everything a freshly opened channel needs before it can be handed out:
/// flow control and, optionally, the exchange requests are published to.
#[derive(Clone, Debug)]
pub struct ChannelSetup {
    prefetch_count: u16,
    exchange: Option<ExchangeSpec>,
}

#[derive(Clone, Debug)]
struct ExchangeSpec {
    name: String,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
}

impl ChannelSetup {
    pub fn from_settings(settings: &RpcSettings) -> Self {
        let exchange = (!settings.uses_default_exchange()).then(|| ExchangeSpec {
            name: settings.exchange.clone(),
            kind: settings.exchange_kind.clone(),
            durable: settings.durable,
            auto_delete: settings.auto_delete,
        });
        Self {
            prefetch_count: settings.prefetch_count,
            exchange,
        }
    }

    /// The exchange requests are published to. Empty for the default exchange.
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_ref().map(|e| e.name.as_str()).unwrap_or("")
    }

    /// Set the prefetch count and declare the configured exchange, if any.
    pub async fn prepare(&self, channel: &Channel) -> Result<(), lapin::Error> {
        self.prepare_with_prefetch(channel, self.prefetch_count)
            .await
    }

    /// Same as [`ChannelSetup::prepare`], overriding the prefetch count.
    pub async fn prepare_with_prefetch(
        &self,
        channel: &Channel,
        prefetch_count: u16,
    ) -> Result<(), lapin::Error> {
        channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        self.setup_exchange(channel).await
    }

    /// Declare the configured exchange. A no-op for the default exchange.
    ///
    /// Declarations are idempotent as long as the parameters do not change: re-declaring
    /// with different flags makes the broker close the channel.
    pub async fn setup_exchange(&self, channel: &Channel) -> Result<(), lapin::Error> {
        let Some(exchange) = &self.exchange else {
            return Ok(());
        };
        channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.clone(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
    }

    /// Declare the request queue for a method and, when a non-default exchange is configured,
    /// bind it using the method name as routing key.
    pub async fn setup_queue_declare(
        &self,
        channel: &Channel,
        queue_name: &str,
        options: QueueOptions,
    ) -> Result<(), lapin::Error> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        if let Some(exchange) = &self.exchange {
            channel
                .queue_bind(
                    queue_name,
                    &exchange.name,
                    queue_name,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }
}

/// Declare an exclusive, server-named queue to receive replies on.
///
/// The broker deletes it as soon as the declaring connection goes away or its last
/// consumer is cancelled.
pub async fn declare_reply_queue(channel: &Channel) -> Result<String, lapin::Error> {
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: true,
                auto_delete: true,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;
    Ok(queue.name().as_str().to_owned())
}
