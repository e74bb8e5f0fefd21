use crate::amqp::configuration::{RabbitMqSettings, RabbitMqTlsSettings};
use crate::error::RpcError;
use anyhow::Context;
use futures_util::FutureExt;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to a RabbitMq broker: where to, how long to wait, how often to retry,
/// and whether to speak TLS.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    /// Never zero.
    connection_attempts: u32,
    retry_delay: Duration,
    /// Plain TCP if `None`.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    /// The domain the broker's certificate is checked against.
    domain: String,
}

impl Tls {
    fn from_settings(
        settings: &RabbitMqTlsSettings,
        uri: &AMQPUri,
    ) -> Result<Self, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = settings.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        Ok(Self {
            connector: builder.build().context("TLS configuration failed")?,
            domain: settings
                .domain
                .clone()
                .unwrap_or_else(|| uri.authority.host.clone()),
        })
    }
}

impl ConnectionFactory {
    /// Build a factory from `settings`.
    ///
    /// The connect timeout defaults to 10 seconds, a zero `connection_attempts` counts as one.
    pub fn from_settings(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let uri = settings.amqp_uri()?;
        let tls = match &settings.tls {
            Some(tls_settings) => Some(Arc::new(Tls::from_settings(tls_settings, &uri)?)),
            None => None,
        };
        Ok(Self {
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            connection_attempts: settings.connection_attempts.max(1),
            retry_delay: settings.retry_delay(),
            tls,
            uri,
        })
    }

    /// Speak TLS through `connector`, checking the broker's certificate against `domain`
    /// (the broker's host name if `None`).
    #[must_use]
    pub fn with_tls_connector(
        mut self,
        connector: NativeTlsConnector,
        domain: Option<String>,
    ) -> Self {
        let domain = domain.unwrap_or_else(|| self.uri.authority.host.clone());
        self.tls = Some(Arc::new(Tls { connector, domain }));
        self
    }

    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    /// Open a connection, making up to `connection_attempts` attempts `retry_delay` apart.
    ///
    /// The last failure is surfaced as [`RpcError::Connection`].
    pub async fn connect(&self) -> Result<Connection, RpcError> {
        let mut attempt = 1;
        loop {
            let error = match self.connect_once().await {
                Ok(connection) => return Ok(connection),
                Err(e) => e,
            };
            if attempt == self.connection_attempts {
                return Err(RpcError::Connection {
                    attempts: attempt,
                    source: error,
                });
            }
            warn!(
                attempt,
                max_attempts = self.connection_attempts,
                error = ?error,
                "Failed to connect to RabbitMq, retrying in {:?}",
                self.retry_delay
            );
            tokio::time::sleep(self.retry_delay).await;
            attempt += 1;
        }
    }

    /// A single connection attempt, bounded by `connection_timeout`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    async fn connect_once(&self) -> Result<Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connecting = match &self.tls {
            None => Connection::connect_uri(self.uri.clone(), properties).boxed(),
            Some(tls) => self.connect_over_tls(properties, Arc::clone(tls)).boxed(),
        };
        let connection = tokio::time::timeout(self.connection_timeout, connecting)
            .await
            .context("Timed out while connecting to RabbitMq")??;
        connection.on_error(|e| warn!(error = ?e, "RabbitMq connection broken"));
        Ok(connection)
    }

    async fn connect_over_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<Connection, lapin::Error> {
        let tcp_connect = move |uri: &AMQPUri| {
            // TCP first, then the TLS handshake against the expected domain.
            let mut plain = uri.clone();
            plain.scheme = AMQPScheme::AMQP;
            plain
                .connect()
                .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
        };
        Connection::connector(self.uri.clone(), Box::new(tcp_connect), properties).await
    }
}
