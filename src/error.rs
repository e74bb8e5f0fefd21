use crate::converter::ConversionError;
use lapin::message::BasicReturnMessage;

/// Error returned by connectors, clients and servers.
///
/// A call that times out is **not** an error: clients resolve it to `Ok(None)`.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("Failed to connect to RabbitMq after {attempts} attempt(s)")]
    Connection {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    /// The broker closed the channel - e.g. a declaration conflicting with an existing
    /// queue or a policy violation. The request was never accepted.
    #[error("The RabbitMq broker closed the channel")]
    ChannelClosedByBroker(#[source] lapin::Error),
    #[error("Failed to communicate with the RabbitMq broker")]
    Transport(#[source] lapin::Error),
    #[error("Failed to acquire a healthy resource from the pool")]
    Pool(#[source] crate::pool::Error),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Failed to encode the request payload")]
    Conversion(#[source] ConversionError),
    #[error("The request could not be routed to any queue")]
    Unroutable(Box<BasicReturnMessage>),
    #[error("The RabbitMq broker nacked the request: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
    #[error("Failed to start the runtime driving blocking calls")]
    Runtime(#[source] std::io::Error),
    #[error("Failed to register the shutdown signal handler")]
    Shutdown(#[source] std::io::Error),
}

impl RpcError {
    /// `true` if the broker refused the request, as opposed to a transport failure or timeout.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::ChannelClosedByBroker(_))
    }
}

impl From<lapin::Error> for RpcError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(_) | lapin::Error::InvalidChannelState(_) => {
                Self::ChannelClosedByBroker(err)
            }
            err => Self::Transport(err),
        }
    }
}

impl From<crate::pool::Error> for RpcError {
    fn from(err: crate::pool::Error) -> Self {
        // Surface connection and broker failures behind the pool with their own variants.
        let inner = match err.into_inner().downcast::<RpcError>() {
            Ok(rpc_error) => return rpc_error,
            Err(inner) => inner,
        };
        match inner.downcast::<lapin::Error>() {
            Ok(lapin_error) => lapin_error.into(),
            Err(inner) => Self::Pool(inner.into()),
        }
    }
}

impl From<deadpool::managed::PoolError<crate::pool::Error>> for RpcError {
    fn from(err: deadpool::managed::PoolError<crate::pool::Error>) -> Self {
        crate::pool::Error::from(err).into()
    }
}
