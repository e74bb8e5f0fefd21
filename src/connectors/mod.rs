//! Resource owners: the connection(s) to RabbitMq and the channels carved from them.
//!
//! [`Connector`] serves blocking clients and servers, [`AsyncConnector`] serves async ones.
mod async_connector;
mod sync_connector;

pub use async_connector::AsyncConnector;
pub use sync_connector::Connector;

use crate::error::RpcError;
use deadpool::managed::{Manager, Pool};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

fn build_pool<M>(manager: M, max_size: usize) -> Result<Pool<M>, RpcError>
where
    M: Manager,
    M::Error: std::fmt::Debug,
{
    if max_size == 0 {
        return Err(RpcError::Configuration(
            "pool sizes must be at least 1".into(),
        ));
    }
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| RpcError::Configuration(format!("failed to build the pool: {e:?}")))
}

/// Wait at most `budget` for a pooled object. `None` if the pool stayed exhausted.
async fn checkout_within<T, E>(
    budget: Duration,
    checkout: impl Future<Output = Result<T, E>>,
) -> Result<Option<T>, RpcError>
where
    RpcError: From<E>,
{
    match tokio::time::timeout(budget, checkout).await {
        Ok(checked_out) => Ok(Some(checked_out?)),
        Err(_) => {
            warn!(?budget, "No pooled channel became available in time");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::checkout_within;
    use crate::RpcError;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn an_exhausted_pool_gives_up_at_the_deadline() {
        let budget = Duration::from_millis(100);
        let started = Instant::now();

        let outcome = checkout_within(
            budget,
            std::future::pending::<Result<(), lapin::Error>>(),
        )
        .await;

        assert!(matches!(outcome, Ok(None)));
        assert!(started.elapsed() >= budget);
    }

    #[tokio::test]
    async fn available_objects_are_handed_over() {
        let outcome = checkout_within(
            Duration::from_secs(1),
            std::future::ready(Ok::<_, lapin::Error>(42)),
        )
        .await;

        assert_eq!(outcome.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn checkout_failures_are_surfaced() {
        let outcome = checkout_within(
            Duration::from_secs(1),
            std::future::ready(Err::<(), _>(lapin::Error::ChannelsLimitReached)),
        )
        .await;

        assert!(matches!(outcome, Err(RpcError::Transport(_))));
    }
}
