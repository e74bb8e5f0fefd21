//! Servers: one queue per registered method, requests dispatched to the method's handler,
//! results published back to the caller.
//!
//! Both servers follow the same protocol for each request:
//! - the handler is looked up by the request's routing key, which is the method name.
//!   Requests for a method nobody registered are acked and dropped with a warning: the caller
//!   observes a timeout;
//! - the body is decoded and handed to the handler. Malformed bodies and handler failures
//!   never tear the server down: they are logged and answered with an error payload
//!   (see [`HandlerError::to_payload`]);
//! - the reply is published to the request's `reply_to` queue, carrying its correlation id;
//! - the request is acked once the reply is out (at-least-once processing).
//!
//! [`HandlerError::to_payload`]: crate::routing::HandlerError::to_payload
mod async_server;
mod processing;
mod sync_server;

pub use async_server::RpcAsyncServer;
pub use sync_server::RpcSyncServer;

use crate::amqp::configuration::RpcSettings;
use crate::error::RpcError;
use crate::pool::ChannelManager;
use crate::routing::{Route, Router};
use amq_protocol_types::{FieldTable, ShortString};
use futures_util::stream::{BoxStream, SelectAll};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions};
use lapin::{Channel, ChannelState, Consumer};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

type RouteDelivery = (Channel, Result<Delivery, lapin::Error>);

/// A route with a live consumer on its own channel.
struct BoundRoute<H: ?Sized> {
    route: Arc<Route<H>>,
    channel: Channel,
    consumer_tag: ShortString,
}

/// The live consumers of all the routes of a server, merged in a single stream.
///
/// Every delivery comes with the channel it was received on: replies and acks go through it.
struct BoundRoutes<H: ?Sized> {
    routes: Vec<BoundRoute<H>>,
    deliveries: SelectAll<BoxStream<'static, RouteDelivery>>,
}

impl<H: ?Sized> BoundRoutes<H> {
    /// Declare the queue of every route and attach a consumer to it, each on its own channel.
    ///
    /// All or nothing: if a route cannot be bound, the routes bound before it are released.
    #[tracing::instrument(skip_all, name = "rpc_bind_routes")]
    async fn bind(
        manager: &ChannelManager,
        settings: &RpcSettings,
        router: &Router<H>,
    ) -> Result<Self, RpcError> {
        let mut bound = Self {
            routes: Vec::with_capacity(router.len()),
            deliveries: SelectAll::new(),
        };
        for route in router.routes() {
            if let Err(e) = bound.attach(manager, settings, route).await {
                error!(
                    method = route.method(),
                    error = ?e,
                    "Failed to bind the route, releasing the routes bound so far"
                );
                bound.close().await;
                return Err(e);
            }
        }
        Ok(bound)
    }

    async fn attach(
        &mut self,
        manager: &ChannelManager,
        settings: &RpcSettings,
        route: &Arc<Route<H>>,
    ) -> Result<(), RpcError> {
        let channel = match route.options().prefetch_count {
            Some(prefetch_count) => manager.open_channel_with_prefetch(prefetch_count).await?,
            None => manager.open_channel().await?,
        };
        let consumer = match consume(manager, settings, route, &channel).await {
            Ok(consumer) => consumer,
            Err(e) => {
                close_channel(&channel).await;
                return Err(e);
            }
        };
        route.mark_bound();
        info!(method = route.method(), "Serving requests");

        self.routes.push(BoundRoute {
            route: Arc::clone(route),
            channel: channel.clone(),
            consumer_tag: consumer.tag(),
        });
        self.deliveries.push(
            consumer
                .map(move |delivery| (channel.clone(), delivery))
                .boxed(),
        );
        Ok(())
    }

    /// Ask the broker to stop pushing requests.
    ///
    /// Requests already delivered are still yielded by [`BoundRoutes::next`] before the
    /// stream ends.
    async fn cancel(&mut self) {
        for bound in &self.routes {
            if let Err(e) = bound
                .channel
                .basic_cancel(bound.consumer_tag.as_str(), BasicCancelOptions::default())
                .await
            {
                warn!(method = bound.route.method(), error = ?e, "Failed to cancel a consumer");
            }
        }
    }

    async fn next(&mut self) -> Option<RouteDelivery> {
        self.deliveries.next().await
    }

    /// Close all channels. Unacked requests are requeued by the broker.
    async fn close(self) {
        for bound in self.routes {
            bound.route.mark_unbound();
            close_channel(&bound.channel).await;
        }
    }
}

async fn consume<H: ?Sized>(
    manager: &ChannelManager,
    settings: &RpcSettings,
    route: &Route<H>,
    channel: &Channel,
) -> Result<Consumer, RpcError> {
    manager
        .setup()
        .setup_queue_declare(
            channel,
            route.method(),
            route.options().queue_options(settings),
        )
        .await?;
    let consumer = channel
        .basic_consume(
            route.method(),
            &Uuid::new_v4().to_string(),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(consumer)
}

/// Close a consumer channel, unless the broker already did.
async fn close_channel(channel: &Channel) {
    if !matches!(channel.status().state(), ChannelState::Connected) {
        return;
    }
    if let Err(e) = channel.close(200, "Bye").await {
        warn!(error = ?e, "Failed to close a consumer channel");
    }
}
