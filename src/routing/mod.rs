//! Method registration: which handler serves which request queue.
//!
//! A [`Router`] maps method names to [`Route`]s. Routers can be nested with
//! [`Router::include_router`] to group related methods under a common prefix before handing
//! them to a server.
mod error;
mod handler;
mod router;

pub use error::HandlerError;
pub use handler::{BlockingFnHandler, BlockingHandler, FnHandler, Handler};
pub use router::{AsyncRouter, BlockingRouter, Route, RouteInfo, RouteOptions, Router};
