use crate::amqp::configuration::RpcSettings;
use crate::amqp::topology::QueueOptions;
use crate::error::RpcError;
use crate::routing::handler::{
    function_identity, BlockingFnHandler, BlockingHandler, FnHandler, Handler,
};
use crate::routing::HandlerError;
use serde::{de::DeserializeOwned, Serialize};
use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-route configuration.
///
/// Queue flags left unspecified are inherited from [`RpcSettings`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteOptions {
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub exclusive: bool,
    /// Default timeout for clients calling this method without specifying their own.
    pub timeout: Option<Duration>,
    /// Overrides the settings-level prefetch count for this route's consumer.
    pub prefetch_count: Option<u16>,
}

impl RouteOptions {
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    /// The flags used to declare this route's queue.
    pub fn queue_options(&self, settings: &RpcSettings) -> QueueOptions {
        QueueOptions {
            durable: self.durable.unwrap_or(settings.durable),
            auto_delete: self.auto_delete.unwrap_or(settings.auto_delete),
            exclusive: self.exclusive,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandlerIdentity {
    Function(TypeId),
    Instance(usize),
}

/// The binding between a method name, its handler and its options.
///
/// A route starts out registered and becomes bound once a server attached a live consumer
/// to its queue. It goes back to unbound when the server releases that consumer.
pub struct Route<H: ?Sized> {
    method: String,
    handler: Arc<H>,
    identity: Option<HandlerIdentity>,
    options: RouteOptions,
    bound: AtomicBool,
}

impl<H: ?Sized> Route<H> {
    /// The method name, which is also the name of the request queue.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn options(&self) -> &RouteOptions {
        &self.options
    }

    /// `true` once a server is consuming requests for this route.
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn mark_bound(&self) {
        self.bound.store(true, Ordering::Release);
    }

    pub(crate) fn mark_unbound(&self) {
        self.bound.store(false, Ordering::Release);
    }

    fn renamed(&self, method: String) -> Self {
        Self {
            method,
            handler: Arc::clone(&self.handler),
            identity: self.identity,
            options: self.options.clone(),
            bound: AtomicBool::new(false),
        }
    }
}

/// An entry of the route list a server publishes to its callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: String,
    pub timeout: Option<Duration>,
}

/// An ordered mapping from method name to [`Route`].
///
/// Use [`AsyncRouter`] with an [`RpcAsyncServer`] and [`BlockingRouter`] with an
/// [`RpcSyncServer`].
///
/// Registering the same method name twice, or the same function twice, is a configuration
/// error: it is rejected and the router is left untouched.
///
/// [`RpcAsyncServer`]: crate::servers::RpcAsyncServer
/// [`RpcSyncServer`]: crate::servers::RpcSyncServer
pub struct Router<H: ?Sized> {
    routes: Vec<Arc<Route<H>>>,
    index: HashMap<String, usize>,
}

/// Routes served by an [`RpcAsyncServer`](crate::servers::RpcAsyncServer).
pub type AsyncRouter = Router<dyn Handler>;
/// Routes served by an [`RpcSyncServer`](crate::servers::RpcSyncServer).
pub type BlockingRouter = Router<dyn BlockingHandler>;

impl<H: ?Sized> Default for Router<H> {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<H: ?Sized> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already boxed handler under `method`.
    pub fn register_handler(
        &mut self,
        method: impl Into<String>,
        handler: Arc<H>,
        options: RouteOptions,
    ) -> Result<&mut Self, RpcError> {
        let identity = HandlerIdentity::Instance(Arc::as_ptr(&handler).cast::<()>() as usize);
        self.insert(Route {
            method: method.into(),
            handler,
            identity: Some(identity),
            options,
            bound: AtomicBool::new(false),
        })
    }

    /// Merge all the routes of `router` into this one, prepending `prefix` to their method
    /// names. Each merged route keeps its own options.
    ///
    /// Either every route is merged or, on conflict, none is.
    pub fn include_router(
        &mut self,
        router: Router<H>,
        prefix: &str,
    ) -> Result<&mut Self, RpcError> {
        let merged: Vec<Route<H>> = router
            .routes
            .iter()
            .map(|route| route.renamed(format!("{prefix}{}", route.method)))
            .collect();
        // `router` already rejected clashes among its own routes.
        for route in &merged {
            self.check_conflicts(route)?;
        }
        for route in merged {
            self.push(route);
        }
        Ok(self)
    }

    /// Look up a route by exact method name.
    pub fn get(&self, method: &str) -> Option<&Arc<Route<H>>> {
        self.index.get(method).map(|&position| &self.routes[position])
    }

    /// Routes, in registration order.
    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route<H>>> {
        self.routes.iter()
    }

    /// The route list callers can use to pre-validate method names and pick up per-route
    /// default timeouts.
    pub fn route_table(&self) -> Vec<RouteInfo> {
        self.routes
            .iter()
            .map(|route| RouteInfo {
                method: route.method.clone(),
                timeout: route.options.timeout,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn insert(&mut self, route: Route<H>) -> Result<&mut Self, RpcError> {
        self.check_conflicts(&route)?;
        self.push(route);
        Ok(self)
    }

    fn check_conflicts(&self, route: &Route<H>) -> Result<(), RpcError> {
        if self.index.contains_key(&route.method) {
            return Err(RpcError::Configuration(format!(
                "a handler is already registered for method `{}`",
                route.method
            )));
        }
        if route.identity.is_some() {
            if let Some(existing) = self.routes.iter().find(|r| r.identity == route.identity) {
                return Err(duplicate_function(&existing.method, &route.method));
            }
        }
        Ok(())
    }

    fn push(&mut self, route: Route<H>) {
        self.index.insert(route.method.clone(), self.routes.len());
        self.routes.push(Arc::new(route));
    }
}

fn duplicate_function(existing: &str, method: &str) -> RpcError {
    RpcError::Configuration(format!(
        "the handler for `{method}` is already registered for method `{existing}`"
    ))
}

impl Router<dyn Handler> {
    /// Register an async function serving `method`.
    ///
    /// The request payload is deserialized into the function's argument: a mapping fills
    /// a struct (keyword arguments), any other payload is passed as a single value.
    ///
    /// ```rust
    /// use carrot_rpc::routing::{AsyncRouter, RouteOptions};
    /// use serde_json::Value;
    ///
    /// async fn echo(payload: Value) -> Result<Value, anyhow::Error> {
    ///     Ok(payload)
    /// }
    ///
    /// let mut router = AsyncRouter::new();
    /// router.register("echo", echo, RouteOptions::default()).unwrap();
    /// assert!(router.get("echo").is_some());
    /// ```
    pub fn register<F, Args, Fut, R, E>(
        &mut self,
        method: impl Into<String>,
        f: F,
        options: RouteOptions,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Serialize + Send,
        E: Into<HandlerError> + Send,
    {
        let identity = function_identity::<F>().map(HandlerIdentity::Function);
        self.insert(Route {
            method: method.into(),
            handler: Arc::new(FnHandler::new(f)),
            identity,
            options,
            bound: AtomicBool::new(false),
        })
    }
}

impl Router<dyn BlockingHandler> {
    /// Register a blocking function serving `method`.
    ///
    /// See [`Router::register`] for how the payload is handed to the function.
    pub fn register<F, Args, R, E>(
        &mut self,
        method: impl Into<String>,
        f: F,
        options: RouteOptions,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Args) -> Result<R, E> + Send + Sync + 'static,
        Args: DeserializeOwned + 'static,
        R: Serialize,
        E: Into<HandlerError>,
    {
        let identity = function_identity::<F>().map(HandlerIdentity::Function);
        self.insert(Route {
            method: method.into(),
            handler: Arc::new(BlockingFnHandler::new(f)),
            identity,
            options,
            bound: AtomicBool::new(false),
        })
    }
}
