//! The `Handler` traits are heavily inspired by `tide`'s approach to endpoint handlers.
use crate::routing::HandlerError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::any::TypeId;
use std::future::Future;
use std::marker::PhantomData;

/// Implementers of the `Handler` trait can be registered on a [`Router`] to serve a method
/// for an [`RpcAsyncServer`].
///
/// # Scope
///
/// `call` does not get access to the underlying RabbitMq channel.
/// The server takes care of decoding the request, publishing the reply to the caller and
/// acking the message with the broker.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, 99% of the time you will be relying
/// on [`Router::register`], which wraps async functions with a matching signature -
/// `Fn(Args) -> Fut` where `Args` can be deserialized from the request payload and `Fut`
/// resolves to a `Result` whose `Ok` variant can be serialized.
///
/// [`Router`]: crate::routing::Router
/// [`Router::register`]: crate::routing::Router::register
/// [`RpcAsyncServer`]: crate::servers::RpcAsyncServer
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// The blocking counterpart of [`Handler`], served by an [`RpcSyncServer`].
///
/// [`RpcSyncServer`]: crate::servers::RpcSyncServer
pub trait BlockingHandler: Send + Sync + 'static {
    fn call(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// Deserialize the request payload into the handler's arguments.
///
/// A mapping fills a struct field by field (keyword arguments), anything else is handed
/// over as a single value (positional argument).
fn extract<Args: DeserializeOwned>(payload: Value) -> Result<Args, HandlerError> {
    serde_json::from_value(payload).map_err(HandlerError::InvalidArguments)
}

fn respond<R: Serialize>(result: R) -> Result<Value, HandlerError> {
    serde_json::to_value(result).map_err(HandlerError::InvalidResult)
}

/// Wrapper type to turn an async function into a [`Handler`].
pub struct FnHandler<F, Args> {
    f: F,
    _args: PhantomData<fn(Args)>,
}

impl<F, Args> FnHandler<F, Args> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut,
    {
        Self {
            f,
            _args: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<F, Args, Fut, R, E> Handler for FnHandler<F, Args>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Args: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<R, E>> + Send,
    R: Serialize + Send,
    E: Into<HandlerError> + Send,
{
    async fn call(&self, payload: Value) -> Result<Value, HandlerError> {
        let args = extract::<Args>(payload)?;
        let result = (self.f)(args)
            .await
            .map_err(Into::<HandlerError>::into)?;
        respond(result)
    }
}

/// Wrapper type to turn a blocking function into a [`BlockingHandler`].
pub struct BlockingFnHandler<F, Args> {
    f: F,
    _args: PhantomData<fn(Args)>,
}

impl<F, Args> BlockingFnHandler<F, Args> {
    pub fn new<Out>(f: F) -> Self
    where
        F: Fn(Args) -> Out,
    {
        Self {
            f,
            _args: PhantomData,
        }
    }
}

impl<F, Args, R, E> BlockingHandler for BlockingFnHandler<F, Args>
where
    F: Fn(Args) -> Result<R, E> + Send + Sync + 'static,
    Args: DeserializeOwned + 'static,
    R: Serialize,
    E: Into<HandlerError>,
{
    fn call(&self, payload: Value) -> Result<Value, HandlerError> {
        let args = extract::<Args>(payload)?;
        let result = (self.f)(args).map_err(Into::<HandlerError>::into)?;
        respond(result)
    }
}

/// Identity of a registered function, used to spot the same function registered twice.
///
/// Function items and non-capturing closures are zero-sized: two values of the same such type
/// are the same function. Capturing closures carry state and cannot be told apart by type,
/// so they get no identity.
pub(crate) fn function_identity<F: 'static>() -> Option<TypeId> {
    (std::mem::size_of::<F>() == 0).then(TypeId::of::<F>)
}
