//! Interactive handlers.
//!
//! An interactive handler drives one remote session: it reads input, writes
//! output and returns when the session should end. It can be supplied in
//! four shapes, all resolved to an [`Interact`] object once per session:
//!
//! - [`CliHandler::instance`]: one shared object serves every session
//! - [`CliHandler::per_session`]: a fresh `T::default()` per session
//! - [`CliHandler::factory`]: a closure producing a handler per session
//! - [`CliHandler::function`]: a bare async function

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::server::error::Result;
use crate::server::session::SessionContext;

/// Drives one interactive session.
///
/// Returning ends the session and closes the channel. Handlers should observe
/// [`SessionContext::cancellation`] at suspension points and return once it
/// fires. A handler that has not returned within
/// [`CANCEL_GRACE`](crate::server::session::CANCEL_GRACE) is dropped.
#[async_trait]
pub trait Interact: Send + Sync {
    async fn interact(&self, session: SessionContext) -> Result<()>;
}

/// Boxed async function handler.
pub type InteractFn = Arc<dyn Fn(SessionContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Closure producing one handler per session.
pub type InteractFactory = Arc<dyn Fn() -> Box<dyn Interact> + Send + Sync>;

#[derive(Clone)]
pub enum CliHandler {
    Instance(Arc<dyn Interact>),
    PerSession(fn() -> Box<dyn Interact>),
    Factory(InteractFactory),
    Function(InteractFn),
}

impl CliHandler {
    pub fn instance<T: Interact + 'static>(handler: T) -> Self {
        CliHandler::Instance(Arc::new(handler))
    }

    pub fn shared(handler: Arc<dyn Interact>) -> Self {
        CliHandler::Instance(handler)
    }

    pub fn per_session<T: Interact + Default + 'static>() -> Self {
        CliHandler::PerSession(new_default::<T>)
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn Interact> + Send + Sync + 'static,
    {
        CliHandler::Factory(Arc::new(factory))
    }

    pub fn function<F, Fut>(function: F) -> Self
    where
        F: Fn(SessionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        CliHandler::Function(Arc::new(move |session| Box::pin(function(session))))
    }

    /// Produce the handler for one new session.
    pub(crate) fn resolve(&self) -> Arc<dyn Interact> {
        match self {
            CliHandler::Instance(handler) => Arc::clone(handler),
            CliHandler::PerSession(make) => Arc::from(make()),
            CliHandler::Factory(factory) => Arc::from(factory()),
            CliHandler::Function(function) => Arc::new(FunctionHandler(Arc::clone(function))),
        }
    }
}

impl fmt::Debug for CliHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            CliHandler::Instance(_) => "Instance",
            CliHandler::PerSession(_) => "PerSession",
            CliHandler::Factory(_) => "Factory",
            CliHandler::Function(_) => "Function",
        };
        f.debug_tuple("CliHandler").field(&shape).finish()
    }
}

fn new_default<T: Interact + Default + 'static>() -> Box<dyn Interact> {
    Box::new(T::default())
}

struct FunctionHandler(InteractFn);

#[async_trait]
impl Interact for FunctionHandler {
    async fn interact(&self, session: SessionContext) -> Result<()> {
        (self.0)(session).await
    }
}
