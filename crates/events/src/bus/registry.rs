use core::any::{Any, TypeId};
use core::marker::PhantomData;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;

use gatekeeper_core::RequestContext;

use super::{BusError, Message, MessageKind, Middleware, Next, Output};
use crate::command::{Command, CommandHandler, Query, QueryHandler};
use crate::panic::panic_message;

/// Handler with its message and output types erased.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn call(&self, ctx: &RequestContext, message: Message) -> Result<Output, BusError>;
}

pub(crate) struct CommandAdapter<C, H> {
    handler: H,
    _command: PhantomData<fn(C)>,
}

impl<C, H> CommandAdapter<C, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _command: PhantomData,
        }
    }
}

#[async_trait]
impl<C, H> ErasedHandler for CommandAdapter<C, H>
where
    C: Command,
    H: CommandHandler<C>,
{
    async fn call(&self, ctx: &RequestContext, message: Message) -> Result<Output, BusError> {
        let kind = message.kind();
        let command = message
            .into_payload()
            .downcast::<C>()
            .map_err(|_| BusError::TypeMismatch { name: C::NAME })?;

        let outcome = AssertUnwindSafe(self.handler.handle(ctx, *command))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => Ok(Box::new(output) as Output),
            Ok(Err(err)) => Err(BusError::Handler(err)),
            Err(payload) => Err(BusError::Panicked {
                kind,
                name: C::NAME,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

pub(crate) struct QueryAdapter<Q, H> {
    handler: H,
    _query: PhantomData<fn(Q)>,
}

impl<Q, H> QueryAdapter<Q, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _query: PhantomData,
        }
    }
}

#[async_trait]
impl<Q, H> ErasedHandler for QueryAdapter<Q, H>
where
    Q: Query,
    H: QueryHandler<Q>,
{
    async fn call(&self, ctx: &RequestContext, message: Message) -> Result<Output, BusError> {
        let kind = message.kind();
        let query = message
            .into_payload()
            .downcast::<Q>()
            .map_err(|_| BusError::TypeMismatch { name: Q::NAME })?;

        let outcome = AssertUnwindSafe(self.handler.handle(ctx, *query))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => Ok(Box::new(output) as Output),
            Ok(Err(err)) => Err(BusError::Handler(err)),
            Err(payload) => Err(BusError::Panicked {
                kind,
                name: Q::NAME,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<TypeId, Arc<dyn ErasedHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Handler table plus middleware list behind one read/write lock.
///
/// The lock is only held to insert or to snapshot; it is never held while a
/// handler runs.
pub(crate) struct Registry {
    kind: MessageKind,
    inner: RwLock<Inner>,
}

impl Registry {
    pub(crate) fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            inner: RwLock::default(),
        }
    }

    pub(crate) fn register(
        &self,
        type_id: TypeId,
        name: &'static str,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<(), BusError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.handlers.contains_key(&type_id) {
            return Err(BusError::HandlerAlreadyRegistered {
                kind: self.kind,
                name,
            });
        }
        inner.handlers.insert(type_id, handler);
        Ok(())
    }

    pub(crate) fn push_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .middleware
            .push(middleware);
    }

    pub(crate) fn contains(&self, type_id: TypeId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .contains_key(&type_id)
    }

    pub(crate) fn middleware_len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .middleware
            .len()
    }

    fn snapshot(&self, type_id: TypeId) -> Option<(Arc<dyn ErasedHandler>, Vec<Arc<dyn Middleware>>)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let handler = inner.handlers.get(&type_id)?.clone();
        Some((handler, inner.middleware.clone()))
    }

    /// Runs `payload` through the middleware chain into its handler.
    pub(crate) async fn dispatch(
        &self,
        ctx: &RequestContext,
        type_id: TypeId,
        name: &'static str,
        payload: Box<dyn Any + Send>,
    ) -> Result<Output, BusError> {
        let kind = self.kind;
        let Some((handler, middleware)) = self.snapshot(type_id) else {
            return Err(BusError::HandlerNotFound { kind, name });
        };

        let message = Message::new(name, kind, payload);
        let next = Next::new(&middleware, handler.as_ref());

        match AssertUnwindSafe(next.run(ctx, message)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(BusError::Panicked {
                kind,
                name,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}
