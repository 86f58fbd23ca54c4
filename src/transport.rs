//! Transport abstraction: the pluggable query/mutate/subscribe interface,
//! the middleware chain, and a predicate router for splitting traffic across
//! transports (e.g. subscriptions on a persistent connection, queries on
//! request/response).

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_stream::Stream;

use crate::envelope::LensRequest;
use crate::error::{LensError, Result};
use crate::update::UpdatePayload;

/// Stream of encoded updates delivered to one subscriber. An error item
/// terminates the subscription; resubscribing is the caller's decision.
pub type UpdateStream = Pin<Box<dyn Stream<Item = Result<UpdatePayload>> + Send>>;

/// Pluggable protocol surface.
#[async_trait]
pub trait LensTransport: Send + Sync {
    async fn query(&self, request: LensRequest) -> Result<Value>;

    async fn mutate(&self, request: LensRequest) -> Result<Value>;

    async fn subscribe(&self, request: LensRequest) -> Result<UpdateStream>;

    /// Release underlying connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Remainder of a middleware chain. Consumed by value so the inner transport
/// is invoked exactly once per request.
pub struct Next<'a> {
    inner: &'a dyn LensTransport,
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn query(self, request: LensRequest) -> Result<Value> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    inner: self.inner,
                    chain: rest,
                };
                middleware.query(request, next).await
            }
            None => self.inner.query(request).await,
        }
    }

    pub async fn mutate(self, request: LensRequest) -> Result<Value> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    inner: self.inner,
                    chain: rest,
                };
                middleware.mutate(request, next).await
            }
            None => self.inner.mutate(request).await,
        }
    }

    pub async fn subscribe(self, request: LensRequest) -> Result<UpdateStream> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    inner: self.inner,
                    chain: rest,
                };
                middleware.subscribe(request, next).await
            }
            None => self.inner.subscribe(request).await,
        }
    }
}

/// One link in a middleware chain.
///
/// Each method receives the request and the remainder of the chain; call
/// `next` to continue, or return/raise without calling it to short-circuit.
/// Middlewares execute in array order, each wrapping the next.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn query(&self, request: LensRequest, next: Next<'_>) -> Result<Value> {
        next.query(request).await
    }

    async fn mutate(&self, request: LensRequest, next: Next<'_>) -> Result<Value> {
        next.mutate(request).await
    }

    async fn subscribe(&self, request: LensRequest, next: Next<'_>) -> Result<UpdateStream> {
        next.subscribe(request).await
    }
}

/// Transport wrapping another transport with an ordered middleware list.
pub struct MiddlewareTransport {
    inner: Arc<dyn LensTransport>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareTransport {
    pub fn new(inner: Arc<dyn LensTransport>) -> Self {
        Self {
            inner,
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware (builder pattern). Executes after those already
    /// added.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    fn next(&self) -> Next<'_> {
        Next {
            inner: self.inner.as_ref(),
            chain: &self.middlewares,
        }
    }
}

#[async_trait]
impl LensTransport for MiddlewareTransport {
    async fn query(&self, request: LensRequest) -> Result<Value> {
        self.next().query(request).await
    }

    async fn mutate(&self, request: LensRequest) -> Result<Value> {
        self.next().mutate(request).await
    }

    async fn subscribe(&self, request: LensRequest) -> Result<UpdateStream> {
        self.next().subscribe(request).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Middleware racing the rest of the chain against a timer. The core imposes
/// no timeout of its own; layer this where one is wanted.
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn expired(&self, path: &str) -> LensError {
        LensError::Transport(format!(
            "request `{path}` timed out after {:?}",
            self.timeout
        ))
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn query(&self, request: LensRequest, next: Next<'_>) -> Result<Value> {
        let path = request.joined_path();
        match tokio::time::timeout(self.timeout, next.query(request)).await {
            Ok(result) => result,
            Err(_) => Err(self.expired(&path)),
        }
    }

    async fn mutate(&self, request: LensRequest, next: Next<'_>) -> Result<Value> {
        let path = request.joined_path();
        match tokio::time::timeout(self.timeout, next.mutate(request)).await {
            Ok(result) => result,
            Err(_) => Err(self.expired(&path)),
        }
    }

    // Only subscription establishment is raced; an established stream has no
    // deadline.
    async fn subscribe(&self, request: LensRequest, next: Next<'_>) -> Result<UpdateStream> {
        let path = request.joined_path();
        match tokio::time::timeout(self.timeout, next.subscribe(request)).await {
            Ok(result) => result,
            Err(_) => Err(self.expired(&path)),
        }
    }
}

type RoutePredicate = Box<dyn Fn(&LensRequest) -> bool + Send + Sync>;

/// Dispatches each request to the first transport whose predicate matches.
#[derive(Default)]
pub struct TransportRouter {
    routes: Vec<(RoutePredicate, Arc<dyn LensTransport>)>,
}

impl TransportRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route (builder pattern). Routes are tried in insertion order.
    pub fn route(
        mut self,
        predicate: impl Fn(&LensRequest) -> bool + Send + Sync + 'static,
        transport: Arc<dyn LensTransport>,
    ) -> Self {
        self.routes.push((Box::new(predicate), transport));
        self
    }

    fn resolve(&self, request: &LensRequest) -> Result<&Arc<dyn LensTransport>> {
        self.routes
            .iter()
            .find(|(predicate, _)| predicate(request))
            .map(|(_, transport)| transport)
            .ok_or_else(|| {
                LensError::NotFound(format!(
                    "no transport found for `{}`",
                    request.joined_path()
                ))
            })
    }
}

#[async_trait]
impl LensTransport for TransportRouter {
    async fn query(&self, request: LensRequest) -> Result<Value> {
        self.resolve(&request)?.query(request).await
    }

    async fn mutate(&self, request: LensRequest) -> Result<Value> {
        self.resolve(&request)?.mutate(request).await
    }

    async fn subscribe(&self, request: LensRequest) -> Result<UpdateStream> {
        self.resolve(&request)?.subscribe(request).await
    }

    async fn close(&self) -> Result<()> {
        for (_, transport) in &self.routes {
            transport.close().await?;
        }
        Ok(())
    }
}
