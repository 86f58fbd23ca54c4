//! Server-side runtime binding.
//!
//! [`LensServer`] implements [`LensTransport`] over a route table built from
//! an [`EndpointSet`]: queries and mutations validate input, run their
//! resolver with a fresh per-request [`ResourceLoader`], and prune the result
//! by field selection; subscriptions listen on the channel derived from
//! `(path, input)` and re-emit change events through the update strategy
//! engine. Mutations publish from `after*` lifecycle hooks via the ambient
//! pub/sub handle, which closes the auto-subscription loop without any
//! endpoint-level wiring.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::channel::ChannelNaming;
use crate::context::RequestContext;
use crate::endpoint::{EndpointDescriptor, EndpointKind, EndpointSet};
use crate::envelope::{LensRequest, LensResponse, RequestKind};
use crate::error::{LensError, Result};
use crate::loader::{FetchBackend, ResourceLoader};
use crate::pubsub::{ChangeStream, MemoryPubSub, PubSub};
use crate::resource::ResourceRegistry;
use crate::select::{apply_field_selection, FieldSelection};
use crate::transport::{LensTransport, UpdateStream};
use crate::update::{encode, resolve_auto, UpdateMode, UpdateStrategy};

/// The protocol runtime serving one composed endpoint tree.
pub struct LensServer {
    routes: HashMap<String, Arc<EndpointDescriptor>>,
    registry: Arc<ResourceRegistry>,
    backend: Arc<dyn FetchBackend>,
    events: Arc<dyn PubSub>,
    naming: ChannelNaming,
}

impl LensServer {
    pub fn builder() -> LensServerBuilder {
        LensServerBuilder::default()
    }

    /// The pub/sub handle mutations publish through.
    pub fn events(&self) -> Arc<dyn PubSub> {
        Arc::clone(&self.events)
    }

    /// Channel a subscription on `(path, input)` would listen on.
    pub fn channel_for(&self, path: &[String], input: &Value) -> String {
        self.naming.name(path, input)
    }

    /// Handle a request/response-style envelope (the HTTP host boundary).
    /// Subscriptions need a streaming transport and are refused here.
    pub async fn respond(&self, request: LensRequest) -> LensResponse<Value> {
        match request.kind {
            RequestKind::Query => self.query(request).await.into(),
            RequestKind::Mutation => self.mutate(request).await.into(),
            RequestKind::Subscription => LensResponse::err(&LensError::Validation(
                "subscriptions require a streaming transport".to_string(),
            )),
        }
    }

    /// One loader per inbound request; never shared across requests.
    fn context(&self) -> RequestContext {
        RequestContext::new(
            ResourceLoader::new(Arc::clone(&self.backend)),
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
        )
    }

    fn route(&self, request: &LensRequest) -> Result<Arc<EndpointDescriptor>> {
        let key = request.joined_path();
        self.routes
            .get(&key)
            .cloned()
            .ok_or(LensError::NotFound(key))
    }

    async fn execute(&self, request: LensRequest, kind: EndpointKind) -> Result<Value> {
        let endpoint = self.route(&request)?;
        if endpoint.kind() != kind {
            return Err(LensError::Validation(format!(
                "endpoint `{}` is not a {}",
                request.joined_path(),
                match kind {
                    EndpointKind::Query => "query",
                    EndpointKind::Mutation => "mutation",
                },
            )));
        }
        // Validation failures never reach the resolver.
        let input = endpoint.input().parse(&request.input)?;
        tracing::debug!(path = %request.joined_path(), "executing endpoint");

        let output = endpoint.call(input, self.context()).await?;
        let output = endpoint.output().parse(&output)?;
        Ok(apply_field_selection(&output, request.select.as_ref()))
    }

    fn resource_strategy(&self, request: &LensRequest) -> UpdateStrategy {
        request
            .path
            .first()
            .and_then(|namespace| self.registry.get(namespace))
            .map(|resource| resource.update_strategy().clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for LensServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensServer")
            .field("routes", &self.routes.len())
            .field("registry", &self.registry)
            .field("naming", &self.naming)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LensTransport for LensServer {
    async fn query(&self, request: LensRequest) -> Result<Value> {
        self.execute(request, EndpointKind::Query).await
    }

    async fn mutate(&self, request: LensRequest) -> Result<Value> {
        self.execute(request, EndpointKind::Mutation).await
    }

    async fn subscribe(&self, request: LensRequest) -> Result<UpdateStream> {
        let endpoint = self.route(&request)?;
        if endpoint.kind() != EndpointKind::Query {
            return Err(LensError::Validation(format!(
                "endpoint `{}` is not subscribable",
                request.joined_path()
            )));
        }
        let input = endpoint.input().parse(&request.input)?;
        let channel = self.naming.name(&request.path, &input);
        tracing::debug!(path = %request.joined_path(), %channel, "subscribing");

        let source: ChangeStream = match endpoint.subscribe_fn() {
            Some(subscribe) => subscribe(input.clone(), self.context()).await?,
            None => Box::pin(self.events.subscribe(&channel).await?),
        };

        let strategy = self.resource_strategy(&request);
        let mode = request.update_mode.unwrap_or_default();
        Ok(relay_updates(source, strategy, mode, request.select))
    }
}

/// Re-emit change events through the update strategy engine, pruned by field
/// selection. Dropping the returned stream stops the relay and releases the
/// underlying channel subscription.
fn relay_updates(
    mut source: ChangeStream,
    strategy: UpdateStrategy,
    mode: UpdateMode,
    select: Option<FieldSelection>,
) -> UpdateStream {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut prev: Option<Value> = None;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = source.next() => {
                    let Some(event) = event else { break };
                    let data = apply_field_selection(&event.data, select.as_ref());
                    let effective = match mode {
                        UpdateMode::Auto => {
                            resolve_auto(&strategy, event.field.as_deref(), prev.as_ref(), &data)
                        }
                        pinned => pinned,
                    };
                    let payload = encode(effective, prev.as_ref(), &data);
                    prev = Some(data);
                    if tx.send(Ok(payload)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// Builder for [`LensServer`].
#[derive(Default)]
pub struct LensServerBuilder {
    endpoints: Option<EndpointSet>,
    registry: Option<Arc<ResourceRegistry>>,
    backend: Option<Arc<dyn FetchBackend>>,
    events: Option<Arc<dyn PubSub>>,
    naming: ChannelNaming,
}

impl LensServerBuilder {
    pub fn endpoints(mut self, endpoints: EndpointSet) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn FetchBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Defaults to an in-process [`MemoryPubSub`].
    pub fn events(mut self, events: Arc<dyn PubSub>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn naming(mut self, naming: ChannelNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn build(self) -> Result<LensServer> {
        let endpoints = self.endpoints.ok_or_else(|| {
            LensError::Configuration("server requires an endpoint set".to_string())
        })?;
        let backend = self.backend.ok_or_else(|| {
            LensError::Configuration("server requires a fetch backend".to_string())
        })?;
        Ok(LensServer {
            routes: endpoints.into_routes()?,
            registry: self.registry.unwrap_or_default(),
            backend,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(MemoryPubSub::new())),
            naming: self.naming,
        })
    }
}
