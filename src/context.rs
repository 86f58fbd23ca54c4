use std::sync::Arc;

use serde_json::Value;

use crate::loader::ResourceLoader;
use crate::pubsub::PubSub;
use crate::resource::{HookContext, ResourceRegistry};

/// Ambient context handed to every resolver.
///
/// Constructed fresh per inbound request: the loader it carries is the
/// request's private batching cache and must never outlive or be shared
/// beyond the request. The registry and pub/sub handle are the shared,
/// read-mostly collaborators.
#[derive(Clone)]
pub struct RequestContext {
    pub loader: ResourceLoader,
    pub registry: Arc<ResourceRegistry>,
    pub events: Arc<dyn PubSub>,
}

impl RequestContext {
    pub fn new(
        loader: ResourceLoader,
        registry: Arc<ResourceRegistry>,
        events: Arc<dyn PubSub>,
    ) -> Self {
        Self {
            loader,
            registry,
            events,
        }
    }

    /// Build a hook context carrying this request's pub/sub handle.
    pub fn hook_context(&self, data: Value, previous: Option<Value>) -> HookContext {
        HookContext {
            data,
            previous,
            events: Arc::clone(&self.events),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("loader", &self.loader)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::FetchBackend;
    use crate::pubsub::MemoryPubSub;
    use crate::Result;
    use async_trait::async_trait;
    use serde_json::json;

    struct EmptyBackend;

    #[async_trait]
    impl FetchBackend for EmptyBackend {
        async fn fetch_by_id(&self, _resource: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
            Ok(ids.iter().map(|_| None).collect())
        }
    }

    fn context() -> RequestContext {
        RequestContext::new(
            ResourceLoader::new(Arc::new(EmptyBackend)),
            Arc::new(ResourceRegistry::new()),
            Arc::new(MemoryPubSub::new()),
        )
    }

    #[test]
    fn test_hook_context_shares_event_handle() {
        let ctx = context();
        let hook_ctx = ctx.hook_context(json!({"id": "1"}), Some(json!({"id": "0"})));

        assert_eq!(hook_ctx.data, json!({"id": "1"}));
        assert_eq!(hook_ctx.previous, Some(json!({"id": "0"})));
    }

    #[test]
    fn test_context_is_cloneable() {
        let ctx = context();
        let cloned = ctx.clone();

        // Both clones see the same per-request cache.
        ctx.loader.prime("user", "1", json!({}));
        assert_eq!(cloned.loader.cached_len(), 1);
    }
}
