//! Request-scoped resource loader.
//!
//! Batches and caches entity lookups for the lifetime of one request.
//! Calls issued without an intervening await accumulate into a pending key
//! set; the batch dispatcher runs as a separate task once the caller yields,
//! so N independent `load` calls for the same resource collapse into exactly
//! one backend fetch. Construct one loader per inbound request or
//! subscription setup and never share it: the cache is the only per-request
//! mutable state and must not leak values between unrelated callers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::error::{LensError, Result};

/// Storage collaborator behind the loader.
///
/// Given a resource name and a set of ids, returns a same-order array of
/// entities, with `None` for missing ids. The core never issues storage
/// queries through any other seam.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch_by_id(&self, resource: &str, ids: &[String]) -> Result<Vec<Option<Value>>>;

    /// Fetch every entity whose `field` matches one of `values`.
    async fn fetch_by_field(
        &self,
        resource: &str,
        field: &str,
        values: &[Value],
    ) -> Result<Vec<Value>> {
        let _ = (field, values);
        Err(LensError::Configuration(format!(
            "backend does not support field lookups on `{resource}`"
        )))
    }
}

type FetchOutcome = std::result::Result<Option<Value>, String>;
type GroupedOutcome = std::result::Result<HashMap<String, Vec<Value>>, String>;
type FieldWaiter = oneshot::Sender<GroupedOutcome>;

/// One cache entry: either a completed lookup or a fetch still in flight.
/// A `load` hitting a pending slot joins the existing fetch instead of
/// opening a new batch.
enum CacheSlot {
    Ready(Option<Value>),
    Pending(watch::Receiver<Option<FetchOutcome>>),
}

#[derive(Default)]
struct IdBatch {
    /// Deduplicated keys in issuance order.
    keys: Vec<String>,
    slots: HashMap<String, watch::Sender<Option<FetchOutcome>>>,
}

#[derive(Default)]
struct FieldBatch {
    values: Vec<Value>,
    /// Each waiter remembers which grouped keys it asked for.
    waiters: Vec<(Vec<String>, FieldWaiter)>,
}

#[derive(Default)]
struct LoaderState {
    cache: HashMap<(String, String), CacheSlot>,
    id_batches: HashMap<String, IdBatch>,
    field_batches: HashMap<(String, String), FieldBatch>,
}

struct LoaderInner {
    backend: Arc<dyn FetchBackend>,
    state: Mutex<LoaderState>,
}

/// Per-request batching and caching facade over a [`FetchBackend`].
#[derive(Clone)]
pub struct ResourceLoader {
    inner: Arc<LoaderInner>,
}

impl ResourceLoader {
    pub fn new(backend: Arc<dyn FetchBackend>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                backend,
                state: Mutex::new(LoaderState::default()),
            }),
        }
    }

    /// Load one entity by id.
    ///
    /// The key is registered with the pending batch synchronously, before the
    /// returned future is first polled; the batch is dispatched in one
    /// backend call once the current synchronous execution yields. A key
    /// whose fetch is already in flight joins it rather than refetching.
    pub fn load(
        &self,
        resource: impl Into<String>,
        id: impl Into<String>,
    ) -> impl Future<Output = Result<Option<Value>>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let resource = resource.into();
        let id = id.into();

        enum Call {
            Cached(Option<Value>),
            Pending(watch::Receiver<Option<FetchOutcome>>),
        }

        let call = {
            let mut state = inner.state.lock().expect("loader lock poisoned");
            match state.cache.get(&(resource.clone(), id.clone())) {
                Some(CacheSlot::Ready(value)) => Call::Cached(value.clone()),
                Some(CacheSlot::Pending(rx)) => Call::Pending(rx.clone()),
                None => {
                    let fresh_batch = !state.id_batches.contains_key(&resource);
                    let batch = state.id_batches.entry(resource.clone()).or_default();
                    let (tx, rx) = watch::channel(None);
                    batch.keys.push(id.clone());
                    batch.slots.insert(id.clone(), tx);
                    state
                        .cache
                        .insert((resource.clone(), id.clone()), CacheSlot::Pending(rx.clone()));
                    if fresh_batch {
                        tokio::spawn(dispatch_ids(Arc::clone(&inner), resource.clone()));
                    }
                    Call::Pending(rx)
                }
            }
        };

        async move {
            match call {
                Call::Cached(value) => Ok(value),
                Call::Pending(mut rx) => loop {
                    let outcome = rx.borrow().clone();
                    if let Some(outcome) = outcome {
                        return outcome.map_err(LensError::Transport);
                    }
                    if rx.changed().await.is_err() {
                        return Err(LensError::Transport(
                            "batch dispatcher dropped before resolving".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Load many entities by id.
    ///
    /// The result is positionally aligned with `ids`, duplicates included.
    /// Per-key failures resolve to `None` instead of failing sibling ids.
    pub async fn load_many(&self, resource: impl Into<String>, ids: &[String]) -> Vec<Option<Value>> {
        let resource = resource.into();
        let futures: Vec<_> = ids
            .iter()
            .map(|id| self.load(resource.clone(), id.clone()))
            .collect();

        let mut out = Vec::with_capacity(futures.len());
        for future in futures {
            match future.await {
                Ok(value) => out.push(value),
                Err(error) => {
                    tracing::warn!(resource = %resource, %error, "load failed; mapping to null");
                    out.push(None);
                }
            }
        }
        out
    }

    /// Load entities by an arbitrary field, grouped by the queried values.
    ///
    /// Group keys are the scalar values rendered as text (strings verbatim,
    /// other scalars via their JSON form). Maintains a per-(resource, field)
    /// batch dispatcher analogous to [`ResourceLoader::load`].
    pub fn load_by_field(
        &self,
        resource: impl Into<String>,
        field: impl Into<String>,
        values: Vec<Value>,
    ) -> impl Future<Output = Result<HashMap<String, Vec<Value>>>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let resource = resource.into();
        let field = field.into();
        let requested: Vec<String> = values.iter().map(group_key).collect();

        let rx = {
            let mut state = inner.state.lock().expect("loader lock poisoned");
            let batch_key = (resource.clone(), field.clone());
            let fresh_batch = !state.field_batches.contains_key(&batch_key);
            let batch = state.field_batches.entry(batch_key).or_default();
            for value in values {
                if !batch.values.contains(&value) {
                    batch.values.push(value);
                }
            }
            let (tx, rx) = oneshot::channel();
            batch.waiters.push((requested, tx));
            if fresh_batch {
                tokio::spawn(dispatch_field(Arc::clone(&inner), resource, field));
            }
            rx
        };

        async move {
            match rx.await {
                Ok(Ok(grouped)) => Ok(grouped),
                Ok(Err(message)) => Err(LensError::Transport(message)),
                Err(_) => Err(LensError::Transport(
                    "batch dispatcher dropped before resolving".to_string(),
                )),
            }
        }
    }

    /// Seed the cache without a fetch, e.g. after a mutation already produced
    /// the authoritative value.
    pub fn prime(&self, resource: impl Into<String>, id: impl Into<String>, value: Value) {
        let mut state = self.inner.state.lock().expect("loader lock poisoned");
        state
            .cache
            .insert((resource.into(), id.into()), CacheSlot::Ready(Some(value)));
    }

    /// Invalidate one cached entry, or every entry for a resource.
    pub fn clear(&self, resource: &str, id: Option<&str>) {
        let mut state = self.inner.state.lock().expect("loader lock poisoned");
        match id {
            Some(id) => {
                state.cache.remove(&(resource.to_string(), id.to_string()));
            }
            None => state.cache.retain(|(cached, _), _| cached != resource),
        }
    }

    /// Number of cached entries.
    pub fn cached_len(&self) -> usize {
        self.inner.state.lock().expect("loader lock poisoned").cache.len()
    }
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("cached", &self.cached_len())
            .finish()
    }
}

async fn dispatch_ids(inner: Arc<LoaderInner>, resource: String) {
    let batch = {
        let mut state = inner.state.lock().expect("loader lock poisoned");
        state.id_batches.remove(&resource)
    };
    let Some(batch) = batch else { return };
    let IdBatch { keys, mut slots } = batch;

    tracing::debug!(resource = %resource, keys = keys.len(), "dispatching batched fetch");
    match inner.backend.fetch_by_id(&resource, &keys).await {
        Ok(values) => {
            let mut values = values.into_iter();
            let mut state = inner.state.lock().expect("loader lock poisoned");
            for key in &keys {
                let value = values.next().flatten();
                state
                    .cache
                    .insert((resource.clone(), key.clone()), CacheSlot::Ready(value.clone()));
                if let Some(slot) = slots.remove(key) {
                    let _ = slot.send(Some(Ok(value)));
                }
            }
        }
        Err(error) => {
            tracing::warn!(resource = %resource, %error, "batched fetch failed");
            let message = error.to_string();
            let mut state = inner.state.lock().expect("loader lock poisoned");
            for key in &keys {
                // Nothing is cached on failure, so a retry refetches; a slot
                // replaced by `prime` in the meantime stays.
                if let Some(CacheSlot::Pending(_)) =
                    state.cache.get(&(resource.clone(), key.clone()))
                {
                    state.cache.remove(&(resource.clone(), key.clone()));
                }
            }
            for slot in slots.into_values() {
                let _ = slot.send(Some(Err(message.clone())));
            }
        }
    }
}

async fn dispatch_field(inner: Arc<LoaderInner>, resource: String, field: String) {
    let batch = {
        let mut state = inner.state.lock().expect("loader lock poisoned");
        state.field_batches.remove(&(resource.clone(), field.clone()))
    };
    let Some(batch) = batch else { return };
    let FieldBatch { values, waiters } = batch;

    tracing::debug!(
        resource = %resource,
        field = %field,
        values = values.len(),
        "dispatching batched field fetch"
    );
    match inner.backend.fetch_by_field(&resource, &field, &values).await {
        Ok(entities) => {
            let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
            for entity in entities {
                let Some(key) = entity.get(&field).map(group_key) else {
                    continue;
                };
                grouped.entry(key).or_default().push(entity);
            }
            for (requested, waiter) in waiters {
                let mut subset = HashMap::new();
                for key in requested {
                    if let Some(entities) = grouped.get(&key) {
                        subset.insert(key, entities.clone());
                    }
                }
                let _ = waiter.send(Ok(subset));
            }
        }
        Err(error) => {
            tracing::warn!(resource = %resource, field = %field, %error, "batched field fetch failed");
            let message = error.to_string();
            for (_, waiter) in waiters {
                let _ = waiter.send(Err(message.clone()));
            }
        }
    }
}

fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend over a fixed entity set, recording every fetch.
    struct RecordingBackend {
        entities: HashMap<String, Value>,
        fetch_calls: AtomicUsize,
        fetched_keys: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingBackend {
        fn with_users() -> Self {
            let mut entities = HashMap::new();
            entities.insert("1".to_string(), json!({"id": "1", "name": "Ada"}));
            entities.insert("2".to_string(), json!({"id": "2", "name": "Grace"}));
            entities.insert("3".to_string(), json!({"id": "3", "name": "Edsger"}));
            Self {
                entities,
                fetch_calls: AtomicUsize::new(0),
                fetched_keys: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FetchBackend for RecordingBackend {
        async fn fetch_by_id(&self, _resource: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.fetched_keys.lock().unwrap().push(ids.to_vec());
            Ok(ids.iter().map(|id| self.entities.get(id).cloned()).collect())
        }

        async fn fetch_by_field(
            &self,
            _resource: &str,
            field: &str,
            values: &[Value],
        ) -> Result<Vec<Value>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .entities
                .values()
                .filter(|entity| {
                    entity
                        .get(field)
                        .map(|v| values.contains(v))
                        .unwrap_or(false)
                })
                .cloned()
                .collect())
        }
    }

    /// Backend whose fetches take long enough for another `load` to land
    /// while the first is still in flight.
    struct SlowBackend {
        fetch_calls: AtomicUsize,
    }

    #[async_trait]
    impl FetchBackend for SlowBackend {
        async fn fetch_by_id(&self, _resource: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok(ids.iter().map(|id| Some(json!({"id": id}))).collect())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl FetchBackend for FailingBackend {
        async fn fetch_by_id(&self, _resource: &str, _ids: &[String]) -> Result<Vec<Option<Value>>> {
            Err(LensError::Transport("storage unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_synchronous_loads_collapse_into_one_fetch() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        let first = loader.load("user", "1");
        let second = loader.load("user", "2");
        let third = loader.load("user", "1");

        let (a, b, c) = tokio::join!(first, second, third);

        assert_eq!(backend.calls(), 1);
        assert_eq!(
            backend.fetched_keys.lock().unwrap()[0],
            vec!["1".to_string(), "2".to_string()]
        );
        assert_eq!(a.unwrap().unwrap()["name"], "Ada");
        assert_eq!(b.unwrap().unwrap()["name"], "Grace");
        assert_eq!(c.unwrap().unwrap()["name"], "Ada");
    }

    #[tokio::test]
    async fn test_sequential_awaits_use_separate_batches() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        loader.load("user", "1").await.unwrap();
        loader.load("user", "2").await.unwrap();

        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_inflight_key_is_joined_not_refetched() {
        let backend = Arc::new(SlowBackend {
            fetch_calls: AtomicUsize::new(0),
        });
        let loader = ResourceLoader::new(backend.clone());

        let first = loader.load("user", "1");
        // Let the first batch dispatch; the backend is now mid-fetch.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = loader.load("user", "1");

        let (a, b) = tokio::join!(first, second);

        assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        let first = loader.load("user", "1").await.unwrap();
        let second = loader.load("user", "1").await.unwrap();

        assert_eq!(backend.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_id_resolves_to_none_and_is_cached() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        assert!(loader.load("user", "nope").await.unwrap().is_none());
        assert!(loader.load("user", "nope").await.unwrap().is_none());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_prime_seeds_cache_without_fetch() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        loader.prime("user", "1", json!({"id": "1"}));
        let value = loader.load("user", "1").await.unwrap();

        assert_eq!(backend.calls(), 0);
        assert_eq!(value, Some(json!({"id": "1"})));
    }

    #[tokio::test]
    async fn test_clear_invalidates_and_refetches() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        loader.prime("user", "1", json!({"id": "1"}));
        loader.load("user", "1").await.unwrap();
        assert_eq!(backend.calls(), 0);

        loader.clear("user", Some("1"));
        loader.load("user", "1").await.unwrap();
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_clear_whole_resource() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        loader.prime("user", "1", json!({}));
        loader.prime("user", "2", json!({}));
        loader.prime("post", "1", json!({}));

        loader.clear("user", None);

        assert_eq!(loader.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_load_many_positionally_aligned_with_duplicates() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        let ids: Vec<String> = ["2", "nope", "2", "1"].iter().map(|s| s.to_string()).collect();
        let results = loader.load_many("user", &ids).await;

        assert_eq!(backend.calls(), 1);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap()["name"], "Grace");
        assert!(results[1].is_none());
        assert_eq!(results[2].as_ref().unwrap()["name"], "Grace");
        assert_eq!(results[3].as_ref().unwrap()["name"], "Ada");
    }

    #[tokio::test]
    async fn test_backend_failure_maps_to_none_in_load_many() {
        let loader = ResourceLoader::new(Arc::new(FailingBackend));

        let ids: Vec<String> = vec!["1".to_string(), "2".to_string()];
        let results = loader.load_many("user", &ids).await;

        assert_eq!(results, vec![None, None]);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates_from_load() {
        let loader = ResourceLoader::new(Arc::new(FailingBackend));

        let error = loader.load("user", "1").await.unwrap_err();
        assert!(matches!(error, LensError::Transport(_)));
    }

    #[tokio::test]
    async fn test_load_by_field_groups_results() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        let grouped = loader
            .load_by_field("user", "name", vec![json!("Ada"), json!("Grace")])
            .await
            .unwrap();

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["Ada"][0]["id"], "1");
        assert_eq!(grouped["Grace"][0]["id"], "2");
    }

    #[tokio::test]
    async fn test_load_by_field_batches_concurrent_calls() {
        let backend = Arc::new(RecordingBackend::with_users());
        let loader = ResourceLoader::new(backend.clone());

        let first = loader.load_by_field("user", "name", vec![json!("Ada")]);
        let second = loader.load_by_field("user", "name", vec![json!("Grace")]);

        let (a, b) = tokio::join!(first, second);

        assert_eq!(backend.calls(), 1);
        assert!(a.unwrap().contains_key("Ada"));
        assert!(b.unwrap().contains_key("Grace"));
    }

    #[tokio::test]
    async fn test_field_lookup_failure_propagates() {
        let loader = ResourceLoader::new(Arc::new(FailingBackend));

        let error = loader
            .load_by_field("user", "name", vec![json!("Ada")])
            .await
            .unwrap_err();

        assert!(matches!(error, LensError::Transport(_)));
    }
}
