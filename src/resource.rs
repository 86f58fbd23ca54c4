//! Resource definitions and the process-wide registry.
//!
//! A resource is a named, schema-described entity type with optional
//! relationships, computed fields, lifecycle hooks, and an update strategy.
//! Definitions are validated eagerly at build time and registered once; the
//! registry refuses duplicate names instead of silently overwriting.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LensError, Result};
use crate::pubsub::PubSub;
use crate::schema::Schema;
use crate::update::UpdateStrategy;
use crate::BoxFuture;

/// Direction of a relationship edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    HasMany,
    BelongsTo,
}

/// Named edge to another resource. Relationships are navigable references
/// resolved on demand by the loader, never eagerly embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationKind,
    /// Target resource name.
    pub resource: String,
    /// Foreign-key field holding the reference.
    pub foreign_key: String,
}

/// Read-time virtual field: `(entity) -> value`, never persisted.
pub type ComputedField = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Mutation lifecycle phase a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

/// Context handed to a lifecycle hook.
///
/// `events` is the ambient pub/sub handle; `after*` hooks are the idiomatic
/// place to publish change events so subscriber notification stays coupled to
/// mutation completion without the resolver knowing who is subscribed.
#[derive(Clone)]
pub struct HookContext {
    /// Current entity data for this phase.
    pub data: Value,
    /// Prior data, present for update/delete phases.
    pub previous: Option<Value>,
    pub events: Arc<dyn PubSub>,
}

impl std::fmt::Debug for HookContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("data", &self.data)
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

/// Boxed lifecycle hook.
pub type Hook = Arc<dyn Fn(HookContext) -> BoxFuture<Result<()>> + Send + Sync>;

/// Canonical description of an entity type. Immutable once built; construct
/// via [`ResourceDefinition::define`].
pub struct ResourceDefinition {
    name: String,
    fields: Schema,
    relationships: BTreeMap<String, Relationship>,
    computed: BTreeMap<String, ComputedField>,
    update_strategy: UpdateStrategy,
    table_name: Option<String>,
    hooks: HashMap<HookPhase, Vec<Hook>>,
}

impl ResourceDefinition {
    /// Start defining a resource.
    pub fn define(name: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder {
            name: name.into(),
            fields: Schema::object(),
            relationships: BTreeMap::new(),
            computed: BTreeMap::new(),
            update_strategy: UpdateStrategy::default(),
            table_name: None,
            hooks: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &Schema {
        &self.fields
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    pub fn relationships(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.relationships.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn update_strategy(&self) -> &UpdateStrategy {
        &self.update_strategy
    }

    /// Storage hint, opaque to the core.
    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    /// Validate entity data against the field schema.
    pub fn validate(&self, entity: &Value) -> Result<Value> {
        self.fields.parse(entity)
    }

    /// Evaluate computed fields into virtual keys on a copy of the entity.
    /// Non-object entities are returned unchanged.
    pub fn apply_computed(&self, entity: &Value) -> Value {
        if self.computed.is_empty() {
            return entity.clone();
        }
        let Some(map) = entity.as_object() else {
            return entity.clone();
        };
        let mut out = map.clone();
        for (name, compute) in &self.computed {
            out.insert(name.clone(), compute(entity));
        }
        Value::Object(out)
    }

    /// Run every hook registered for `phase`, sequentially in registration
    /// order. A failing hook aborts the rest and propagates its error.
    pub async fn run_hooks(&self, phase: HookPhase, ctx: &HookContext) -> Result<()> {
        let Some(hooks) = self.hooks.get(&phase) else {
            return Ok(());
        };
        for hook in hooks {
            hook(ctx.clone()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("relationships", &self.relationships)
            .field("computed", &self.computed.keys().collect::<Vec<_>>())
            .field("update_strategy", &self.update_strategy)
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ResourceDefinition`].
pub struct ResourceBuilder {
    name: String,
    fields: Schema,
    relationships: BTreeMap<String, Relationship>,
    computed: BTreeMap<String, ComputedField>,
    update_strategy: UpdateStrategy,
    table_name: Option<String>,
    hooks: HashMap<HookPhase, Vec<Hook>>,
}

impl ResourceBuilder {
    pub fn fields(mut self, fields: Schema) -> Self {
        self.fields = fields;
        self
    }

    pub fn has_many(
        mut self,
        name: impl Into<String>,
        resource: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            Relationship {
                kind: RelationKind::HasMany,
                resource: resource.into(),
                foreign_key: foreign_key.into(),
            },
        );
        self
    }

    pub fn belongs_to(
        mut self,
        name: impl Into<String>,
        resource: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            Relationship {
                kind: RelationKind::BelongsTo,
                resource: resource.into(),
                foreign_key: foreign_key.into(),
            },
        );
        self
    }

    pub fn computed(
        mut self,
        name: impl Into<String>,
        compute: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.computed.insert(name.into(), Arc::new(compute));
        self
    }

    pub fn update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    /// Attach a lifecycle hook. Hooks run sequentially per phase in
    /// registration order.
    pub fn hook<F, Fut>(mut self, phase: HookPhase, hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |ctx| Box::pin(hook(ctx)));
        self.hooks.entry(phase).or_default().push(hook);
        self
    }

    /// Validate the definition and finish. Fails fast on construction, not at
    /// first use.
    pub fn build(self) -> Result<ResourceDefinition> {
        if self.name.is_empty() {
            return Err(LensError::Configuration(
                "resource name must not be empty".to_string(),
            ));
        }
        for field in &self.update_strategy.streaming_fields {
            if !self.fields.is_empty() && self.fields.get(field).is_none() {
                return Err(LensError::Configuration(format!(
                    "streaming field `{field}` is not declared on resource `{}`",
                    self.name
                )));
            }
        }
        for (name, relationship) in &self.relationships {
            if relationship.resource.is_empty() || relationship.foreign_key.is_empty() {
                return Err(LensError::Configuration(format!(
                    "relationship `{name}` on resource `{}` is missing a target or foreign key",
                    self.name
                )));
            }
        }
        Ok(ResourceDefinition {
            name: self.name,
            fields: self.fields,
            relationships: self.relationships,
            computed: self.computed,
            update_strategy: self.update_strategy,
            table_name: self.table_name,
            hooks: self.hooks,
        })
    }
}

/// Registry of resource definitions, keyed by name.
///
/// Explicitly constructed and passed through context rather than held as a
/// language-level global, so tests can build isolated instances. Registration
/// happens once during composition; runtime access is read-only.
#[derive(Default)]
pub struct ResourceRegistry {
    inner: Mutex<HashMap<String, Arc<ResourceDefinition>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. A duplicate name is refused with a
    /// configuration error; use [`ResourceRegistry::clear`] in tests that
    /// need to redefine.
    pub fn register(&self, definition: ResourceDefinition) -> Result<Arc<ResourceDefinition>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.contains_key(definition.name()) {
            return Err(LensError::Configuration(format!(
                "resource `{}` is already registered",
                definition.name()
            )));
        }
        let definition = Arc::new(definition);
        inner.insert(definition.name().to_string(), Arc::clone(&definition));
        Ok(definition)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceDefinition>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every definition. Test isolation only.
    pub fn clear(&self) {
        self.inner.lock().expect("registry lock poisoned").clear();
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resources", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryPubSub;
    use crate::schema::FieldType;
    use serde_json::json;

    fn message_definition() -> ResourceDefinition {
        ResourceDefinition::define("message")
            .fields(
                Schema::object()
                    .required("id", FieldType::String)
                    .field("content", FieldType::String),
            )
            .update_strategy(UpdateStrategy::streaming(["content"]))
            .table_name("messages")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_produces_definition() {
        let definition = message_definition();

        assert_eq!(definition.name(), "message");
        assert_eq!(definition.table_name(), Some("messages"));
        assert!(definition.update_strategy().is_streaming_field("content"));
    }

    #[test]
    fn test_empty_name_is_refused() {
        let error = ResourceDefinition::define("").build().unwrap_err();
        assert!(matches!(error, LensError::Configuration(_)));
    }

    #[test]
    fn test_undeclared_streaming_field_is_refused() {
        let error = ResourceDefinition::define("message")
            .fields(Schema::object().required("id", FieldType::String))
            .update_strategy(UpdateStrategy::streaming(["content"]))
            .build()
            .unwrap_err();

        assert!(error.to_string().contains("streaming field `content`"));
    }

    #[test]
    fn test_relationships_are_navigable_references() {
        let definition = ResourceDefinition::define("message")
            .belongs_to("session", "session", "sessionId")
            .has_many("replies", "message", "parentId")
            .build()
            .unwrap();

        let session = definition.relationship("session").unwrap();
        assert_eq!(session.kind, RelationKind::BelongsTo);
        assert_eq!(session.foreign_key, "sessionId");

        let replies = definition.relationship("replies").unwrap();
        assert_eq!(replies.kind, RelationKind::HasMany);
        assert_eq!(definition.relationships().count(), 2);
    }

    #[test]
    fn test_validate_delegates_to_field_schema() {
        let definition = message_definition();

        assert!(definition.validate(&json!({"id": "1"})).is_ok());
        assert!(definition.validate(&json!({"content": "no id"})).is_err());
    }

    #[test]
    fn test_computed_fields_are_virtual() {
        let definition = ResourceDefinition::define("message")
            .computed("length", |entity| {
                json!(entity["content"].as_str().map(str::len).unwrap_or(0))
            })
            .build()
            .unwrap();

        let entity = json!({"id": "1", "content": "hello"});
        let enriched = definition.apply_computed(&entity);

        assert_eq!(enriched["length"], 5);
        // The stored shape is untouched.
        assert!(entity.get("length").is_none());
    }

    #[tokio::test]
    async fn test_hooks_run_sequentially_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);

        let definition = ResourceDefinition::define("message")
            .hook(HookPhase::AfterUpdate, move |_ctx| {
                let order = Arc::clone(&first);
                async move {
                    order.lock().unwrap().push("first");
                    Ok(())
                }
            })
            .hook(HookPhase::AfterUpdate, move |_ctx| {
                let order = Arc::clone(&second);
                async move {
                    order.lock().unwrap().push("second");
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let ctx = HookContext {
            data: json!({"id": "1"}),
            previous: None,
            events: Arc::new(MemoryPubSub::new()),
        };
        definition.run_hooks(HookPhase::AfterUpdate, &ctx).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_hook_aborts_remaining_hooks() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        let definition = ResourceDefinition::define("message")
            .hook(HookPhase::BeforeUpdate, |_ctx| async {
                Err(LensError::resolver("rejected"))
            })
            .hook(HookPhase::BeforeUpdate, move |_ctx| {
                let flag = Arc::clone(&flag);
                async move {
                    *flag.lock().unwrap() = true;
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let ctx = HookContext {
            data: json!({}),
            previous: None,
            events: Arc::new(MemoryPubSub::new()),
        };
        let result = definition.run_hooks(HookPhase::BeforeUpdate, &ctx).await;

        assert!(result.is_err());
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_phase_without_hooks_is_a_noop() {
        let definition = message_definition();
        let ctx = HookContext {
            data: json!({}),
            previous: None,
            events: Arc::new(MemoryPubSub::new()),
        };

        assert!(definition.run_hooks(HookPhase::BeforeDelete, &ctx).await.is_ok());
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = ResourceRegistry::new();
        registry.register(message_definition()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("message").unwrap().name(), "message");
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_registry_refuses_duplicate_names() {
        let registry = ResourceRegistry::new();
        registry.register(message_definition()).unwrap();

        let error = registry.register(message_definition()).unwrap_err();
        assert!(matches!(error, LensError::Configuration(_)));
        assert!(error.to_string().contains("already registered"));
    }

    #[test]
    fn test_registry_clear_allows_redefinition() {
        let registry = ResourceRegistry::new();
        registry.register(message_definition()).unwrap();

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.register(message_definition()).is_ok());
    }

    #[test]
    fn test_registry_names_are_sorted() {
        let registry = ResourceRegistry::new();
        registry
            .register(ResourceDefinition::define("zebra").build().unwrap())
            .unwrap();
        registry
            .register(ResourceDefinition::define("aardvark").build().unwrap())
            .unwrap();

        assert_eq!(registry.names(), vec!["aardvark", "zebra"]);
    }
}
