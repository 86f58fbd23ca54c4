//! Endpoint descriptors and the namespace builder.
//!
//! Queries and mutations are declared once at startup through the builders
//! and composed into nested [`EndpointSet`]s; the dotted routing path of each
//! endpoint is derived from the nesting, never configured independently, so a
//! path and its endpoint tree cannot drift apart.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::context::RequestContext;
use crate::error::{LensError, Result};
use crate::pubsub::ChangeStream;
use crate::schema::Schema;
use crate::BoxFuture;

/// Kind of endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Query,
    Mutation,
}

/// Boxed resolver function: `(input, ctx) -> output`.
pub type Resolver = Arc<dyn Fn(Value, RequestContext) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Boxed custom subscription source: `(input, ctx) -> stream of change events`.
pub type SubscribeFn =
    Arc<dyn Fn(Value, RequestContext) -> BoxFuture<Result<ChangeStream>> + Send + Sync>;

/// A typed endpoint: input/output schema plus resolver, with an optional
/// custom subscription source. Created once via [`query`] or [`mutation`] and
/// immutable thereafter.
pub struct EndpointDescriptor {
    kind: EndpointKind,
    path: Vec<String>,
    input: Schema,
    output: Schema,
    resolve: Resolver,
    subscribe: Option<SubscribeFn>,
    /// Client-side predicted value for optimistic mutations; opaque to the
    /// core runtime, executed by the client collaborator.
    optimistic: Option<Value>,
}

impl EndpointDescriptor {
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Dotted address segments, assigned during composition.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn input(&self) -> &Schema {
        &self.input
    }

    pub fn output(&self) -> &Schema {
        &self.output
    }

    /// Invoke the resolver with validated input.
    pub fn call(&self, input: Value, ctx: RequestContext) -> BoxFuture<Result<Value>> {
        (self.resolve)(input, ctx)
    }

    pub fn subscribe_fn(&self) -> Option<&SubscribeFn> {
        self.subscribe.as_ref()
    }

    pub fn optimistic(&self) -> Option<&Value> {
        self.optimistic.as_ref()
    }

    fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }
}

impl std::fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("has_subscribe", &self.subscribe.is_some())
            .finish_non_exhaustive()
    }
}

/// Start declaring a query endpoint.
pub fn query() -> EndpointBuilder {
    EndpointBuilder::new(EndpointKind::Query)
}

/// Start declaring a mutation endpoint.
pub fn mutation() -> EndpointBuilder {
    EndpointBuilder::new(EndpointKind::Mutation)
}

/// Builder producing an [`EndpointDescriptor`].
pub struct EndpointBuilder {
    kind: EndpointKind,
    input: Schema,
    output: Schema,
    resolve: Option<Resolver>,
    subscribe: Option<SubscribeFn>,
    optimistic: Option<Value>,
}

impl EndpointBuilder {
    fn new(kind: EndpointKind) -> Self {
        Self {
            kind,
            input: Schema::any(),
            output: Schema::any(),
            resolve: None,
            subscribe: None,
            optimistic: None,
        }
    }

    pub fn input(mut self, schema: Schema) -> Self {
        self.input = schema;
        self
    }

    pub fn output(mut self, schema: Schema) -> Self {
        self.output = schema;
        self
    }

    pub fn resolve<F, Fut>(mut self, resolve: F) -> Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.resolve = Some(Arc::new(move |input, ctx| Box::pin(resolve(input, ctx))));
        self
    }

    /// Custom subscription source. When absent, the server synthesizes one
    /// from the pub/sub channel named after the endpoint's `(path, input)`.
    pub fn subscribe<F, Fut>(mut self, subscribe: F) -> Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ChangeStream>> + Send + 'static,
    {
        self.subscribe = Some(Arc::new(move |input, ctx| Box::pin(subscribe(input, ctx))));
        self
    }

    /// Declare a client-side optimistic value for a mutation.
    pub fn optimistic(mut self, predicted: Value) -> Self {
        self.optimistic = Some(predicted);
        self
    }

    pub fn build(self) -> Result<EndpointDescriptor> {
        let Some(resolve) = self.resolve else {
            return Err(LensError::Configuration(
                "endpoint is missing a resolve function".to_string(),
            ));
        };
        if self.kind == EndpointKind::Mutation && self.subscribe.is_some() {
            return Err(LensError::Configuration(
                "mutations cannot declare a subscribe function".to_string(),
            ));
        }
        Ok(EndpointDescriptor {
            kind: self.kind,
            path: Vec::new(),
            input: self.input,
            output: self.output,
            resolve,
            subscribe: self.subscribe,
            optimistic: self.optimistic,
        })
    }
}

enum Entry {
    Leaf(EndpointDescriptor),
    Nest(EndpointSet),
}

/// Nested endpoint namespace mirroring the desired path tree.
///
/// # Example
///
/// ```rust
/// use lens_rt::{query, EndpointSet};
/// use serde_json::json;
///
/// let routes = EndpointSet::new()
///     .nest(
///         "message",
///         EndpointSet::new().endpoint(
///             "get",
///             query().resolve(|_input, _ctx| async { Ok(json!({})) }).build().unwrap(),
///         ),
///     )
///     .into_routes()
///     .unwrap();
///
/// assert!(routes.contains_key("message.get"));
/// ```
#[derive(Default)]
pub struct EndpointSet {
    entries: Vec<(String, Entry)>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, name: impl Into<String>, descriptor: EndpointDescriptor) -> Self {
        self.entries.push((name.into(), Entry::Leaf(descriptor)));
        self
    }

    pub fn nest(mut self, name: impl Into<String>, set: EndpointSet) -> Self {
        self.entries.push((name.into(), Entry::Nest(set)));
        self
    }

    /// Flatten the tree into a route table keyed by the joined path. Built
    /// once at composition time; duplicate paths are refused.
    pub fn into_routes(self) -> Result<HashMap<String, Arc<EndpointDescriptor>>> {
        let mut routes = HashMap::new();
        self.flatten(&mut Vec::new(), &mut routes)?;
        Ok(routes)
    }

    fn flatten(
        self,
        prefix: &mut Vec<String>,
        routes: &mut HashMap<String, Arc<EndpointDescriptor>>,
    ) -> Result<()> {
        for (name, entry) in self.entries {
            prefix.push(name);
            match entry {
                Entry::Leaf(descriptor) => {
                    let key = prefix.join(".");
                    if routes.contains_key(&key) {
                        return Err(LensError::Configuration(format!(
                            "duplicate endpoint path `{key}`"
                        )));
                    }
                    let descriptor = descriptor.with_path(prefix.clone());
                    routes.insert(key, Arc::new(descriptor));
                }
                Entry::Nest(set) => set.flatten(prefix, routes)?,
            }
            prefix.pop();
        }
        Ok(())
    }
}
