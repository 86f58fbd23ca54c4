//! # Lens
//!
//! A typed, real-time query/mutation/subscription protocol runtime.
//!
//! A server exposes **queries**, **mutations**, and **subscriptions** over
//! named resources; clients request only the fields they need, and the
//! server pushes minimally-sized updates (full value, text delta, or
//! structural patch) to live subscribers when data changes. Mutations and
//! live queries meet on deterministically named pub/sub channels, so a
//! mutation on entity X refreshes exactly the subscribers watching X with no
//! per-endpoint wiring.
//!
//! Wire framing, storage engines, and UI bindings live outside this crate;
//! they plug in through [`LensTransport`], [`FetchBackend`], and [`PubSub`].
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use lens_rt::{
//!     query, EndpointSet, FieldType, LensRequest, LensServer, LensTransport, Schema,
//! };
//! use serde_json::json;
//! # use async_trait::async_trait;
//! # struct NullBackend;
//! # #[async_trait]
//! # impl lens_rt::FetchBackend for NullBackend {
//! #     async fn fetch_by_id(
//! #         &self,
//! #         _resource: &str,
//! #         ids: &[String],
//! #     ) -> lens_rt::Result<Vec<Option<serde_json::Value>>> {
//! #         Ok(ids.iter().map(|_| None).collect())
//! #     }
//! # }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lens_rt::Result<()> {
//! let endpoints = EndpointSet::new().nest(
//!     "greeting",
//!     EndpointSet::new().endpoint(
//!         "get",
//!         query()
//!             .input(Schema::object().required("name", FieldType::String))
//!             .resolve(|input, _ctx| async move {
//!                 Ok(json!({ "greeting": format!("Hello, {}!", input["name"].as_str().unwrap_or("world")) }))
//!             })
//!             .build()?,
//!     ),
//! );
//!
//! let server = LensServer::builder()
//!     .endpoints(endpoints)
//!     .backend(Arc::new(NullBackend))
//!     .build()?;
//!
//! let result = server
//!     .query(LensRequest::query(["greeting", "get"], json!({"name": "Ada"})))
//!     .await?;
//! assert_eq!(result["greeting"], "Hello, Ada!");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod channel;
pub mod context;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod loader;
pub mod pubsub;
pub mod resource;
pub mod schema;
pub mod select;
pub mod server;
pub mod transport;
pub mod update;

/// Boxed future used by resolver, hook, and subscribe function types.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub use channel::{ChannelNaming, NamingFn, ID_FIELD_PRIORITY};
pub use context::RequestContext;
pub use endpoint::{
    mutation, query, EndpointBuilder, EndpointDescriptor, EndpointKind, EndpointSet, Resolver,
    SubscribeFn,
};
pub use envelope::{ErrorPayload, LensRequest, LensResponse, RequestKind};
pub use error::{LensError, Result};
pub use loader::{FetchBackend, ResourceLoader};
pub use pubsub::{ChangeEvent, ChangeStream, MemoryPubSub, PubSub, Subscription};
pub use resource::{
    ComputedField, Hook, HookContext, HookPhase, RelationKind, Relationship, ResourceBuilder,
    ResourceDefinition, ResourceRegistry,
};
pub use schema::{FieldSpec, FieldType, Schema};
pub use select::{apply_field_selection, FieldSelection, SelectionNode};
pub use server::{LensServer, LensServerBuilder};
pub use transport::{
    LensTransport, Middleware, MiddlewareTransport, Next, TimeoutMiddleware, TransportRouter,
    UpdateStream,
};
pub use update::{PatchOp, StrategyMode, UpdateMode, UpdatePayload, UpdateStrategy};
