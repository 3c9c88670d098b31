//! # weft-context
//!
//! Request-scoped key/value context propagation for async Rust.
//!
//! State set early in a logical flow (a request id, a user id, a tenant) is
//! readable anywhere in that flow's async call graph — across `.await`
//! points, timers and worker-thread migration — without threading it through
//! every function signature. This is a context-propagation primitive, not a
//! tracing system: no spans, no export, no cross-process propagation.
//!
//! The storage primitive is the runtime's own: a `tokio::task_local!` store,
//! declared by the host with a concrete field-set type and handed to a
//! [`ContextContainer`], which layers policy on top — default-value seeding,
//! copy-and-merge scope nesting, a strict/lenient missing-scope policy,
//! observability hooks, and capture-and-restore for deferred work.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::fmt;
//! use weft_context::{ContextContainer, ContextMap, ScopeCell};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Field {
//!     RequestId,
//!     UserId,
//! }
//!
//! impl fmt::Display for Field {
//!     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
//!         f.write_str(match self {
//!             Field::RequestId => "request_id",
//!             Field::UserId => "user_id",
//!         })
//!     }
//! }
//!
//! // The host declares the store; the container consumes it.
//! tokio::task_local! {
//!     static SCOPE: ScopeCell<Field, String>;
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ctx = ContextContainer::new(&SCOPE);
//!
//! let mut values = ContextMap::new();
//! values.insert(Field::RequestId, "req-1".to_owned());
//!
//! let seen = ctx
//!     .run(values, async {
//!         // ...arbitrarily deep in the call graph, after any awaits:
//!         ctx.get(Field::RequestId)
//!     })
//!     .await;
//! assert_eq!(seen.unwrap().as_deref(), Some("req-1"));
//! # }
//! ```
//!
//! ## Scope semantics
//!
//! [`run`](ContextContainer::run) opens a top-level scope (defaults merged
//! beneath the given values); [`with`](ContextContainer::with) opens a child
//! scope from a *copy* of the parent's mapping, so child overrides never leak
//! back out. Two scopes in flight at once are fully isolated however their
//! executions interleave. [`bind`](ContextContainer::bind) freezes the
//! visible mapping into a callable that replays it later as a fresh scope per
//! invocation — context time-travel for deferred callbacks.

pub mod container;
pub mod error;
pub mod map;

pub use container::{Bound, ContextContainer, ErrorHook, MissingContextHook};
pub use error::{ContextError, Op};
pub use map::{ContextMap, Field, ScopeCell, Snapshot};

/// Convenient prelude with everything you need.
pub mod prelude {
    pub use crate::{
        Bound, ContextContainer, ContextError, ContextMap, Field, Op, ScopeCell, Snapshot,
    };
}
