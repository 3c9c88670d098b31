//! The context container: scoped `run`/`with` execution, reads and writes
//! against the currently visible mapping, and capture-and-restore via
//! [`bind`](ContextContainer::bind).

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::task::LocalKey;

use crate::error::{ContextError, Op};
use crate::map::{ContextMap, Field, ScopeCell, Snapshot};

/// Hook invoked when an operation needs an active scope and finds none.
pub type MissingContextHook = Arc<dyn Fn(Op) + Send + Sync>;

/// Hook invoked with every error an operation is about to return.
pub type ErrorHook = Arc<dyn Fn(&ContextError, Op) + Send + Sync>;

/// Scoped key/value context over a `tokio::task_local!` store.
///
/// The container does not own the storage primitive; it consumes a
/// `&'static LocalKey` declared by the host (one `task_local!` per field-set
/// type), and layers policy on top: default-value seeding at `run`, copy-and-
/// merge on `with`, strict versus lenient handling of missing scopes, and the
/// two observability hooks.
///
/// Containers are plain values — construct one where the rest of the
/// application is wired together and pass it (or clone it; clones share the
/// hooks) to whoever needs it. Cloning never copies live scope state: scope
/// state lives in the task-local store, not in the container.
///
/// Scopes nest: a child opened by [`with`](Self::with) starts from a *copy*
/// of the parent's visible mapping, so nothing a child does is observable in
/// the parent, and two scopes in flight at once — however their executions
/// interleave — never see each other's values.
#[derive(Clone)]
pub struct ContextContainer<K: 'static, V: 'static> {
    store: &'static LocalKey<ScopeCell<K, V>>,
    strict: bool,
    defaults: ContextMap<K, V>,
    on_missing_context: Option<MissingContextHook>,
    on_error: Option<ErrorHook>,
}

impl<K, V> ContextContainer<K, V>
where
    K: Field,
    V: Clone + 'static,
{
    /// Create a lenient container over `store` with no defaults and no hooks.
    pub fn new(store: &'static LocalKey<ScopeCell<K, V>>) -> Self {
        Self {
            store,
            strict: false,
            defaults: ContextMap::new(),
            on_missing_context: None,
            on_error: None,
        }
    }

    /// Set the missing-scope policy.
    ///
    /// Strict containers return [`ContextError::MissingContext`] from
    /// `get`/`set`/`with`/`snapshot`/`bind` when no scope is active; lenient
    /// containers (the default) fall back to safe no-op behaviour instead.
    /// [`require`](Self::require) is strict in both modes.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Values merged beneath every [`run`](Self::run) call's values.
    ///
    /// Run values win on collision. Defaults are applied only when a
    /// top-level scope is seeded; [`with`](Self::with) inherits whatever the
    /// enclosing mapping already holds.
    pub fn with_defaults(mut self, defaults: ContextMap<K, V>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Observe operations that needed an active scope and found none.
    ///
    /// Fires once per such call, before the strict/lenient branch is taken.
    pub fn on_missing_context<H>(mut self, hook: H) -> Self
    where
        H: Fn(Op) + Send + Sync + 'static,
    {
        self.on_missing_context = Some(Arc::new(hook));
        self
    }

    /// Observe every error an operation is about to return.
    ///
    /// Fires exactly once per returned error, with the error and the failing
    /// operation. The error still propagates to the caller unchanged; this
    /// hook is for instrumentation, not recovery.
    pub fn on_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(&ContextError, Op) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Whether a scope is currently active. Never errors, never fires hooks.
    pub fn in_scope(&self) -> bool {
        self.store.try_with(|_| ()).is_ok()
    }

    /// Run `fut` inside a fresh top-level scope.
    ///
    /// The scope's mapping is the container defaults merged with `values`
    /// (values win) — a shallow copy; values themselves are not deep-cloned.
    /// The callee's output passes through unchanged, including its own
    /// failure type if it returns one.
    pub async fn run<F>(&self, values: ContextMap<K, V>, fut: F) -> F::Output
    where
        F: Future,
    {
        self.store.scope(RefCell::new(self.seed(values)), fut).await
    }

    /// Synchronous twin of [`run`](Self::run).
    pub fn run_sync<R>(&self, values: ContextMap<K, V>, f: impl FnOnce() -> R) -> R {
        self.store.sync_scope(RefCell::new(self.seed(values)), f)
    }

    /// Run `fut` inside a child scope: a copy of the currently visible
    /// mapping merged with `values` (values win).
    ///
    /// The merged additions are local to the child; the caller's own mapping
    /// is untouched once the child completes. With no enclosing scope a
    /// lenient container falls back to [`run`](Self::run) semantics, while a
    /// strict container returns [`ContextError::MissingContext`] without
    /// polling `fut` at all.
    pub async fn with<F>(&self, values: ContextMap<K, V>, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        let map = self.child_map(values)?;
        Ok(self.store.scope(RefCell::new(map), fut).await)
    }

    /// Synchronous twin of [`with`](Self::with).
    pub fn with_sync<R>(
        &self,
        values: ContextMap<K, V>,
        f: impl FnOnce() -> R,
    ) -> Result<R, ContextError> {
        let map = self.child_map(values)?;
        Ok(self.store.sync_scope(RefCell::new(map), f))
    }

    /// Read a field from the currently visible mapping.
    ///
    /// An unset key inside an active scope is `Ok(None)` in both modes — an
    /// optional field that was never provided is not an error.
    pub fn get(&self, key: K) -> Result<Option<V>, ContextError> {
        match self.store.try_with(|cell| cell.borrow().get(key).cloned()) {
            Ok(value) => Ok(value),
            Err(_) => {
                self.missing(Op::Get);
                if self.strict {
                    Err(self.raise(ContextError::MissingContext(Op::Get), Op::Get))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Read a field that must be present, in both modes.
    ///
    /// No active scope is [`ContextError::MissingContext`]; an unset key
    /// inside an active scope is [`ContextError::MissingKey`].
    pub fn require(&self, key: K) -> Result<V, ContextError> {
        match self.store.try_with(|cell| cell.borrow().get(key).cloned()) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(self.raise(ContextError::MissingKey(key.to_string()), Op::Require)),
            Err(_) => {
                self.missing(Op::Require);
                Err(self.raise(ContextError::MissingContext(Op::Require), Op::Require))
            }
        }
    }

    /// Write a field into the innermost currently visible mapping, in place.
    ///
    /// The write is seen by later reads in this scope and by scopes nested
    /// after it, never by the parent's or a sibling's own copy. With no
    /// active scope a lenient container silently drops the write.
    pub fn set(&self, key: K, value: V) -> Result<(), ContextError> {
        match self
            .store
            .try_with(|cell| cell.borrow_mut().insert(key, value))
        {
            Ok(_) => Ok(()),
            Err(_) => {
                self.missing(Op::Set);
                if self.strict {
                    Err(self.raise(ContextError::MissingContext(Op::Set), Op::Set))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Copy the currently visible mapping into an immutable [`Snapshot`].
    ///
    /// The snapshot stays valid after the scope ends. With no active scope a
    /// lenient container returns an empty snapshot.
    pub fn snapshot(&self) -> Result<Snapshot<K, V>, ContextError> {
        match self.store.try_with(|cell| cell.borrow().clone()) {
            Ok(map) => Ok(Snapshot::from_map(map)),
            Err(_) => {
                self.missing(Op::Snapshot);
                if self.strict {
                    Err(self.raise(ContextError::MissingContext(Op::Snapshot), Op::Snapshot))
                } else {
                    Ok(Snapshot::empty())
                }
            }
        }
    }

    /// Freeze the currently visible mapping and wrap `f` so that every later
    /// invocation replays the frozen mapping as its own fresh scope.
    ///
    /// The returned [`Bound`] can be called zero, one or many times, inside
    /// or outside any scope, on any logical flow; invocations are mutually
    /// independent. With no active scope at bind time a lenient container
    /// returns a passthrough that calls `f` with no context attached, while a
    /// strict container fails here rather than handing back a passthrough.
    pub fn bind<F>(&self, f: F) -> Result<Bound<K, V, F>, ContextError> {
        match self.store.try_with(|cell| cell.borrow().clone()) {
            Ok(map) => Ok(Bound {
                store: self.store,
                captured: Some(map),
                inner: f,
            }),
            Err(_) => {
                self.missing(Op::Bind);
                if self.strict {
                    Err(self.raise(ContextError::MissingContext(Op::Bind), Op::Bind))
                } else {
                    Ok(Bound {
                        store: self.store,
                        captured: None,
                        inner: f,
                    })
                }
            }
        }
    }

    /// Run `fut` inside a fresh scope seeded from `snapshot`.
    ///
    /// The capture half of [`bind`](Self::bind), decomposed: take a
    /// [`snapshot`](Self::snapshot) now, resume it later. Defaults are not
    /// re-merged; the snapshot is replayed as-is.
    pub async fn resume<F>(&self, snapshot: Snapshot<K, V>, fut: F) -> F::Output
    where
        F: Future,
    {
        self.store
            .scope(RefCell::new(snapshot.into_map()), fut)
            .await
    }

    /// Synchronous twin of [`resume`](Self::resume).
    pub fn resume_sync<R>(&self, snapshot: Snapshot<K, V>, f: impl FnOnce() -> R) -> R {
        self.store
            .sync_scope(RefCell::new(snapshot.into_map()), f)
    }

    /// Defaults merged with `values`, values winning.
    fn seed(&self, values: ContextMap<K, V>) -> ContextMap<K, V> {
        let mut map = self.defaults.clone();
        map.merge(values);
        map
    }

    /// The mapping a `with` child starts from, or the missing-scope outcome.
    fn child_map(&self, values: ContextMap<K, V>) -> Result<ContextMap<K, V>, ContextError> {
        match self.store.try_with(|cell| cell.borrow().clone()) {
            Ok(mut map) => {
                map.merge(values);
                Ok(map)
            }
            Err(_) => {
                self.missing(Op::With);
                if self.strict {
                    Err(self.raise(ContextError::MissingContext(Op::With), Op::With))
                } else {
                    Ok(self.seed(values))
                }
            }
        }
    }

    fn missing(&self, op: Op) {
        tracing::trace!(%op, "no active context scope");
        if let Some(hook) = &self.on_missing_context {
            hook(op);
        }
    }

    fn raise(&self, err: ContextError, op: Op) -> ContextError {
        if let Some(hook) = &self.on_error {
            hook(&err, op);
        }
        err
    }
}

impl<K, V> fmt::Debug for ContextContainer<K, V>
where
    K: Field + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextContainer")
            .field("strict", &self.strict)
            .field("defaults", &self.defaults)
            .field("in_scope", &self.store.try_with(|_| ()).is_ok())
            .finish_non_exhaustive()
    }
}

/// A callable produced by [`ContextContainer::bind`], carrying a frozen copy
/// of the mapping that was visible at bind time.
///
/// Each invocation clones the frozen mapping into a fresh scope of its own,
/// so repeated or concurrent invocations never interfere — and never observe
/// whatever scope happens to be active at the call site.
pub struct Bound<K: 'static, V: 'static, F> {
    store: &'static LocalKey<ScopeCell<K, V>>,
    captured: Option<ContextMap<K, V>>,
    inner: F,
}

impl<K, V, F> Bound<K, V, F>
where
    K: Field,
    V: Clone + 'static,
{
    /// Whether bind time found no scope to capture (lenient containers only);
    /// invocations then call the wrapped function with no context attached.
    pub fn is_passthrough(&self) -> bool {
        self.captured.is_none()
    }

    /// Invoke the wrapped async function under the captured mapping.
    pub async fn call<Fut>(&self) -> Fut::Output
    where
        F: Fn() -> Fut,
        Fut: Future,
    {
        match &self.captured {
            Some(map) => {
                self.store
                    .scope(RefCell::new(map.clone()), (self.inner)())
                    .await
            }
            None => (self.inner)().await,
        }
    }

    /// Invoke the wrapped synchronous function under the captured mapping.
    pub fn call_sync<R>(&self) -> R
    where
        F: Fn() -> R,
    {
        match &self.captured {
            Some(map) => self
                .store
                .sync_scope(RefCell::new(map.clone()), || (self.inner)()),
            None => (self.inner)(),
        }
    }
}

impl<K, V, F> fmt::Debug for Bound<K, V, F>
where
    K: Field + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound")
            .field("captured", &self.captured)
            .finish_non_exhaustive()
    }
}
