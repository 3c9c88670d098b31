//! Mapping types attached to a scope: [`ContextMap`], [`Snapshot`] and the
//! [`Field`] key trait.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map;
use std::fmt;
use std::hash::Hash;

/// Marker trait for context keys.
///
/// Keys come from a fixed, statically known field set — in practice a small
/// fieldless `Copy` enum. `Display` is what error messages and hook payloads
/// use to name a key, so implement it with stable, log-friendly names
/// (`request_id`, not `RequestId`).
pub trait Field: Copy + Eq + Hash + fmt::Display + Send + 'static {}

impl<T> Field for T where T: Copy + Eq + Hash + fmt::Display + Send + 'static {}

/// The cell a scope attaches to the current task.
///
/// This is the type to put inside a `tokio::task_local!` declaration:
///
/// ```rust,ignore
/// tokio::task_local! {
///     static SCOPE: ScopeCell<MyField, String>;
/// }
/// ```
///
/// `RefCell` gives `set` its in-place mutation of the innermost mapping; a
/// task-local is only ever touched by the task that owns the poll, so the
/// borrow can never be contended across threads.
pub type ScopeCell<K, V> = RefCell<ContextMap<K, V>>;

/// Key/value state attached to a scope.
///
/// Insertion order is irrelevant; values are opaque to the container and are
/// cloned shallowly when a child scope copies its parent's mapping.
#[derive(Debug, Clone)]
pub struct ContextMap<K, V> {
    entries: HashMap<K, V>,
}

impl<K, V> ContextMap<K, V>
where
    K: Field,
{
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert a value, returning the previous value for the key if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Look up a key.
    pub fn get(&self, key: K) -> Option<&V> {
        self.entries.get(&key)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    /// Merge `other` into `self`; `other` wins on key collision.
    pub fn merge(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in arbitrary order.
    pub fn iter(&self) -> hash_map::Iter<'_, K, V> {
        self.entries.iter()
    }
}

impl<K, V> Default for ContextMap<K, V>
where
    K: Field,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PartialEq for ContextMap<K, V>
where
    K: Field,
    V: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K, V> Eq for ContextMap<K, V>
where
    K: Field,
    V: Eq,
{
}

impl<K, V> FromIterator<(K, V)> for ContextMap<K, V>
where
    K: Field,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for ContextMap<K, V>
where
    K: Field,
{
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl<K, V> Extend<(K, V)> for ContextMap<K, V>
where
    K: Field,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl<'a, K, V> IntoIterator for &'a ContextMap<K, V>
where
    K: Field,
{
    type Item = (&'a K, &'a V);
    type IntoIter = hash_map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// An immutable point-in-time copy of a mapping.
///
/// Snapshots are owned copies: they stay valid after their originating scope
/// ends, and nothing done through a snapshot can reach live scope state.
/// Replay one with [`ContextContainer::resume`](crate::ContextContainer::resume).
#[derive(Debug, Clone)]
pub struct Snapshot<K, V> {
    entries: ContextMap<K, V>,
}

impl<K, V> Snapshot<K, V>
where
    K: Field,
{
    /// A snapshot with no entries.
    pub fn empty() -> Self {
        Self {
            entries: ContextMap::new(),
        }
    }

    pub(crate) fn from_map(entries: ContextMap<K, V>) -> Self {
        Self { entries }
    }

    pub(crate) fn into_map(self) -> ContextMap<K, V> {
        self.entries
    }

    /// Look up a key.
    pub fn get(&self, key: K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in arbitrary order.
    pub fn iter(&self) -> hash_map::Iter<'_, K, V> {
        self.entries.iter()
    }
}

impl<K, V> PartialEq for Snapshot<K, V>
where
    K: Field,
    V: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
