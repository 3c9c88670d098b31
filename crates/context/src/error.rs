//! Error types for container operations.

use std::fmt;

use thiserror::Error;

/// The container operation being attempted, as reported to hooks and error
/// messages.
///
/// `run` never appears here: it opens a scope unconditionally and cannot miss
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`ContextContainer::with`](crate::ContextContainer::with)
    With,
    /// [`ContextContainer::get`](crate::ContextContainer::get)
    Get,
    /// [`ContextContainer::require`](crate::ContextContainer::require)
    Require,
    /// [`ContextContainer::set`](crate::ContextContainer::set)
    Set,
    /// [`ContextContainer::snapshot`](crate::ContextContainer::snapshot)
    Snapshot,
    /// [`ContextContainer::bind`](crate::ContextContainer::bind)
    Bind,
}

impl Op {
    /// Stable lowercase name, as used in error messages and hook payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Op::With => "with",
            Op::Get => "get",
            Op::Require => "require",
            Op::Set => "set",
            Op::Snapshot => "snapshot",
            Op::Bind => "bind",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by container operations.
///
/// Both kinds are returned as values, never panicked; the container reports
/// each through the `on_error` hook exactly once before handing it back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// No scope was active where one was required: strict-mode
    /// `get`/`set`/`with`/`snapshot`/`bind`, or `require` in any mode.
    #[error("no active context scope for `{0}`")]
    MissingContext(Op),

    /// `require` was called on a key the active scope's mapping does not
    /// hold. The key is rendered through its `Display` impl.
    #[error("context key `{0}` is not set")]
    MissingKey(String),
}

impl ContextError {
    /// Whether this is the missing-scope kind.
    pub const fn is_missing_context(&self) -> bool {
        matches!(self, ContextError::MissingContext(_))
    }

    /// Whether this is the unset-key kind.
    pub const fn is_missing_key(&self) -> bool {
        matches!(self, ContextError::MissingKey(_))
    }
}
