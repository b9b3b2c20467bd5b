//! Identity types for the interpreter.
//!
//! Tasks, handles, continuations, and handler scopes are identified by
//! opaque `u64` newtypes minted from global atomic counters, so IDs are
//! unique for the lifetime of the process. Externally visible promise IDs
//! are UUIDs because foreign producers (I/O threads, an async runtime)
//! carry them across thread boundaries and back through the completion
//! queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! counter_id {
    ($(#[$doc:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Allocate the next unique ID.
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Return the raw numeric value (useful for logging / tracing).
            pub fn as_u64(self) -> u64 {
                self.0
            }

            /// Rebuild an ID from its raw value. Only for plumbing IDs
            /// through value-typed channels; never mints new identity.
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// Identifier of a scheduler task.
    TaskId,
    NEXT_TASK_ID,
    "task"
);

counter_id!(
    /// Identifier of a task or promise handle in the scheduler registry.
    HandleId,
    NEXT_HANDLE_ID,
    "handle"
);

counter_id!(
    /// Identifier of a first-class continuation, used by the one-shot
    /// registry.
    ContinuationId,
    NEXT_CONTINUATION_ID,
    "cont"
);

counter_id!(
    /// Identifier of a handler scope (a `WithHandler` frame).
    ScopeId,
    NEXT_SCOPE_ID,
    "scope"
);

/// Identifier of an external promise, shared with foreign completion
/// producers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalPromiseId(Uuid);

impl ExternalPromiseId {
    /// Allocate a fresh random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExternalPromiseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExternalPromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExternalPromiseId({})", self.0)
    }
}

impl fmt::Display for ExternalPromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_ids_are_unique_and_increasing() {
        let a = TaskId::next();
        let b = TaskId::next();
        let c = TaskId::next();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a.as_u64() < b.as_u64());
        assert!(b.as_u64() < c.as_u64());
    }

    #[test]
    fn id_families_are_independent() {
        // Exhausting one family must not advance another.
        let t = TaskId::next().as_u64();
        let _ = HandleId::next();
        let _ = HandleId::next();
        assert_eq!(TaskId::next().as_u64(), t + 1);
    }

    #[test]
    fn display_and_debug_formats() {
        let id = ContinuationId::next();
        assert!(format!("{id}").starts_with("cont:"));
        assert!(format!("{id:?}").starts_with("ContinuationId("));
    }

    #[test]
    fn external_promise_ids_are_random() {
        let a = ExternalPromiseId::new();
        let b = ExternalPromiseId::new();
        assert_ne!(a, b);
    }
}
