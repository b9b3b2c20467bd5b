//! The mutable store.
//!
//! A [`Store`] has two faces:
//!
//! - the **user section**: a map from string keys to values, plumbed
//!   through every machine transition. Cloning a store snapshots this map
//!   (values are `Arc`-shared, so snapshots are cheap and isolated).
//! - the **reserved section**: a typed control cell shared by all
//!   snapshots of one run. It holds the one-shot continuation registry
//!   and named slots for runtime subsystems (the scheduler keeps its task
//!   queue, registry and waiter map here). Only the owning handlers touch
//!   a reserved slot; user code never sees it.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::ids::ContinuationId;
use crate::values::Value;

/// Shared per-run control state.
#[derive(Default)]
struct ControlCell {
    /// IDs of continuations that have been resumed. Grows monotonically
    /// within a run.
    consumed: Mutex<HashSet<ContinuationId>>,
    /// Named runtime slots, keyed by reserved names.
    reserved: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

/// The machine store.
#[derive(Clone, Default)]
pub struct Store {
    user: HashMap<String, Value>,
    ctl: Arc<ControlCell>,
}

impl Store {
    /// An empty store with a fresh control cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from user key/value pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self { user: pairs.into_iter().collect(), ctl: Arc::default() }
    }

    // -- user section -----------------------------------------------------

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.user.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.user.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.user.remove(key)
    }

    pub fn len(&self) -> usize {
        self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.user.iter()
    }

    /// Snapshot the user section; the control cell stays shared.
    pub fn snapshot(&self) -> Store {
        self.clone()
    }

    /// True when two stores belong to the same run.
    pub fn same_run(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.ctl, &other.ctl)
    }

    // -- one-shot registry ------------------------------------------------

    /// Mark a continuation consumed. Returns `false` if it already was.
    pub fn mark_consumed(&self, id: ContinuationId) -> bool {
        self.ctl.consumed.lock().expect("one-shot registry lock").insert(id)
    }

    pub fn is_consumed(&self, id: ContinuationId) -> bool {
        self.ctl.consumed.lock().expect("one-shot registry lock").contains(&id)
    }

    // -- reserved section -------------------------------------------------

    /// Fetch the reserved slot named `key`, initializing it with `init` on
    /// first access. The slot is shared by every snapshot of this run.
    pub fn reserved_slot<T, F>(&self, key: &'static str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut slots = self.ctl.reserved.lock().expect("reserved slot lock");
        let entry = slots
            .entry(key)
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);
        Arc::clone(entry)
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("reserved slot {key:?} holds a different type"))
    }

    /// Fetch the reserved slot named `key` if it exists.
    pub fn try_reserved_slot<T: Any + Send + Sync>(&self, key: &'static str) -> Option<Arc<T>> {
        let slots = self.ctl.reserved.lock().expect("reserved slot lock");
        slots.get(key).cloned()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The reserved section is intentionally opaque here.
        f.debug_map().entries(self.user.iter()).finish()
    }
}
