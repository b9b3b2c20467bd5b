//! Runtime values.
//!
//! Collection variants are wrapped in `Arc` for cheap cloning by reference
//! count; a store snapshot therefore copies map structure, never payloads.
//! Besides plain data, `Value` carries the opaque runtime handles that
//! handlers and user programs exchange: task and promise handles, external
//! promises, reified continuations, and handler snapshots.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::RuntimeError;
use crate::external::ExternalPromise;
use crate::frame::Continuation;
use crate::handler::HandlerSnapshot;
use crate::ids::HandleId;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A reference to a spawned task, returned by `Spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub handle: HandleId,
}

/// A reference to a promise created by `CreatePromise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseHandle {
    pub handle: HandleId,
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Tuple(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    /// An `Ok`/`Err` sum, produced by the `Safe` pattern.
    Outcome(Arc<Result<Value, RuntimeError>>),
    Task(TaskHandle),
    Promise(PromiseHandle),
    External(ExternalPromise),
    Continuation(Continuation),
    Handlers(HandlerSnapshot),
    /// An opaque payload threaded through effect results by the runtime
    /// (e.g. a dequeued task entry). Not constructible from user data.
    Opaque(OpaqueValue),
}

impl Value {
    // -- constructors -----------------------------------------------------

    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(items))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Arc::new(entries))
    }

    /// Wrap a success value as an `Outcome`.
    pub fn ok(v: Value) -> Self {
        Value::Outcome(Arc::new(Ok(v)))
    }

    /// Wrap an error as an `Outcome`.
    pub fn err(e: RuntimeError) -> Self {
        Value::Outcome(Arc::new(Err(e)))
    }

    // -- accessors --------------------------------------------------------

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<TaskHandle> {
        match self {
            Value::Task(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_outcome(&self) -> Option<&Result<Value, RuntimeError>> {
        match self {
            Value::Outcome(r) => Some(r),
            _ => None,
        }
    }

    /// The handle a `Wait` can suspend on, if this value is waitable.
    pub fn waitable_handle(&self) -> Option<HandleId> {
        match self {
            Value::Task(t) => Some(t.handle),
            Value::Promise(p) => Some(p.handle),
            Value::External(e) => Some(e.handle()),
            _ => None,
        }
    }

    // -- JSON bridging ----------------------------------------------------

    /// Render this value as JSON. Runtime handles are rendered as tagged
    /// strings; they do not survive a round trip.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(n) => json!(n),
            Value::Float(f) => json!(f),
            Value::Str(s) => json!(&**s),
            Value::List(items) | Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Outcome(r) => match &**r {
                Ok(v) => json!({ "ok": v.to_json() }),
                Err(e) => json!({ "err": e.to_string() }),
            },
            Value::Task(t) => json!(format!("<{}>", t.handle)),
            Value::Promise(p) => json!(format!("<{}>", p.handle)),
            Value::External(e) => json!(format!("<{}>", e.id())),
            Value::Continuation(c) => json!(format!("<{}>", c.id())),
            Value::Handlers(h) => json!(format!("<handlers:{}>", h.len())),
            Value::Opaque(o) => json!(format!("<opaque:{}>", o.name())),
        }
    }

    /// Convert plain JSON data into a value.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::str(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::map(
                entries.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Outcome(a), Value::Outcome(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) => a == b,
            (Value::External(a), Value::External(b)) => a.id() == b.id(),
            (Value::Continuation(a), Value::Continuation(b)) => a.id() == b.id(),
            (Value::Handlers(a), Value::Handlers(b)) => a.scope_ids() == b.scope_ids(),
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(&a.slot, &b.slot),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Value::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Value::Outcome(r) => f.debug_tuple("Outcome").field(r).finish(),
            Value::Task(t) => write!(f, "Task({})", t.handle),
            Value::Promise(p) => write!(f, "Promise({})", p.handle),
            Value::External(e) => write!(f, "External({})", e.id()),
            Value::Continuation(c) => write!(f, "Continuation({})", c.id()),
            Value::Handlers(h) => write!(f, "Handlers(len={})", h.len()),
            Value::Opaque(o) => write!(f, "Opaque({})", o.name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::str(s)
    }
}

// ---------------------------------------------------------------------------
// OpaqueValue
// ---------------------------------------------------------------------------

/// A named, take-once opaque payload.
///
/// The runtime uses this to pass non-`Value` data (dequeued task entries)
/// through the effect result channel. The payload can be taken exactly
/// once; clones share the slot.
#[derive(Clone)]
pub struct OpaqueValue {
    name: &'static str,
    slot: Arc<Mutex<Option<Box<dyn Any + Send>>>>,
}

impl OpaqueValue {
    pub fn new<T: Any + Send>(name: &'static str, payload: T) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(Some(Box::new(payload)))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take the payload out, if it is present and of the expected type.
    pub fn take<T: Any>(&self) -> Option<Box<T>> {
        let mut slot = self.slot.lock().ok()?;
        match slot.take() {
            Some(boxed) if boxed.is::<T>() => boxed.downcast::<T>().ok(),
            Some(other) => {
                // Wrong type requested: put it back untouched.
                *slot = Some(other);
                None
            }
            None => None,
        }
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueValue({})", self.name)
    }
}
