//! Call arguments and callback tokens.
//!
//! Functions cannot cross the message boundary. On the client a function
//! argument is registered locally and replaced by a `{"callback": id}` token;
//! on the server the token is turned back into a [`Callback`] that posts a
//! CALLBACK_INVOKE envelope when called.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::identifiers::CallbackId;

// ============================================================================
// Constants
// ============================================================================

/// Key of a callback token object.
pub const CALLBACK_TOKEN_KEY: &str = "callback";

// ============================================================================
// Callback
// ============================================================================

/// Function invoked with the arguments delivered by a CALLBACK_INVOKE.
pub type ClientCallback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Server-side handle for a function argument.
///
/// Calling it forwards the (sanitized) arguments to whoever registered the
/// original function.
#[derive(Clone)]
pub struct Callback {
    id: CallbackId,
    sink: Arc<dyn Fn(Vec<Value>) + Send + Sync>,
}

impl Callback {
    /// Creates a callback around a delivery function.
    pub fn new(id: CallbackId, sink: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self {
            id,
            sink: Arc::new(sink),
        }
    }

    /// Returns the token id this callback stands for.
    #[inline]
    #[must_use]
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Invokes the callback.
    ///
    /// Nested [`HostValue::Function`] values are replaced with an inert
    /// marker before delivery.
    pub fn invoke(&self, args: Vec<HostValue>) {
        let safe = args.iter().map(HostValue::sanitize).collect();
        (self.sink)(safe);
    }

    /// Invokes the callback with plain JSON arguments.
    pub fn invoke_json(&self, args: Vec<Value>) {
        (self.sink)(args);
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// CallArg
// ============================================================================

/// A client-side call argument.
#[derive(Clone)]
pub enum CallArg {
    /// Plain JSON value, sent as is.
    Value(Value),
    /// Function argument, replaced by a callback token on the wire.
    Callback(ClientCallback),
}

impl CallArg {
    /// Wraps a function as a callback argument.
    pub fn callback(f: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// Returns `true` if this argument is a function.
    #[inline]
    #[must_use]
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }
}

impl fmt::Debug for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Conversion used by the [`args!`](crate::args) macro.
pub trait IntoCallArg {
    /// Converts into a call argument.
    fn into_call_arg(self) -> CallArg;
}

impl IntoCallArg for CallArg {
    fn into_call_arg(self) -> CallArg {
        self
    }
}

impl<T: Serialize> IntoCallArg for T {
    /// Serializes the value; values that do not map to JSON become `null`.
    fn into_call_arg(self) -> CallArg {
        CallArg::Value(serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

/// Builds a `Vec<CallArg>` from serializable values and [`CallArg`]s.
///
/// ```ignore
/// let args = args![["id", "name"], "Section", "", 100, true];
/// let args = args!["job", CallArg::callback(|progress| println!("{progress:?}"))];
/// ```
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::CallArg>::new() };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::protocol::IntoCallArg::into_call_arg($arg)),+]
    };
}

// ============================================================================
// Tokens
// ============================================================================

/// Builds the wire token for a callback id.
#[must_use]
pub fn callback_token(id: CallbackId) -> Value {
    json!({ "callback": id.as_u64() })
}

/// Recognizes a callback token.
///
/// A token is an object whose `callback` member is a positive integer.
#[must_use]
pub fn parse_callback_token(value: &Value) -> Option<CallbackId> {
    value
        .as_object()?
        .get(CALLBACK_TOKEN_KEY)?
        .as_u64()
        .filter(|id| *id > 0)
        .map(CallbackId::new)
}

// ============================================================================
// HostValue
// ============================================================================

/// A value produced by host code, which may contain functions.
///
/// Only the JSON parts can be delivered to the other side; see
/// [`HostValue::sanitize`].
#[derive(Clone)]
pub enum HostValue {
    /// Plain JSON.
    Json(Value),
    /// A host function.
    Function(Arc<dyn Fn(Vec<Value>) + Send + Sync>),
    /// Array possibly holding functions.
    Array(Vec<HostValue>),
    /// Object possibly holding functions.
    Object(Vec<(String, HostValue)>),
}

impl HostValue {
    /// Marker substituted for functions.
    #[must_use]
    pub fn function_marker() -> Value {
        json!({ "__type": "function", "note": "omitted" })
    }

    /// Copies the value into plain JSON, replacing every function.
    #[must_use]
    pub fn sanitize(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Function(_) => Self::function_marker(),
            Self::Array(items) => Value::Array(items.iter().map(Self::sanitize).collect()),
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.sanitize()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Object(entries) => f.debug_tuple("Object").field(entries).finish(),
        }
    }
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

// ============================================================================
// Tests
// ============================================================================
