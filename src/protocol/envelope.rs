//! Wire envelopes exchanged between the client tab and the server context.
//!
//! # Format
//!
//! Every envelope is a JSON object tagged by `type`:
//!
//! ```json
//! { "type": "LCAP_HELLO", "nonce": "..." }
//! { "type": "LCAP_READY", "nonce": "..." }
//! { "type": "LCAP_RPC", "id": 1, "root": "_RB", "name": "_RB.selectQuery", "args": [], "nonce": "..." }
//! { "type": "LCAP_RPC_RESULT", "id": 1, "ok": true, "result": [], "nonce": "..." }
//! { "type": "LCAP_RPC_CB", "id": 1, "callback": 7, "args": [], "nonce": "..." }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{CallId, CallbackId, Nonce};

// ============================================================================
// Constants
// ============================================================================

/// Type tag of the handshake request.
pub const HELLO_TYPE: &str = "LCAP_HELLO";

/// Type tag of the handshake reply.
pub const READY_TYPE: &str = "LCAP_READY";

/// Type tag of a call.
pub const CALL_TYPE: &str = "LCAP_RPC";

/// Legacy call tag still accepted on receive.
pub const LEGACY_CALL_TYPE: &str = "LCAP_RPC_CALL";

/// Type tag of a call result.
pub const RESULT_TYPE: &str = "LCAP_RPC_RESULT";

/// Type tag of a callback invocation.
pub const CALLBACK_TYPE: &str = "LCAP_RPC_CB";

/// Root used when a call name has no dotted segment.
pub const DEFAULT_ROOT: &str = "_RB";

// ============================================================================
// Envelope
// ============================================================================

/// Tagged union of every message the bridge puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Client → server handshake carrying the tab nonce.
    #[serde(rename = "LCAP_HELLO")]
    Hello {
        /// Nonce the server should arm with.
        nonce: Nonce,
    },

    /// Server → client handshake acknowledgement.
    #[serde(rename = "LCAP_READY")]
    Ready {
        /// Echo of the armed nonce.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<Nonce>,
    },

    /// Client → server call.
    #[serde(rename = "LCAP_RPC", alias = "LCAP_RPC_CALL")]
    Call(CallMessage),

    /// Server → client result.
    #[serde(rename = "LCAP_RPC_RESULT")]
    Result(ResultMessage),

    /// Server → client callback invocation.
    #[serde(rename = "LCAP_RPC_CB")]
    CallbackInvoke(CallbackMessage),
}

impl Envelope {
    /// Parses an inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for anything that is not a bridge envelope.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::protocol("message is not an object"));
        }
        Self::deserialize(value).map_err(|e| Error::protocol(e.to_string()))
    }

    /// Serializes the envelope for posting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if a payload value cannot be serialized.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Returns the nonce carried by the envelope, if any.
    #[must_use]
    pub fn nonce(&self) -> Option<&Nonce> {
        match self {
            Self::Hello { nonce } => Some(nonce),
            Self::Ready { nonce } => nonce.as_ref(),
            Self::Call(call) => call.nonce.as_ref(),
            Self::Result(result) => result.nonce.as_ref(),
            Self::CallbackInvoke(callback) => callback.nonce.as_ref(),
        }
    }

    /// Returns the wire type tag.
    #[must_use]
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Hello { .. } => HELLO_TYPE,
            Self::Ready { .. } => READY_TYPE,
            Self::Call(_) => CALL_TYPE,
            Self::Result(_) => RESULT_TYPE,
            Self::CallbackInvoke(_) => CALLBACK_TYPE,
        }
    }
}

/// Returns the `type` tag of a raw message without fully parsing it.
#[must_use]
pub fn type_of(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Returns `true` if the raw message claims to be a call.
#[must_use]
pub fn is_call(value: &Value) -> bool {
    matches!(type_of(value), Some(CALL_TYPE | LEGACY_CALL_TYPE))
}

// ============================================================================
// CallMessage
// ============================================================================

/// Body of a CALL envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    /// Correlation id.
    pub id: CallId,

    /// Leading dotted segment of `name`.
    #[serde(default)]
    pub root: String,

    /// Fully qualified callable name.
    #[serde(default)]
    pub name: String,

    /// Arguments; function arguments appear as `{"callback": id}` tokens.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Tab nonce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Nonce>,
}

impl CallMessage {
    /// Creates a call, deriving `root` from `name`.
    #[must_use]
    pub fn new(id: CallId, name: impl Into<String>, args: Vec<Value>, nonce: Nonce) -> Self {
        let name = name.into();
        Self {
            id,
            root: root_of(&name).to_string(),
            name,
            args,
            nonce: Some(nonce),
        }
    }
}

/// Derives the allow-list root of a call name.
///
/// Dotted names yield their first segment; bare names yield [`DEFAULT_ROOT`].
#[must_use]
pub fn root_of(name: &str) -> &str {
    match name.split_once('.') {
        Some((root, _)) => root,
        None => DEFAULT_ROOT,
    }
}

// ============================================================================
// ResultMessage
// ============================================================================

/// Body of a RESULT envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Id of the call being answered, `null` when it could not be determined.
    pub id: Option<CallId>,

    /// Whether the call succeeded.
    pub ok: bool,

    /// Return value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Armed nonce of the replying listener.
    #[serde(default)]
    pub nonce: Option<Nonce>,
}

impl ResultMessage {
    /// Creates a success result.
    #[must_use]
    pub fn success(id: CallId, result: Value, nonce: Option<Nonce>) -> Self {
        Self {
            id: Some(id),
            ok: true,
            result: Some(result),
            error: None,
            nonce,
        }
    }

    /// Creates a failure result.
    #[must_use]
    pub fn failure(id: Option<CallId>, error: impl Into<String>, nonce: Option<Nonce>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
            nonce,
        }
    }

    /// Converts into the settled value of the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] carrying the server message when `ok` is false.
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            let message = self
                .error
                .unwrap_or_else(|| "remote call failed".to_string());
            Err(Error::remote(message))
        }
    }
}

// ============================================================================
// CallbackMessage
// ============================================================================

/// Body of a CALLBACK_INVOKE envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMessage {
    /// Id of the call whose argument is being invoked.
    pub id: CallId,

    /// Callback token id.
    pub callback: CallbackId,

    /// Sanitized invocation arguments.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Nonce of the call that carried the token.
    #[serde(default)]
    pub nonce: Option<Nonce>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_hello_wire_format() {
        let hello = Envelope::Hello {
            nonce: Nonce::from("n1"),
        };
        let value = hello.to_value().expect("serialize");
        assert_eq!(value, json!({"type": "LCAP_HELLO", "nonce": "n1"}));
    }

    #[test]
    fn test_call_wire_format() {
        let call = CallMessage::new(
            CallId::new(3),
            "_RB.selectQuery",
            vec![json!(["id", "name"]), json!({"callback": 1})],
            Nonce::from("n1"),
        );
        let value = Envelope::Call(call).to_value().expect("serialize");
        assert_eq!(value["type"], "LCAP_RPC");
        assert_eq!(value["id"], 3);
        assert_eq!(value["root"], "_RB");
        assert_eq!(value["args"][1]["callback"], 1);
    }

    #[test]
    fn test_legacy_call_tag_accepted() {
        let raw = json!({"type": "LCAP_RPC_CALL", "id": 1, "name": "foo"});
        let envelope = Envelope::from_value(&raw).expect("parse");
        assert!(matches!(envelope, Envelope::Call(ref c) if c.name == "foo"));
        assert!(is_call(&raw));
    }

    #[test]
    fn test_call_missing_name_defaults_empty() {
        let raw = json!({"type": "LCAP_RPC", "id": 9});
        let Envelope::Call(call) = Envelope::from_value(&raw).expect("parse") else {
            panic!("expected call");
        };
        assert!(call.name.is_empty());
        assert!(call.args.is_empty());
        assert!(call.nonce.is_none());
    }

    #[test]
    fn test_result_with_null_id() {
        let raw = json!({"type": "LCAP_RPC_RESULT", "id": null, "ok": false, "error": "x"});
        let Envelope::Result(result) = Envelope::from_value(&raw).expect("parse") else {
            panic!("expected result");
        };
        assert_eq!(result.id, None);
        assert_eq!(result.into_result().unwrap_err().to_string(), "x");
    }

    #[test]
    fn test_result_success_without_value_is_null() {
        let raw = json!({"type": "LCAP_RPC_RESULT", "id": 2, "ok": true});
        let Envelope::Result(result) = Envelope::from_value(&raw).expect("parse") else {
            panic!("expected result");
        };
        assert_eq!(result.into_result().expect("ok"), Value::Null);
    }

    #[test]
    fn test_ready_without_nonce() {
        let envelope = Envelope::from_value(&json!({"type": "LCAP_READY"})).expect("parse");
        assert_eq!(envelope, Envelope::Ready { nonce: None });
        assert!(envelope.nonce().is_none());
    }

    #[test]
    fn test_foreign_messages_rejected() {
        assert!(Envelope::from_value(&json!("hello")).is_err());
        assert!(Envelope::from_value(&json!({"type": "webpackOk"})).is_err());
        assert!(Envelope::from_value(&json!({"source": "react-devtools"})).is_err());
    }

    #[test]
    fn test_root_of() {
        assert_eq!(root_of("_RB.selectQuery"), "_RB");
        assert_eq!(root_of("a.b.c"), "a");
        assert_eq!(root_of("rbf_getViewPage"), DEFAULT_ROOT);
    }

    #[test]
    fn test_callback_wire_format() {
        let message = CallbackMessage {
            id: CallId::new(4),
            callback: CallbackId::new(7),
            args: vec![json!("progress"), json!(50)],
            nonce: Some(Nonce::from("n1")),
        };
        let value = Envelope::CallbackInvoke(message).to_value().expect("serialize");
        assert_eq!(
            value,
            json!({"type": "LCAP_RPC_CB", "id": 4, "callback": 7, "args": ["progress", 50], "nonce": "n1"})
        );
    }
}
