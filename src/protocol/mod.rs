//! Bridge protocol message types.
//!
//! This module defines the message format exchanged between the client tab
//! (local end) and the privileged server context (remote end).
//!
//! # Protocol Overview
//!
//! | Envelope | Direction | Purpose |
//! |----------|-----------|---------|
//! | `LCAP_HELLO` | Client → Server | Arm the listener with the tab nonce |
//! | `LCAP_READY` | Server → Client | Acknowledge the handshake |
//! | `LCAP_RPC` | Client → Server | Call an allow-listed function |
//! | `LCAP_RPC_RESULT` | Server → Client | Settle a call by id |
//! | `LCAP_RPC_CB` | Server → Client | Invoke a function argument |
//!
//! # Call Naming
//!
//! Calls use dotted names rooted at an allow-listed global:
//!
//! - `_RB.selectQuery`
//! - `rbf_getViewPage`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `argument` | Call arguments, callback tokens, sanitizing |
//! | `envelope` | Wire envelopes |

// ============================================================================
// Submodules
// ============================================================================

/// Call arguments and callback tokens.
pub mod argument;

/// Wire envelopes.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use argument::{
    CALLBACK_TOKEN_KEY, CallArg, Callback, ClientCallback, HostValue, IntoCallArg,
    callback_token, parse_callback_token,
};
pub use envelope::{
    CallMessage, CallbackMessage, DEFAULT_ROOT, Envelope, ResultMessage, is_call, root_of,
    type_of,
};
