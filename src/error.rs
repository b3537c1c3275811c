//! Error types for the bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use lcap_bridge::{Result, Error};
//!
//! async fn example(client: &PopupClient) -> Result<()> {
//!     let rows = client.call("_RB.selectQuery", args![["id"], "Section"]).await?;
//!     println!("{rows}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidOrigin`] |
//! | Connection | [`Error::PopupBlocked`], [`Error::NotConnected`], [`Error::ConnectionClosed`] |
//! | Timing | [`Error::CallTimeout`], [`Error::ReadyTimeout`], [`Error::ReadyCancelled`] |
//! | Protocol | [`Error::Protocol`] |
//! | Validation (server) | [`Error::MissingName`], [`Error::NameNotAllowed`], [`Error::NotAFunction`], [`Error::HandshakeRequired`], [`Error::StaleNonce`] |
//! | Execution | [`Error::Execution`], [`Error::Remote`] |
//! | External | [`Error::Json`], [`Error::Url`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Server-side variants are rendered with `Display` and travel to the client
/// as the `error` string of a RESULT envelope, where they surface as
/// [`Error::Remote`].
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when bridge or listener configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Origin string could not be normalized.
    #[error("Invalid origin: {origin}")]
    InvalidOrigin {
        /// The rejected origin.
        origin: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The platform refused to open the popup.
    ///
    /// Needs a fresh user gesture.
    #[error("Popup blocked. Trigger from a user click.")]
    PopupBlocked,

    /// A call was issued with no live context.
    #[error("Not connected. Click Connect or let auto-attach run.")]
    NotConnected,

    /// The remote context went away while a call was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Timing Errors
    // ========================================================================
    /// No RESULT arrived within the call budget.
    #[error("RPC timeout for '{name}' after {timeout_ms}ms")]
    CallTimeout {
        /// Fully qualified name of the call.
        name: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// No READY arrived within the wait budget.
    #[error("Timed out waiting for LCAP_READY after {timeout_ms}ms")]
    ReadyTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The READY wait was abandoned before READY arrived.
    #[error("Wait for LCAP_READY cancelled")]
    ReadyCancelled,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or foreign envelope.
    ///
    /// Never surfaced to callers; inbound traffic that fails to parse is
    /// dropped.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Validation Errors (server side)
    // ========================================================================
    /// CALL without a usable `name`.
    #[error("RPC missing \"name\"")]
    MissingName,

    /// CALL naming something outside the allow-list.
    #[error("RPC name must start with/equals one of: {roots}")]
    NameNotAllowed {
        /// Rejected name.
        name: String,
        /// Comma-separated allow-listed roots.
        roots: String,
    },

    /// Name resolved to nothing callable.
    #[error("Not a function: {name}")]
    NotAFunction {
        /// Name that failed to resolve.
        name: String,
    },

    /// CALL arrived before any HELLO armed the listener.
    #[error("RPC rejected: no handshake yet")]
    HandshakeRequired,

    /// CALL nonce does not match the active handshake.
    #[error("RPC rejected: stale or missing nonce")]
    StaleNonce,

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// The resolved function failed.
    #[error("{message}")]
    Execution {
        /// Message forwarded to the caller.
        message: String,
    },

    /// The server answered a call with `ok: false`.
    #[error("{message}")]
    Remote {
        /// Error string from the RESULT envelope.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid origin error.
    #[inline]
    pub fn invalid_origin(origin: impl Into<String>) -> Self {
        Self::InvalidOrigin {
            origin: origin.into(),
        }
    }

    /// Creates a call timeout error.
    #[inline]
    pub fn call_timeout(name: impl Into<String>, timeout_ms: u64) -> Self {
        Self::CallTimeout {
            name: name.into(),
            timeout_ms,
        }
    }

    /// Creates a ready timeout error.
    #[inline]
    pub fn ready_timeout(timeout_ms: u64) -> Self {
        Self::ReadyTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a name not allowed error.
    #[inline]
    pub fn name_not_allowed(name: impl Into<String>, roots: impl Into<String>) -> Self {
        Self::NameNotAllowed {
            name: name.into(),
            roots: roots.into(),
        }
    }

    /// Creates a not a function error.
    #[inline]
    pub fn not_a_function(name: impl Into<String>) -> Self {
        Self::NotAFunction { name: name.into() }
    }

    /// Creates an execution error.
    ///
    /// Registered functions return this to report a failure to the caller.
    #[inline]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CallTimeout { .. } | Self::ReadyTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::PopupBlocked | Self::NotConnected | Self::ConnectionClosed
        )
    }

    /// Returns `true` if the server rejected the call before executing it.
    #[inline]
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::MissingName
                | Self::NameNotAllowed { .. }
                | Self::NotAFunction { .. }
                | Self::HandshakeRequired
                | Self::StaleNonce
        )
    }

    /// Returns `true` if a fresh user gesture is required to recover.
    #[inline]
    #[must_use]
    pub fn needs_user_gesture(&self) -> bool {
        matches!(self, Self::PopupBlocked | Self::NotConnected)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::call_timeout("_RB.selectQuery", 3_600_000);
        assert_eq!(
            err.to_string(),
            "RPC timeout for '_RB.selectQuery' after 3600000ms"
        );
    }

    #[test]
    fn test_validation_messages() {
        assert_eq!(Error::MissingName.to_string(), "RPC missing \"name\"");
        assert_eq!(
            Error::not_a_function("_RB.version").to_string(),
            "Not a function: _RB.version"
        );
        assert_eq!(
            Error::name_not_allowed("evil", "_RB, rbf_getViewPage").to_string(),
            "RPC name must start with/equals one of: _RB, rbf_getViewPage"
        );
    }

    #[test]
    fn test_execution_forwards_message_only() {
        let err = Error::execution("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::ready_timeout(1200).is_timeout());
        assert!(Error::call_timeout("x", 1).is_timeout());
        assert!(!Error::NotConnected.is_timeout());
        assert!(!Error::ReadyCancelled.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::PopupBlocked.is_connection_error());
        assert!(Error::NotConnected.is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::config("x").is_connection_error());
    }

    #[test]
    fn test_is_validation_error() {
        assert!(Error::MissingName.is_validation_error());
        assert!(Error::StaleNonce.is_validation_error());
        assert!(!Error::execution("x").is_validation_error());
    }

    #[test]
    fn test_needs_user_gesture() {
        assert!(Error::PopupBlocked.needs_user_gesture());
        assert!(!Error::ready_timeout(1).needs_user_gesture());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_from_url_error() {
        let url_err = url::Url::parse("not a url").unwrap_err();
        let err: Error = url_err.into();
        assert!(matches!(err, Error::Url(_)));
    }
}
