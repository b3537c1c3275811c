//! Server end of the bridge.
//!
//! The privileged page installs a [`ServerListener`] on every load. It
//! answers HELLO with READY and executes allow-listed CALLs against a
//! [`FunctionRegistry`].
//!
//! # Validation Order
//!
//! | Step | Failure |
//! |------|---------|
//! | Trusted origin | dropped silently |
//! | Handshake armed | [`Error::HandshakeRequired`](crate::Error::HandshakeRequired) |
//! | Nonce matches | [`Error::StaleNonce`](crate::Error::StaleNonce) |
//! | Name present | [`Error::MissingName`](crate::Error::MissingName) |
//! | Name allow-listed | [`Error::NameNotAllowed`](crate::Error::NameNotAllowed) |
//! | Name is a function | [`Error::NotAFunction`](crate::Error::NotAFunction) |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `allow_list` | Permitted root names |
//! | `config` | Listener configuration |
//! | `listener` | Handshake and call dispatch |
//! | `registry` | Name → function table |

// ============================================================================
// Submodules
// ============================================================================

/// Permitted root names.
pub mod allow_list;

/// Listener configuration.
pub mod config;

/// Handshake and call dispatch.
pub mod listener;

/// Name → function table.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use allow_list::AllowList;
pub use config::ServerConfig;
pub use listener::{HandshakeState, ListenerHandle, ServerListener, ServerListenerBuilder};
pub use registry::{Argument, FunctionRegistry, Invocation, RemoteFunction};
