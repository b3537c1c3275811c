//! LCAP Bridge - Cross-window RPC between a client page and a privileged
//! platform window.
//!
//! A development page running on its own origin cannot call into the
//! platform's JavaScript API directly. This library opens (or re-attaches to)
//! a named platform window and tunnels calls to it over `postMessage`-style
//! messaging.
//!
//! # Architecture
//!
//! The bridge follows a client-server model:
//!
//! - **Client End** ([`PopupClient`]): opens the platform window, performs
//!   the HELLO/READY handshake, issues correlated calls
//! - **Server End** ([`ServerListener`]): accepts one trusted origin,
//!   validates calls against an allow-list, runs them from a
//!   [`FunctionRegistry`] and posts back results
//!
//! Key design principles:
//!
//! - Every send names an exact target origin; every receive checks the exact
//!   sender origin
//! - A per-tab nonce ties calls to the latest handshake
//! - Calls are correlated by id, never by arrival order
//! - Function arguments travel as `{"callback": id}` tokens
//!
//! # Quick Start
//!
//! ```ignore
//! use lcap_bridge::{BridgeConfig, Browser, FunctionRegistry, PopupClient, ServerListener, args};
//!
//! #[tokio::main]
//! async fn main() -> lcap_bridge::Result<()> {
//!     let browser = Browser::new();
//!
//!     // Platform side
//!     let mut registry = FunctionRegistry::new();
//!     registry.register_sync("_RB.selectQuery", |_| Ok(serde_json::json!([])));
//!     let listener = ServerListener::builder()
//!         .trusted_origin("http://localhost:3000")
//!         .allow("_RB")
//!         .registry(registry)
//!         .build()?;
//!     browser.on_page_load("https://platform.example.com", move |page| {
//!         listener.install(page);
//!     })?;
//!
//!     // Client side
//!     let tab = browser.open_tab("http://localhost:3000/")?;
//!     let config = BridgeConfig::builder()
//!         .platform_url("https://platform.example.com/main.jsp")
//!         .build()?;
//!     let client = PopupClient::initialize(&tab, config);
//!     tab.with_user_gesture(|g| client.connect_from_click(g))?;
//!
//!     let rows = client
//!         .call("_RB.selectQuery", args![["id", "name"], "Section", "", 100, true])
//!         .await?;
//!     println!("{rows}");
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`PopupClient`], readiness, persistence, dispatch |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire envelopes and call arguments |
//! | [`server`] | [`ServerListener`] and [`FunctionRegistry`] |
//! | [`transport`] | Browsing contexts and message passing |

// ============================================================================
// Modules
// ============================================================================

/// Client end: popup bridge, readiness and persistence.
///
/// - [`PopupClient`] - handshake and calls
/// - [`ReadinessWaiter`] - coalesced READY waits
/// - [`Connector`] - connect, proceed and resume workflow
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for bridge entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire protocol message types.
pub mod protocol;

/// Server end: listener, allow-list and function registry.
pub mod server;

/// Browsing contexts, windows and message delivery.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    BridgeConfig, BridgeConfigBuilder, Connector, Dispatcher, PopupClient, ReadinessWaiter,
    ResumeOutcome, SessionMemory,
};

// Server types
pub use server::{
    AllowList, Argument, FunctionRegistry, HandshakeState, Invocation, ListenerHandle,
    RemoteFunction, ServerConfig, ServerListener, ServerListenerBuilder,
};

// Protocol types
pub use protocol::{CallArg, Callback, Envelope, HostValue};

// Transport types
pub use transport::{Browser, BrowsingContext, Origin, PopupPolicy, UserGesture, WindowHandle};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CallId, CallbackId, ListenerId, Nonce};
