//! Client end of the bridge.
//!
//! Runs in the unprivileged client tab and reaches the platform window
//! through `postMessage`-style handles only.
//!
//! # Lifecycle
//!
//! ```text
//! PopupClient::initialize ──► (auto-attach) ──► connect_from_click ──► READY
//!                                                                       │
//!                                       call(name, args) ◄──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `callbacks` | Bounded registry of function arguments |
//! | `config` | [`BridgeConfig`] and its builder |
//! | `dispatch` | Bridge or in-process routing |
//! | `persistence` | Reload-surviving markers and the connect workflow |
//! | `popup` | [`PopupClient`] |
//! | `ready` | [`ReadinessWaiter`] |
//! | `session` | Per-tab shared state |

// ============================================================================
// Submodules
// ============================================================================

mod callbacks;

/// Client configuration.
pub mod config;

/// Bridge or in-process routing.
pub mod dispatch;

/// Reload-surviving markers and the connect workflow.
pub mod persistence;

/// Popup client.
pub mod popup;

/// Readiness waiting.
pub mod ready;

mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use dispatch::Dispatcher;
pub use persistence::{Connector, ResumeOutcome, SessionMemory};
pub use popup::PopupClient;
pub use ready::{DEFAULT_READY_TIMEOUT, ReadinessWaiter};
pub use session::NONCE_STORAGE_KEY;
