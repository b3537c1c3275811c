//! Browsing-context transport layer.
//!
//! This module models the platform primitives the bridge is built on:
//! named windows, cross-context `postMessage`, popup blocking, tab-scoped
//! session storage and page reloads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Client tab     │        post_message          │  Platform popup │
//! │                 │─────────────────────────────►│                 │
//! │  PopupClient    │      (exact origin)          │  ServerListener │
//! │                 │◄─────────────────────────────│                 │
//! └─────────────────┘        event.source          └─────────────────┘
//! ```
//!
//! # Delivery Rules
//!
//! 1. A post names the origin it expects the receiver to have; on mismatch
//!    the message is silently dropped.
//! 2. Each context drains its inbound queue in order on its own event loop.
//! 3. Every delivered [`MessageEvent`] carries the sender's origin and a
//!    reply handle.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `browser` | Window table, popup policy, page loaders |
//! | `context` | Browsing context and event loop |
//! | `origin` | Origin normalization |
//! | `storage` | Session storage |
//! | `window` | Window handles, events, user gestures |

// ============================================================================
// Submodules
// ============================================================================

/// In-process browser hosting named contexts.
pub mod browser;

/// Browsing contexts and their event loop.
pub mod context;

/// Normalized origins.
pub mod origin;

/// Tab-scoped session storage.
pub mod storage;

/// Window handles, message events and user activation.
pub mod window;

// ============================================================================
// Re-exports
// ============================================================================

pub use browser::{Browser, PageLoader, PopupPolicy};
pub use context::BrowsingContext;
pub use origin::{ANY_ORIGIN, Origin};
pub use storage::SessionStorage;
pub use window::{MessageEvent, MessageListener, UserGesture, WindowHandle};
