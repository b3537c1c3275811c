//! Window handles, message events and user activation.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

// ============================================================================
// WindowHandle
// ============================================================================

/// A handle to another browsing context, as seen from the holder.
///
/// This is the only way one context can reach another: by posting a message
/// that the receiver's listeners observe asynchronously.
pub trait WindowHandle: Send + Sync {
    /// Posts a message to the window.
    ///
    /// The message is dropped unless the window's current origin equals
    /// `target_origin` (or `target_origin` is `"*"`). Posting to a closed
    /// window is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrigin`](crate::Error::InvalidOrigin) if
    /// `target_origin` is neither `"*"` nor a valid origin.
    fn post_message(&self, message: Value, target_origin: &str) -> Result<()>;

    /// Returns `true` once the window has been closed.
    fn is_closed(&self) -> bool;

    /// Returns the window name.
    fn name(&self) -> String;
}

impl fmt::Debug for dyn WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowHandle")
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// MessageEvent
// ============================================================================

/// A message delivered to a context's listeners.
#[derive(Clone)]
pub struct MessageEvent {
    /// Origin of the sending context at post time.
    pub origin: String,
    /// Posted payload.
    pub data: Value,
    /// Handle back to the sender, used to reply.
    pub source: Option<Arc<dyn WindowHandle>>,
}

impl MessageEvent {
    /// Creates an event with no reply handle.
    #[must_use]
    pub fn new(origin: impl Into<String>, data: Value) -> Self {
        Self {
            origin: origin.into(),
            data,
            source: None,
        }
    }

    /// Attaches a reply handle.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn WindowHandle>) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("origin", &self.origin)
            .field("data", &self.data)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

/// Message listener callback.
///
/// Runs on the receiving context's event loop; must not block.
pub type MessageListener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

// ============================================================================
// UserGesture
// ============================================================================

/// Proof of synchronous user activation.
///
/// Only obtainable inside
/// [`BrowsingContext::with_user_gesture`](super::BrowsingContext::with_user_gesture).
/// It is `!Send`, so it cannot be carried across an `.await` in a spawned
/// task, mirroring how popup blockers only honor activation during the input
/// event itself.
pub struct UserGesture {
    _not_send: PhantomData<*const ()>,
}

impl UserGesture {
    pub(crate) fn new() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for UserGesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserGesture")
    }
}
