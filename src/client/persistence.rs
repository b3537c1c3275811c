//! Connection markers that survive a reload of the client tab.
//!
//! After a successful connect the tab remembers that the platform answered,
//! and from which origin. On the next load [`Connector::resume`] checks that
//! origin briefly instead of asking the user to click again.
//!
//! # Storage Keys
//!
//! | Key | Value | Set by |
//! |-----|-------|--------|
//! | `lcap.ready` | `"1"` | successful connect or resume |
//! | `lcap.origin` | platform origin | successful connect or resume |
//! | `lcap.proceeded` | `"1"` | [`Connector::proceed`] |
//!
//! Clearing the ready marker always clears the proceeded marker too.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::{BrowsingContext, Origin, UserGesture};

use super::popup::PopupClient;
use super::ready::{DEFAULT_READY_TIMEOUT, ReadinessWaiter};

// ============================================================================
// Constants
// ============================================================================

/// Storage key of the ready marker.
pub const READY_KEY: &str = "lcap.ready";

/// Storage key of the remembered platform origin.
pub const ORIGIN_KEY: &str = "lcap.origin";

/// Storage key of the proceeded marker.
pub const PROCEEDED_KEY: &str = "lcap.proceeded";

/// Budget of the silent READY wait on load.
pub const RESUME_WAIT_TIMEOUT: Duration = Duration::from_millis(1200);

const MARKER_SET: &str = "1";

// ============================================================================
// SessionMemory
// ============================================================================

/// Typed view over the tab's connection markers.
#[derive(Clone)]
pub struct SessionMemory {
    context: Arc<BrowsingContext>,
}

impl fmt::Debug for SessionMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMemory")
            .field("ready", &self.is_marked_ready())
            .field("origin", &self.remembered_origin())
            .field("proceeded", &self.has_proceeded())
            .finish()
    }
}

impl SessionMemory {
    /// Creates a view over `context`'s session storage.
    #[must_use]
    pub fn new(context: &Arc<BrowsingContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    /// Records a successful connection to `origin`.
    pub fn mark_ready(&self, origin: &Origin) {
        let storage = self.context.storage();
        storage.set(READY_KEY, MARKER_SET);
        storage.set(ORIGIN_KEY, origin.as_str());
    }

    /// Returns `true` if a previous load connected successfully.
    #[must_use]
    pub fn is_marked_ready(&self) -> bool {
        self.context.storage().get(READY_KEY).as_deref() == Some(MARKER_SET)
    }

    /// Returns the origin of the last successful connection.
    ///
    /// A stored value that no longer parses is treated as absent.
    #[must_use]
    pub fn remembered_origin(&self) -> Option<Origin> {
        self.context
            .storage()
            .get(ORIGIN_KEY)
            .and_then(|origin| Origin::parse(&origin).ok())
    }

    /// Records that the user chose to proceed.
    pub fn mark_proceeded(&self) {
        self.context.storage().set(PROCEEDED_KEY, MARKER_SET);
    }

    /// Returns `true` if the user proceeded after the last connect.
    #[must_use]
    pub fn has_proceeded(&self) -> bool {
        self.is_marked_ready()
            && self.context.storage().get(PROCEEDED_KEY).as_deref() == Some(MARKER_SET)
    }

    /// Forgets every marker.
    pub fn clear(&self) {
        let storage = self.context.storage();
        storage.remove(READY_KEY);
        storage.remove(ORIGIN_KEY);
        storage.remove(PROCEEDED_KEY);
    }
}

// ============================================================================
// ResumeOutcome
// ============================================================================

/// Result of [`Connector::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing remembered; an explicit connect is needed.
    Fresh,
    /// The remembered platform answered.
    Resumed {
        /// `true` if the user had proceeded before and this page load has
        /// not auto-proceeded yet.
        auto_proceed: bool,
    },
    /// The remembered platform did not answer; markers were cleared.
    Expired,
}

// ============================================================================
// Connector
// ============================================================================

/// Page-global connector state.
#[derive(Debug, Default)]
struct ConnectorState {
    auto_proceeded: AtomicBool,
}

/// Connect, proceed and resume workflow of the client page.
///
/// # Example
///
/// ```ignore
/// let connector = Connector::new(PopupClient::initialize(&tab, config));
///
/// match connector.resume().await {
///     ResumeOutcome::Resumed { auto_proceed: true } => open_app(),
///     ResumeOutcome::Resumed { .. } => show_proceed_button(),
///     ResumeOutcome::Fresh | ResumeOutcome::Expired => show_connect_button(),
/// }
///
/// // Connect button handler:
/// let ready = tab.with_user_gesture(|g| connector.connect(g));
/// ready.await?;
/// ```
#[derive(Clone)]
pub struct Connector {
    client: PopupClient,
    waiter: ReadinessWaiter,
    memory: SessionMemory,
    state: Arc<ConnectorState>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("client", &self.client)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Creates a connector around an initialized client.
    #[must_use]
    pub fn new(client: PopupClient) -> Self {
        let context = Arc::clone(client.context());
        Self {
            waiter: ReadinessWaiter::new(&context),
            memory: SessionMemory::new(&context),
            state: context.global::<ConnectorState>(),
            client,
        }
    }

    /// Returns the underlying client.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &PopupClient {
        &self.client
    }

    /// Returns the tab's connection markers.
    #[inline]
    #[must_use]
    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    /// Returns `true` once READY has been observed during this page load.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.waiter.is_ready() || self.client.is_connected()
    }

    /// Connects from a click and waits up to 15s for READY.
    ///
    /// Opens the platform window only when not already ready. On success the
    /// ready and origin markers are stored; on any failure every marker is
    /// cleared. A refused window also cancels the READY wait it armed.
    ///
    /// # Errors
    ///
    /// - [`Error::PopupBlocked`] if the browser refuses the window
    /// - [`Error::ReadyTimeout`] if the platform does not answer in time
    pub fn connect(&self, gesture: &UserGesture) -> BoxFuture<'static, Result<Value>> {
        let origin = self.client.config().target_origin;
        // Listen before HELLO goes out so an early READY is not missed.
        let wait = self
            .waiter
            .wait_for_ready(DEFAULT_READY_TIMEOUT, Some(origin.as_str()));

        if !self.is_ready()
            && let Err(e) = self.client.connect_from_click(gesture)
        {
            // A retry must arm its own wait with the full budget.
            self.waiter.cancel();
            self.memory.clear();
            return futures_util::future::ready(Err(e)).boxed();
        }

        let memory = self.memory.clone();
        async move {
            match wait.await {
                Ok(message) => {
                    memory.mark_ready(&origin);
                    info!(origin = %origin, "Platform connected");
                    Ok(message)
                }
                Err(e) => {
                    memory.clear();
                    Err(e)
                }
            }
        }
        .boxed()
    }

    /// Records that the user chose to proceed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if READY has not been observed.
    pub fn proceed(&self) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotConnected);
        }
        self.memory.mark_proceeded();
        debug!("Proceed recorded");
        Ok(())
    }

    /// Silently reconnects on load if a previous load connected.
    ///
    /// Waits on the remembered origin (or the configured platform origin) for
    /// 1200ms. Never opens a window.
    pub fn resume(&self) -> BoxFuture<'static, ResumeOutcome> {
        if !self.memory.is_marked_ready() {
            return futures_util::future::ready(ResumeOutcome::Fresh).boxed();
        }

        let origin = self
            .memory
            .remembered_origin()
            .unwrap_or_else(|| self.client.config().target_origin);
        let wait = self
            .waiter
            .wait_for_ready(RESUME_WAIT_TIMEOUT, Some(origin.as_str()));
        let attached = self.client.attach_to_existing();
        debug!(origin = %origin, attached, "Checking remembered platform");

        let memory = self.memory.clone();
        let state = Arc::clone(&self.state);
        async move {
            if wait.await.is_err() {
                info!(origin = %origin, "Remembered platform did not answer");
                memory.clear();
                return ResumeOutcome::Expired;
            }

            memory.mark_ready(&origin);
            let auto_proceed =
                memory.has_proceeded() && !state.auto_proceeded.swap(true, Ordering::SeqCst);
            ResumeOutcome::Resumed { auto_proceed }
        }
        .boxed()
    }
}

// ============================================================================
// Tests
// ============================================================================
