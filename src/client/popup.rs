//! Client end of the bridge.
//!
//! [`PopupClient`] opens (or re-attaches to) the named platform window,
//! performs the HELLO/READY handshake and issues correlated calls.
//!
//! # Call Lifecycle
//!
//! ```text
//! call(name, args)
//!   ├─ id = next call id
//!   ├─ function args → {"callback": n} tokens
//!   ├─ pending[id] = tx
//!   ├─ post LCAP_RPC
//!   └─ await rx (timeout)
//!         ├─ RESULT(id)  → remove pending[id], settle
//!         └─ timeout     → remove pending[id], reject
//! ```
//!
//! Whichever side removes `pending[id]` first settles the call; the other
//! side finds nothing and does nothing.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::Nonce;
use crate::protocol::{
    CallArg, CallMessage, CallbackMessage, Envelope, ResultMessage, callback_token,
};
use crate::transport::{BrowsingContext, MessageEvent, UserGesture, WindowHandle};

use super::config::BridgeConfig;
use super::session::BridgeSession;

// ============================================================================
// PopupClient
// ============================================================================

/// Client bridge bound to one tab.
///
/// Cheap to clone; clones share the tab's session.
///
/// # Example
///
/// ```ignore
/// let client = PopupClient::initialize(&tab, config);
///
/// // Inside a click handler:
/// tab.with_user_gesture(|g| client.connect_from_click(g))?;
///
/// let rows = client
///     .call("_RB.selectQuery", args![["id", "name"], "Section", "", 100, true])
///     .await?;
/// ```
#[derive(Clone)]
pub struct PopupClient {
    context: Arc<BrowsingContext>,
    session: Arc<BridgeSession>,
}

impl fmt::Debug for PopupClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PopupClient")
            .field("tab", &self.context.name())
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PopupClient - Initialization
// ============================================================================

impl PopupClient {
    /// Creates or reuses the tab's bridge.
    ///
    /// Safe to call repeatedly: the session, nonce and inbound listener are
    /// shared, and only the configuration is replaced. When
    /// [`BridgeConfig::auto_attach`] is set, tries to attach to an open
    /// platform window and ignores the outcome.
    pub fn initialize(context: &Arc<BrowsingContext>, config: BridgeConfig) -> Self {
        let auto_attach = config.auto_attach;
        let session = BridgeSession::obtain(context, config);

        let weak = Arc::downgrade(&session);
        let installed = session.claim_listener(|| {
            context.add_listener(move |event| {
                if let Some(session) = weak.upgrade() {
                    handle_message(&session, event);
                }
            })
        });
        if installed {
            trace!(tab = %context.name(), "Bridge listener installed");
        }

        let client = Self {
            context: Arc::clone(context),
            session,
        };

        if auto_attach {
            let _ = client.attach_to_existing();
        }
        client
    }
}

// ============================================================================
// PopupClient - Connection
// ============================================================================

impl PopupClient {
    /// Opens or focuses the platform window and starts the handshake.
    ///
    /// Must be called synchronously from a user-input handler. Sends a HELLO
    /// immediately, then reposts it every
    /// [`hello_interval`](BridgeConfig::hello_interval) until READY arrives,
    /// the window closes, a newer connect or attach replaces it, or the
    /// [`hello_burst`](BridgeConfig::hello_burst) elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PopupBlocked`] if the browser refuses the window.
    pub fn connect_from_click(&self, gesture: &UserGesture) -> Result<()> {
        let config = self.session.config();
        let Some(handle) =
            self.context
                .open_window(config.platform_url.as_str(), &config.window_name, gesture)
        else {
            warn!(window = %config.window_name, "Popup blocked");
            return Err(Error::PopupBlocked);
        };

        let generation = self.session.replace_server(Arc::clone(&handle));
        info!(window = %config.window_name, origin = %config.target_origin, "Platform window opened");

        send_hello(&self.session, handle.as_ref(), &config);
        tokio::spawn(run_hello_burst(
            Arc::downgrade(&self.session),
            handle,
            generation,
            config,
        ));
        Ok(())
    }

    /// Attaches to an already-open platform window.
    ///
    /// Never opens a window and needs no user gesture. Sends a single HELLO.
    /// Returns `false` if no window with the configured name is open.
    pub fn attach_to_existing(&self) -> bool {
        let config = self.session.config();
        let Some(handle) = self.context.find_window(&config.window_name) else {
            trace!(window = %config.window_name, "No platform window to attach to");
            return false;
        };

        self.session.replace_server(Arc::clone(&handle));
        debug!(window = %config.window_name, "Attached to platform window");
        send_hello(&self.session, handle.as_ref(), &config);
        true
    }

    /// Returns `true` if the platform window is open and READY was observed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.live_server().is_some() && self.session.is_ready()
    }

    /// Returns the tab this client is bound to.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<BrowsingContext> {
        &self.context
    }

    /// Returns the tab nonce.
    #[must_use]
    pub fn nonce(&self) -> Nonce {
        self.session.nonce().clone()
    }

    /// Returns the current configuration.
    #[must_use]
    pub fn config(&self) -> BridgeConfig {
        self.session.config()
    }

    /// Returns the number of calls awaiting a result.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.session.pending_count()
    }

    /// Returns the number of live callback registrations.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.session.callback_count()
    }
}

// ============================================================================
// PopupClient - Calls
// ============================================================================

impl PopupClient {
    /// Calls an allow-listed function in the platform window.
    ///
    /// The CALL is posted before this returns; the returned future resolves
    /// with the remote result.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if no platform window is open
    /// - [`Error::CallTimeout`] if no RESULT arrives in time
    /// - [`Error::Remote`] if the platform rejected or failed the call
    pub fn call(&self, name: &str, args: Vec<CallArg>) -> BoxFuture<'static, Result<Value>> {
        match self.post_call(name, args) {
            Ok(pending) => pending.boxed(),
            Err(e) => futures_util::future::ready(Err(e)).boxed(),
        }
    }

    /// Registers and posts a call, returning the future awaiting its result.
    fn post_call(
        &self,
        name: &str,
        args: Vec<CallArg>,
    ) -> Result<impl Future<Output = Result<Value>> + Send + 'static + use<>> {
        let handle = self.session.live_server().ok_or(Error::NotConnected)?;
        let config = self.session.config();
        let id = self.session.next_call_id();

        let wire_args = args
            .into_iter()
            .map(|arg| match arg {
                CallArg::Value(value) => value,
                CallArg::Callback(callback) => {
                    callback_token(self.session.register_callback(callback))
                }
            })
            .collect();
        let message = Envelope::Call(CallMessage::new(
            id,
            name,
            wire_args,
            self.session.nonce().clone(),
        ))
        .to_value()?;

        let (tx, mut rx) = oneshot::channel();
        self.session.insert_pending(id, tx);

        if let Err(e) = handle.post_message(message, config.target_origin.as_str()) {
            self.session.take_pending(id);
            return Err(e);
        }
        debug!(call_id = %id, name, "Call posted");

        let session = Arc::clone(&self.session);
        let name = name.to_string();
        let call_timeout = config.call_timeout;
        let timeout_ms = config.call_timeout_ms();

        Ok(async move {
            match timeout(call_timeout, &mut rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::ConnectionClosed),
                Err(_) => {
                    if session.take_pending(id).is_some() {
                        warn!(call_id = %id, name = %name, timeout_ms, "Call timed out");
                        return Err(Error::call_timeout(name, timeout_ms));
                    }
                    // The RESULT claimed the entry as the timer fired.
                    rx.await?
                }
            }
        })
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Posts one HELLO carrying the tab nonce.
fn send_hello(session: &BridgeSession, handle: &dyn WindowHandle, config: &BridgeConfig) {
    let hello = Envelope::Hello {
        nonce: session.nonce().clone(),
    };
    let result = hello
        .to_value()
        .and_then(|value| handle.post_message(value, config.target_origin.as_str()));
    match result {
        Ok(()) => trace!(origin = %config.target_origin, "HELLO posted"),
        Err(e) => warn!(error = %e, "Failed to post HELLO"),
    }
}

/// Reposts HELLO until the handshake completes or the burst is over.
async fn run_hello_burst(
    session: Weak<BridgeSession>,
    handle: Arc<dyn WindowHandle>,
    generation: u64,
    config: BridgeConfig,
) {
    let started = Instant::now();
    loop {
        sleep(config.hello_interval).await;

        let Some(session) = session.upgrade() else {
            break;
        };
        if session.generation() != generation || handle.is_closed() || session.is_ready() {
            break;
        }
        if started.elapsed() > config.hello_burst {
            debug!("HELLO burst finished without READY");
            break;
        }
        send_hello(&session, handle.as_ref(), &config);
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Routes one inbound message for the tab's session.
fn handle_message(session: &BridgeSession, event: &MessageEvent) {
    let expected = session.target_origin();
    if !expected.matches(&event.origin) {
        trace!(origin = %event.origin, expected = %expected, "Foreign origin ignored");
        return;
    }

    let envelope = match Envelope::from_value(&event.data) {
        Ok(envelope) => envelope,
        Err(e) => {
            trace!(error = %e, "Non-bridge message ignored");
            return;
        }
    };

    if let Some(nonce) = envelope.nonce()
        && nonce != session.nonce()
    {
        trace!(kind = envelope.type_tag(), "Message for another nonce ignored");
        return;
    }

    match envelope {
        Envelope::Ready { .. } => {
            if session.mark_ready() {
                info!(origin = %event.origin, "Bridge ready");
            }
        }
        Envelope::Result(result) => settle(session, result),
        Envelope::CallbackInvoke(message) => invoke_callback(session, message),
        Envelope::Hello { .. } | Envelope::Call(_) => {
            trace!(kind = envelope.type_tag(), "Server-bound message ignored");
        }
    }
}

/// Settles the pending call a RESULT answers.
fn settle(session: &BridgeSession, result: ResultMessage) {
    let Some(id) = result.id else {
        trace!("RESULT without id ignored");
        return;
    };
    let Some(tx) = session.take_pending(id) else {
        trace!(call_id = %id, "RESULT for unknown call ignored");
        return;
    };

    debug!(call_id = %id, ok = result.ok, "Call settled");
    let _ = tx.send(result.into_result());
}

/// Runs the function a CALLBACK_INVOKE refers to.
fn invoke_callback(session: &BridgeSession, message: CallbackMessage) {
    if message.nonce.is_none() {
        trace!(callback_id = %message.callback, "Callback without nonce ignored");
        return;
    }
    let Some(callback) = session.callback(message.callback) else {
        debug!(callback_id = %message.callback, "Callback not registered");
        return;
    };

    let args = message.args;
    if catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
        warn!(call_id = %message.id, callback_id = %message.callback, "Callback panicked");
    }
}

// ============================================================================
// Tests
// ============================================================================
