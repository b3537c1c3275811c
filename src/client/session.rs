//! Per-tab bridge session.
//!
//! One [`BridgeSession`] exists per page load of the client tab. It is stored
//! as a page global, so re-initializing the bridge reuses it and only merges
//! the new configuration. The nonce is also written to session storage and
//! picked up again after a reload.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Result;
use crate::identifiers::{CallId, CallbackId, ListenerId, Nonce};
use crate::protocol::ClientCallback;
use crate::transport::{BrowsingContext, Origin, SessionStorage, WindowHandle};

use super::callbacks::CallbackRegistry;
use super::config::BridgeConfig;

// ============================================================================
// Constants
// ============================================================================

/// Session storage key holding the tab nonce.
pub const NONCE_STORAGE_KEY: &str = "rb_nonce";

// ============================================================================
// Types
// ============================================================================

/// Pending calls awaiting a RESULT, keyed by call id.
type PendingMap = FxHashMap<CallId, oneshot::Sender<Result<Value>>>;

// ============================================================================
// BridgeSession
// ============================================================================

/// Shared state of the client bridge for one page load.
pub(crate) struct BridgeSession {
    /// Tab nonce, stable across reloads.
    nonce: Nonce,
    /// Latest configuration.
    config: RwLock<BridgeConfig>,
    /// Handle to the platform window.
    server: RwLock<Option<Arc<dyn WindowHandle>>>,
    /// Set once READY is observed for the current handle.
    ready: AtomicBool,
    /// Last assigned call id.
    call_seq: AtomicU64,
    /// Bumped whenever the handle is replaced; stops stale HELLO bursts.
    generation: AtomicU64,
    /// Calls awaiting a RESULT.
    pending: Mutex<PendingMap>,
    /// Function arguments awaiting invocation.
    callbacks: Mutex<CallbackRegistry>,
    /// Inbound listener, installed once.
    listener: Mutex<Option<ListenerId>>,
}

impl BridgeSession {
    /// Returns the tab's session, creating it on first use.
    ///
    /// An existing session keeps its nonce, handle and tables and only
    /// takes the new configuration.
    pub(crate) fn obtain(context: &BrowsingContext, config: BridgeConfig) -> Arc<Self> {
        let storage = context.storage();
        let mut created = false;
        let session = context.global_or_insert_with(|| {
            created = true;
            Self::new(load_nonce(storage), config.clone())
        });

        if created {
            debug!(window = %config.window_name, "Bridge session created");
        } else {
            debug!(window = %config.window_name, "Bridge session reused");
            *session.config.write() = config;
        }

        storage.set(NONCE_STORAGE_KEY, session.nonce.as_str());
        session
    }

    fn new(nonce: Nonce, config: BridgeConfig) -> Self {
        Self {
            nonce,
            config: RwLock::new(config),
            server: RwLock::new(None),
            ready: AtomicBool::new(false),
            call_seq: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            pending: Mutex::new(PendingMap::default()),
            callbacks: Mutex::new(CallbackRegistry::default()),
            listener: Mutex::new(None),
        }
    }
}

// ============================================================================
// BridgeSession - Configuration
// ============================================================================

impl BridgeSession {
    #[inline]
    pub(crate) fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub(crate) fn config(&self) -> BridgeConfig {
        self.config.read().clone()
    }

    pub(crate) fn target_origin(&self) -> Origin {
        self.config.read().target_origin.clone()
    }
}

// ============================================================================
// BridgeSession - Connection State
// ============================================================================

impl BridgeSession {
    /// Replaces the platform handle and clears readiness.
    ///
    /// Returns the new handle generation.
    pub(crate) fn replace_server(&self, handle: Arc<dyn WindowHandle>) -> u64 {
        *self.server.write() = Some(handle);
        self.ready.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the handle if it is still open.
    pub(crate) fn live_server(&self) -> Option<Arc<dyn WindowHandle>> {
        self.server
            .read()
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Records a READY. Returns `true` on the first one for this handle.
    pub(crate) fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::SeqCst)
    }

    /// Claims the install-once listener slot.
    ///
    /// Returns `false` if a listener is already installed.
    pub(crate) fn claim_listener(&self, install: impl FnOnce() -> ListenerId) -> bool {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(install());
        true
    }
}

// ============================================================================
// BridgeSession - Calls & Callbacks
// ============================================================================

impl BridgeSession {
    /// Allocates the next call id.
    pub(crate) fn next_call_id(&self) -> CallId {
        CallId::new(self.call_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn insert_pending(&self, id: CallId, tx: oneshot::Sender<Result<Value>>) {
        self.pending.lock().insert(id, tx);
    }

    /// Removes a pending call. Whoever gets the sender settles the call.
    pub(crate) fn take_pending(&self, id: CallId) -> Option<oneshot::Sender<Result<Value>>> {
        self.pending.lock().remove(&id)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn register_callback(&self, callback: ClientCallback) -> CallbackId {
        let (capacity, ttl) = {
            let config = self.config.read();
            (config.callback_capacity, config.callback_ttl)
        };
        self.callbacks.lock().register(callback, capacity, ttl)
    }

    pub(crate) fn callback(&self, id: CallbackId) -> Option<ClientCallback> {
        let ttl = self.config.read().callback_ttl;
        self.callbacks.lock().get(id, ttl)
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Reads the persisted nonce, generating one if absent.
fn load_nonce(storage: &SessionStorage) -> Nonce {
    storage
        .get(NONCE_STORAGE_KEY)
        .filter(|nonce| !nonce.is_empty())
        .map(Nonce::from)
        .unwrap_or_else(Nonce::generate)
}

// ============================================================================
// Tests
// ============================================================================
