//! Browsing contexts and their message event loop.
//!
//! A [`BrowsingContext`] is one tab or popup window. It owns:
//!
//! - an inbound queue drained in order by its own event loop task
//! - the listener table (`addEventListener("message", ...)`)
//! - tab-scoped [`SessionStorage`] that survives reloads
//! - a registry of page globals that a reload wipes
//!
//! # Event Loop
//!
//! Messages posted to a context are queued and delivered to every listener
//! one at a time, in post order. Listeners run to completion; anything
//! long-running must be spawned.

// ============================================================================
// Imports
// ============================================================================

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::Result;
use crate::identifiers::ListenerId;

use super::browser::BrowserInner;
use super::origin::Origin;
use super::storage::SessionStorage;
use super::window::{MessageEvent, MessageListener, UserGesture, WindowHandle};

// ============================================================================
// Types
// ============================================================================

/// Page globals keyed by type.
type GlobalMap = FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Internal commands for the event loop.
enum ContextCommand {
    /// Deliver a message to the listeners.
    Deliver(MessageEvent),
    /// Stop the loop.
    Shutdown,
}

// ============================================================================
// BrowsingContext
// ============================================================================

/// A tab or window hosting one page at a time.
pub struct BrowsingContext {
    /// Window name used for `open`/attach lookups.
    name: String,
    /// Current page URL.
    url: RwLock<Url>,
    /// Current page origin.
    origin: RwLock<Origin>,
    /// Owning browser.
    browser: Weak<BrowserInner>,
    /// Queue feeding the event loop.
    inbox: mpsc::UnboundedSender<ContextCommand>,
    /// Installed listeners in install order.
    listeners: Mutex<Vec<(ListenerId, MessageListener)>>,
    /// Page globals, wiped on reload.
    globals: Mutex<GlobalMap>,
    /// Tab-scoped storage, kept across reloads.
    storage: SessionStorage,
    /// Set once the context is closed.
    closed: AtomicBool,
}

impl fmt::Debug for BrowsingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowsingContext")
            .field("name", &self.name)
            .field("origin", &*self.origin.read())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BrowsingContext - Constructor
// ============================================================================

impl BrowsingContext {
    /// Creates a context and spawns its event loop.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn new(name: String, url: Url, browser: Weak<BrowserInner>) -> Arc<Self> {
        let origin = Origin::parse(url.as_str()).unwrap_or_else(|_| Origin::opaque());
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        let context = Arc::new(Self {
            name,
            url: RwLock::new(url),
            origin: RwLock::new(origin),
            browser,
            inbox,
            listeners: Mutex::new(Vec::new()),
            globals: Mutex::new(GlobalMap::default()),
            storage: SessionStorage::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Self::run_event_loop(Arc::downgrade(&context), inbox_rx));

        debug!(name = %context.name, origin = %context.origin(), "Browsing context created");
        context
    }
}

// ============================================================================
// BrowsingContext - Accessors
// ============================================================================

impl BrowsingContext {
    /// Returns the window name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current page URL.
    #[must_use]
    pub fn url(&self) -> Url {
        self.url.read().clone()
    }

    /// Returns the current page origin.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin.read().clone()
    }

    /// Returns the tab's session storage.
    #[inline]
    #[must_use]
    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    /// Returns `true` once the context has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns a handle to this context as held by `holder`.
    ///
    /// Messages posted through the handle appear to come from `holder`.
    #[must_use]
    pub fn handle_for(self: &Arc<Self>, holder: &Arc<BrowsingContext>) -> Arc<dyn WindowHandle> {
        Arc::new(ContextWindow {
            target: Arc::downgrade(self),
            holder: Arc::downgrade(holder),
        })
    }
}

// ============================================================================
// BrowsingContext - Listeners
// ============================================================================

impl BrowsingContext {
    /// Installs a message listener.
    pub fn add_listener(&self, listener: impl Fn(&MessageEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.lock().push((id, Arc::new(listener)));
        trace!(name = %self.name, listener = %id, "Listener added");
        id
    }

    /// Removes a listener. Returns `false` if it was not installed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(installed, _)| *installed != id);
        let removed = listeners.len() != before;
        if removed {
            trace!(name = %self.name, listener = %id, "Listener removed");
        }
        removed
    }

    /// Returns the number of installed listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Queues an inbound message for the listeners.
    pub fn enqueue(&self, event: MessageEvent) {
        if self.inbox.send(ContextCommand::Deliver(event)).is_err() {
            trace!(name = %self.name, "Event loop gone, message dropped");
        }
    }

    /// Delivers one event to a snapshot of the listeners.
    fn dispatch(&self, event: &MessageEvent) {
        if self.is_closed() {
            return;
        }

        let listeners: Vec<MessageListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(name = %self.name, "Message listener panicked");
            }
        }
    }

    /// Event loop that drains the inbound queue.
    async fn run_event_loop(
        context: Weak<BrowsingContext>,
        mut inbox_rx: mpsc::UnboundedReceiver<ContextCommand>,
    ) {
        while let Some(command) = inbox_rx.recv().await {
            match command {
                ContextCommand::Deliver(event) => {
                    let Some(context) = context.upgrade() else {
                        break;
                    };
                    context.dispatch(&event);
                }
                ContextCommand::Shutdown => break,
            }
        }

        trace!("Context event loop terminated");
    }
}

// ============================================================================
// BrowsingContext - Page Globals
// ============================================================================

impl BrowsingContext {
    /// Returns the page global of type `T`, creating it on first use.
    ///
    /// A page global lives until the next reload or navigation; repeated
    /// calls within one page load return the same instance.
    pub fn global<T>(&self) -> Arc<T>
    where
        T: Default + Send + Sync + 'static,
    {
        self.global_or_insert_with(T::default)
    }

    /// Returns the page global of type `T`, creating it with `init` on first use.
    pub fn global_or_insert_with<T>(&self, init: impl FnOnce() -> T) -> Arc<T>
    where
        T: Send + Sync + 'static,
    {
        let mut globals = self.globals.lock();
        let slot = globals
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);

        match Arc::clone(slot).downcast::<T>() {
            Ok(global) => global,
            Err(_) => unreachable!("page globals are keyed by their own TypeId"),
        }
    }

    /// Returns the page global of type `T` if one exists.
    #[must_use]
    pub fn try_global<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let globals = self.globals.lock();
        let slot = globals.get(&TypeId::of::<T>())?;
        Arc::clone(slot).downcast::<T>().ok()
    }
}

// ============================================================================
// BrowsingContext - User Activation & Windows
// ============================================================================

impl BrowsingContext {
    /// Runs `f` inside a simulated user-input event.
    pub fn with_user_gesture<R>(&self, f: impl FnOnce(&UserGesture) -> R) -> R {
        let gesture = UserGesture::new();
        f(&gesture)
    }

    /// Opens (or navigates and focuses) the window named `name` at `url`.
    ///
    /// Returns `None` if the browser refuses the popup.
    pub fn open_window(
        self: &Arc<Self>,
        url: &str,
        name: &str,
        gesture: &UserGesture,
    ) -> Option<Arc<dyn WindowHandle>> {
        let browser = self.browser.upgrade()?;
        browser.open_window(self, url, name, Some(gesture))
    }

    /// Returns a handle to an already-open window named `name`.
    ///
    /// Never creates a window and needs no user gesture.
    pub fn find_window(self: &Arc<Self>, name: &str) -> Option<Arc<dyn WindowHandle>> {
        let browser = self.browser.upgrade()?;
        browser.find_window(self, name)
    }
}

// ============================================================================
// BrowsingContext - Lifecycle
// ============================================================================

impl BrowsingContext {
    /// Reloads the current page.
    ///
    /// Listeners and page globals are dropped; session storage survives.
    pub fn reload(self: &Arc<Self>) {
        self.unload();
        debug!(name = %self.name, "Page reloaded");
        if let Some(browser) = self.browser.upgrade() {
            browser.run_page_loader(self);
        }
    }

    /// Navigates to `url`, replacing the current page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`](crate::Error::Url) if `url` is not a valid URL.
    pub fn navigate(self: &Arc<Self>, url: &str) -> Result<()> {
        let parsed = Url::parse(url)?;
        let origin = Origin::parse(parsed.as_str()).unwrap_or_else(|_| Origin::opaque());

        self.unload();
        *self.url.write() = parsed;
        *self.origin.write() = origin;
        debug!(name = %self.name, origin = %self.origin(), "Navigated");

        if let Some(browser) = self.browser.upgrade() {
            browser.run_page_loader(self);
        }
        Ok(())
    }

    /// Closes the context.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unload();
        self.storage.clear();
        let _ = self.inbox.send(ContextCommand::Shutdown);
        if let Some(browser) = self.browser.upgrade() {
            browser.forget(&self.name);
        }
        debug!(name = %self.name, "Browsing context closed");
    }

    /// Drops page state.
    fn unload(&self) {
        self.listeners.lock().clear();
        let globals: Vec<_> = self.globals.lock().drain().collect();
        drop(globals);
    }
}

// ============================================================================
// ContextWindow
// ============================================================================

/// [`WindowHandle`] onto a context, held by another context.
struct ContextWindow {
    /// Window the handle points at.
    target: Weak<BrowsingContext>,
    /// Window holding the handle; the apparent sender.
    holder: Weak<BrowsingContext>,
}

impl WindowHandle for ContextWindow {
    fn post_message(&self, message: Value, target_origin: &str) -> Result<()> {
        let wanted = if target_origin == super::origin::ANY_ORIGIN {
            None
        } else {
            Some(Origin::parse(target_origin)?)
        };

        let Some(target) = self.target.upgrade() else {
            return Ok(());
        };
        if target.is_closed() {
            trace!(name = %target.name, "Post to closed window ignored");
            return Ok(());
        }

        if let Some(wanted) = wanted
            && wanted != target.origin()
        {
            debug!(
                name = %target.name,
                expected = %wanted,
                actual = %target.origin(),
                "Target origin mismatch, message dropped"
            );
            return Ok(());
        }

        let Some(holder) = self.holder.upgrade() else {
            return Ok(());
        };

        let reply: Arc<dyn WindowHandle> = Arc::new(ContextWindow {
            target: self.holder.clone(),
            holder: self.target.clone(),
        });
        target.enqueue(MessageEvent::new(holder.origin().as_str(), message).with_source(reply));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.target
            .upgrade()
            .is_none_or(|target| target.is_closed())
    }

    fn name(&self) -> String {
        self.target
            .upgrade()
            .map(|target| target.name.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================
