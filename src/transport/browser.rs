//! In-process browser hosting named browsing contexts.
//!
//! Manages every open context keyed by window name and implements the
//! platform rules the bridge relies on: popup blocking, reusing a named
//! window on `open`, attaching to an existing window without a gesture, and
//! running page scripts when a page loads.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Browser                      │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ "tab-1"           → client page        │  │
//! │  │ "lcap-dev-bridge" → platform popup     │  │
//! │  └────────────────────────────────────────┘  │
//! │  page loaders: origin → install listeners    │
//! └──────────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Result;

use super::context::BrowsingContext;
use super::origin::Origin;
use super::window::{UserGesture, WindowHandle};

// ============================================================================
// Types
// ============================================================================

/// Script run when a page of a given origin finishes loading.
pub type PageLoader = Arc<dyn Fn(&Arc<BrowsingContext>) + Send + Sync>;

/// How the browser treats `open` requests for new windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PopupPolicy {
    /// Allow popups opened during a user gesture.
    #[default]
    RequireGesture,
    /// Allow every popup.
    Allow,
    /// Refuse every popup.
    Block,
}

// ============================================================================
// BrowserInner
// ============================================================================

/// Shared browser state, referenced weakly by each context.
pub(crate) struct BrowserInner {
    /// Open contexts by window name.
    contexts: RwLock<FxHashMap<String, Arc<BrowsingContext>>>,
    /// Page loaders by origin.
    loaders: RwLock<FxHashMap<Origin, PageLoader>>,
    /// Popup policy.
    popup_policy: RwLock<PopupPolicy>,
    /// Delay between navigation and the page loader running.
    load_delay: RwLock<Duration>,
    /// Counter for unnamed tabs.
    next_tab: AtomicU64,
}

impl BrowserInner {
    /// Opens or reuses the window `name` at `url` on behalf of `opener`.
    pub(crate) fn open_window(
        self: &Arc<Self>,
        opener: &Arc<BrowsingContext>,
        url: &str,
        name: &str,
        gesture: Option<&UserGesture>,
    ) -> Option<Arc<dyn WindowHandle>> {
        let allowed = match *self.popup_policy.read() {
            PopupPolicy::Allow => true,
            PopupPolicy::RequireGesture => gesture.is_some(),
            PopupPolicy::Block => false,
        };
        if !allowed {
            warn!(name, "Popup blocked");
            return None;
        }

        let existing = self.contexts.read().get(name).cloned();
        let context = match existing {
            Some(context) if !context.is_closed() => {
                if let Err(e) = context.navigate(url) {
                    warn!(name, error = %e, "Navigation failed");
                    return None;
                }
                debug!(name, "Existing window navigated");
                context
            }
            _ => {
                let parsed = match Url::parse(url) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(name, error = %e, "Invalid popup URL");
                        return None;
                    }
                };
                let context = self.create(name.to_string(), parsed);
                info!(name, origin = %context.origin(), "Popup opened");
                context
            }
        };

        Some(context.handle_for(opener))
    }

    /// Returns a handle to an open window named `name`.
    pub(crate) fn find_window(
        &self,
        holder: &Arc<BrowsingContext>,
        name: &str,
    ) -> Option<Arc<dyn WindowHandle>> {
        let context = self.contexts.read().get(name).cloned()?;
        if context.is_closed() {
            return None;
        }
        Some(context.handle_for(holder))
    }

    /// Runs the page loader registered for the context's origin.
    pub(crate) fn run_page_loader(&self, context: &Arc<BrowsingContext>) {
        let Some(loader) = self.loaders.read().get(&context.origin()).cloned() else {
            return;
        };

        let delay = *self.load_delay.read();
        if delay.is_zero() {
            loader(context);
            return;
        }

        let context = Arc::downgrade(context);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(context) = context.upgrade()
                && !context.is_closed()
            {
                loader(&context);
            }
        });
    }

    /// Drops a closed context from the name table.
    pub(crate) fn forget(&self, name: &str) {
        let mut contexts = self.contexts.write();
        if contexts.get(name).is_some_and(|context| context.is_closed()) {
            contexts.remove(name);
        }
    }

    /// Creates, registers and loads a new context.
    fn create(self: &Arc<Self>, name: String, url: Url) -> Arc<BrowsingContext> {
        let context = BrowsingContext::new(name.clone(), url, Arc::downgrade(self));
        self.contexts.write().insert(name, Arc::clone(&context));
        self.run_page_loader(&context);
        context
    }
}

// ============================================================================
// Browser
// ============================================================================

/// An in-process browser.
///
/// Cheap to clone; clones share the same windows.
///
/// # Example
///
/// ```ignore
/// let browser = Browser::new();
/// browser.on_page_load("https://platform.example.com", |page| {
///     listener.install(page);
/// });
///
/// let tab = browser.open_tab("http://localhost:3000/")?;
/// ```
#[derive(Clone)]
pub struct Browser {
    inner: Arc<BrowserInner>,
}

impl fmt::Debug for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Browser")
            .field("windows", &self.window_count())
            .field("popup_policy", &self.popup_policy())
            .finish_non_exhaustive()
    }
}

impl Default for Browser {
    fn default() -> Self {
        Self::new()
    }
}

impl Browser {
    /// Creates a browser with no windows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrowserInner {
                contexts: RwLock::new(FxHashMap::default()),
                loaders: RwLock::new(FxHashMap::default()),
                popup_policy: RwLock::new(PopupPolicy::default()),
                load_delay: RwLock::new(Duration::ZERO),
                next_tab: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a top-level tab at `url`, as if the user typed it.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`](crate::Error::Url) if `url` is invalid.
    pub fn open_tab(&self, url: &str) -> Result<Arc<BrowsingContext>> {
        let parsed = Url::parse(url)?;
        let name = format!("tab-{}", self.inner.next_tab.fetch_add(1, Ordering::Relaxed));
        Ok(self.inner.create(name, parsed))
    }

    /// Registers a script to run whenever a page of `origin` loads.
    ///
    /// # Errors
    ///
    /// Returns an error if `origin` is not a valid origin.
    pub fn on_page_load(
        &self,
        origin: &str,
        loader: impl Fn(&Arc<BrowsingContext>) + Send + Sync + 'static,
    ) -> Result<()> {
        let origin = Origin::parse(origin)?;
        self.inner.loaders.write().insert(origin, Arc::new(loader));
        Ok(())
    }

    /// Sets the popup policy.
    pub fn set_popup_policy(&self, policy: PopupPolicy) {
        *self.inner.popup_policy.write() = policy;
    }

    /// Returns the popup policy.
    #[must_use]
    pub fn popup_policy(&self) -> PopupPolicy {
        *self.inner.popup_policy.read()
    }

    /// Delays page loaders after navigation.
    ///
    /// Models a page whose scripts register their listeners some time after
    /// the window exists.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.inner.load_delay.write() = delay;
    }

    /// Returns the open window named `name`.
    #[must_use]
    pub fn window(&self, name: &str) -> Option<Arc<BrowsingContext>> {
        self.inner
            .contexts
            .read()
            .get(name)
            .filter(|context| !context.is_closed())
            .cloned()
    }

    /// Returns the number of open windows.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.inner
            .contexts
            .read()
            .values()
            .filter(|context| !context.is_closed())
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    const CLIENT_URL: &str = "http://localhost:3000/";
    const PLATFORM_URL: &str = "https://platform.example.com/main.jsp?pageId=1";

    #[tokio::test]
    async fn test_open_requires_gesture_by_default() {
        let browser = Browser::new();
        let tab = browser.open_tab(CLIENT_URL).expect("tab");

        assert!(
            browser
                .inner
                .open_window(&tab, PLATFORM_URL, "popup", None)
                .is_none()
        );
        let handle = tab.with_user_gesture(|g| tab.open_window(PLATFORM_URL, "popup", g));
        assert!(handle.is_some());
        assert_eq!(browser.window_count(), 2);
    }

    #[tokio::test]
    async fn test_block_policy() {
        let browser = Browser::new();
        browser.set_popup_policy(PopupPolicy::Block);
        let tab = browser.open_tab(CLIENT_URL).expect("tab");

        let handle = tab.with_user_gesture(|g| tab.open_window(PLATFORM_URL, "popup", g));
        assert!(handle.is_none());
        assert!(browser.window("popup").is_none());
    }

    #[tokio::test]
    async fn test_open_reuses_named_window() {
        let browser = Browser::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        browser
            .on_page_load("https://platform.example.com", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("loader");
        let tab = browser.open_tab(CLIENT_URL).expect("tab");

        tab.with_user_gesture(|g| tab.open_window(PLATFORM_URL, "popup", g));
        tab.with_user_gesture(|g| tab.open_window(PLATFORM_URL, "popup", g));

        assert_eq!(browser.window_count(), 2);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_find_window_never_creates() {
        let browser = Browser::new();
        let tab = browser.open_tab(CLIENT_URL).expect("tab");
        assert!(tab.find_window("popup").is_none());

        tab.with_user_gesture(|g| tab.open_window(PLATFORM_URL, "popup", g));
        assert!(tab.find_window("popup").is_some());

        browser.window("popup").expect("open").close();
        assert!(tab.find_window("popup").is_none());
        assert_eq!(browser.window_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_delay_defers_loader() {
        let browser = Browser::new();
        browser.set_load_delay(Duration::from_millis(700));
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        browser
            .on_page_load("https://platform.example.com", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("loader");
        let tab = browser.open_tab(CLIENT_URL).expect("tab");

        tab.with_user_gesture(|g| tab.open_window(PLATFORM_URL, "popup", g));
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
