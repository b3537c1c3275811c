//! Waiting for the platform's READY.
//!
//! [`ReadinessWaiter`] resolves once a READY envelope reaches the tab. All
//! concurrent waits within one page load share a single listener and a
//! single timer; once READY has been seen, further waits resolve at once with
//! a cached marker.
//!
//! # Outcomes
//!
//! | State | `wait_for_ready` |
//! |-------|------------------|
//! | READY already seen | `{"type": "LCAP_READY", "cached": true}` |
//! | Wait in flight | Joins the in-flight wait |
//! | Idle | Installs a listener and arms the timer |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, ready};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::ListenerId;
use crate::protocol::envelope::READY_TYPE;
use crate::protocol::type_of;
use crate::transport::{BrowsingContext, Origin};

// ============================================================================
// Constants
// ============================================================================

/// Default budget for a readiness wait.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Types
// ============================================================================

/// Settled outcome shared by every coalesced waiter.
#[derive(Debug, Clone)]
enum ReadyOutcome {
    Ready(Value),
    TimedOut { timeout_ms: u64 },
    Cancelled,
}

impl ReadyOutcome {
    fn into_result(self) -> Result<Value> {
        match self {
            Self::Ready(message) => Ok(message),
            Self::TimedOut { timeout_ms } => Err(Error::ready_timeout(timeout_ms)),
            Self::Cancelled => Err(Error::ReadyCancelled),
        }
    }
}

/// The wait currently in flight and the listener serving it.
#[derive(Clone)]
struct InFlight {
    wait: Shared<BoxFuture<'static, ReadyOutcome>>,
    listener: ListenerId,
    timeout_ms: u64,
}

/// Page-global readiness state.
#[derive(Default)]
struct ReadyState {
    /// Set once READY has been observed during this page load.
    ready: AtomicBool,
    /// The wait currently in flight.
    in_flight: Mutex<Option<InFlight>>,
}

// ============================================================================
// ReadinessWaiter
// ============================================================================

/// Waits for READY on one tab.
#[derive(Clone)]
pub struct ReadinessWaiter {
    context: Arc<BrowsingContext>,
    state: Arc<ReadyState>,
}

impl fmt::Debug for ReadinessWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessWaiter")
            .field("tab", &self.context.name())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ReadinessWaiter {
    /// Creates a waiter for `context`.
    ///
    /// Waiters created during the same page load share their state.
    #[must_use]
    pub fn new(context: &Arc<BrowsingContext>) -> Self {
        Self {
            context: Arc::clone(context),
            state: context.global::<ReadyState>(),
        }
    }

    /// Returns `true` once READY has been observed during this page load.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    /// Waits until a READY envelope arrives.
    ///
    /// Only READY from `expected_origin` counts; any origin counts when it is
    /// `None`. A caller joining an in-flight wait shares its timeout and
    /// origin.
    ///
    /// # Errors
    ///
    /// - [`Error::ReadyTimeout`] if no READY arrives within `timeout`
    /// - [`Error::ReadyCancelled`] if the wait is cancelled or the page unloads
    /// - [`Error::InvalidOrigin`] if `expected_origin` is not a valid origin
    pub fn wait_for_ready(
        &self,
        timeout: Duration,
        expected_origin: Option<&str>,
    ) -> BoxFuture<'static, Result<Value>> {
        if self.is_ready() {
            trace!("READY already observed");
            return ready(Ok(cached_marker())).boxed();
        }

        let expected = match expected_origin.map(Origin::parse).transpose() {
            Ok(expected) => expected,
            Err(e) => return ready(Err(e)).boxed(),
        };

        let wait = {
            let mut in_flight = self.state.in_flight.lock();
            match in_flight.as_ref() {
                Some(current) => {
                    trace!(
                        shared_timeout_ms = current.timeout_ms,
                        ignored_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Joining in-flight READY wait"
                    );
                    current.wait.clone()
                }
                None => {
                    let current = self.start(timeout, expected);
                    let wait = current.wait.clone();
                    *in_flight = Some(current);
                    wait
                }
            }
        };

        wait.map(ReadyOutcome::into_result).boxed()
    }

    /// Abandons the wait in flight, if any.
    ///
    /// Its listener is removed at once and every caller sharing it fails with
    /// [`Error::ReadyCancelled`]. The next [`wait_for_ready`](Self::wait_for_ready)
    /// starts a fresh wait with its own budget. Returns `false` if nothing
    /// was in flight.
    pub fn cancel(&self) -> bool {
        let Some(current) = self.state.in_flight.lock().take() else {
            return false;
        };
        self.context.remove_listener(current.listener);
        debug!(tab = %self.context.name(), "READY wait cancelled");
        true
    }

    /// Installs the listener and the timer for a new wait.
    fn start(&self, timeout: Duration, expected: Option<Origin>) -> InFlight {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let (ready_tx, ready_rx) = oneshot::channel::<Value>();
        let ready_tx = Mutex::new(Some(ready_tx));

        let listener = self.context.add_listener(move |event| {
            if let Some(expected) = &expected
                && !expected.matches(&event.origin)
            {
                return;
            }
            if type_of(&event.data) != Some(READY_TYPE) {
                return;
            }
            if let Some(tx) = ready_tx.lock().take() {
                let _ = tx.send(event.data.clone());
            }
        });
        debug!(tab = %self.context.name(), timeout_ms, "Waiting for READY");

        let context = Arc::downgrade(&self.context);
        let state = Arc::clone(&self.state);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, ready_rx).await {
                Ok(Ok(message)) => {
                    state.ready.store(true, Ordering::SeqCst);
                    debug!("READY observed");
                    ReadyOutcome::Ready(message)
                }
                Ok(Err(_)) => {
                    debug!("READY listener removed before READY");
                    ReadyOutcome::Cancelled
                }
                Err(_) => {
                    debug!(timeout_ms, "Timed out waiting for READY");
                    ReadyOutcome::TimedOut { timeout_ms }
                }
            };

            if let Some(context) = context.upgrade() {
                context.remove_listener(listener);
            }
            {
                let mut in_flight = state.in_flight.lock();
                if in_flight
                    .as_ref()
                    .is_some_and(|current| current.listener == listener)
                {
                    *in_flight = None;
                }
            }
            let _ = done_tx.send(outcome);
        });

        let wait = async move { done_rx.await.unwrap_or(ReadyOutcome::Cancelled) }
            .boxed()
            .shared();
        InFlight {
            wait,
            listener,
            timeout_ms,
        }
    }
}

/// Value returned once READY has already been seen.
fn cached_marker() -> Value {
    json!({ "type": READY_TYPE, "cached": true })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::{assert_err, assert_ok};

    use crate::transport::Browser;

    const PLATFORM_ORIGIN: &str = "https://platform.example.com";

    fn tabs() -> (Arc<BrowsingContext>, Arc<BrowsingContext>) {
        let browser = Browser::new();
        let client = browser.open_tab("http://localhost:3000/").expect("client");
        let platform = browser
            .open_tab("https://platform.example.com/main.jsp")
            .expect("platform");
        (client, platform)
    }

    fn send_ready(client: &Arc<BrowsingContext>, from: &Arc<BrowsingContext>) {
        client
            .handle_for(from)
            .post_message(json!({"type": "LCAP_READY", "nonce": "n1"}), "*")
            .expect("post");
    }

    #[tokio::test]
    async fn test_concurrent_waits_share_one_listener() {
        let (client, platform) = tabs();
        let waiter = ReadinessWaiter::new(&client);
        let other = ReadinessWaiter::new(&client);

        let first = waiter.wait_for_ready(DEFAULT_READY_TIMEOUT, Some(PLATFORM_ORIGIN));
        let second = other.wait_for_ready(DEFAULT_READY_TIMEOUT, None);
        assert_eq!(client.listener_count(), 1);

        send_ready(&client, &platform);
        let (a, b) = tokio::join!(first, second);
        let a = assert_ok!(a);
        assert_eq!(a, assert_ok!(b));
        assert_eq!(a["nonce"], "n1");

        tokio::task::yield_now().await;
        assert_eq!(client.listener_count(), 0);
        assert!(waiter.is_ready());
    }

    #[tokio::test]
    async fn test_cached_after_ready() {
        let (client, platform) = tabs();
        let waiter = ReadinessWaiter::new(&client);
        let wait = waiter.wait_for_ready(DEFAULT_READY_TIMEOUT, None);
        send_ready(&client, &platform);
        assert_ok!(wait.await);

        let cached = assert_ok!(waiter.wait_for_ready(DEFAULT_READY_TIMEOUT, None).await);
        assert_eq!(cached, json!({"type": "LCAP_READY", "cached": true}));
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_and_retry_succeeds() {
        let (client, platform) = tabs();
        let waiter = ReadinessWaiter::new(&client);

        let err = assert_err!(
            waiter
                .wait_for_ready(Duration::from_millis(1200), Some(PLATFORM_ORIGIN))
                .await
        );
        assert!(matches!(err, Error::ReadyTimeout { timeout_ms: 1200 }));
        assert_eq!(client.listener_count(), 0);
        assert!(!waiter.is_ready());

        let retry = waiter.wait_for_ready(Duration::from_millis(1200), Some(PLATFORM_ORIGIN));
        send_ready(&client, &platform);
        assert_ok!(retry.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_from_other_origin_ignored() {
        let (client, _platform) = tabs();
        let evil = Browser::new()
            .open_tab("https://evil.example.com/")
            .expect("evil");
        let waiter = ReadinessWaiter::new(&client);

        let wait = waiter.wait_for_ready(Duration::from_secs(1), Some(PLATFORM_ORIGIN));
        send_ready(&client, &evil);
        assert!(wait.await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_invalid_expected_origin() {
        let (client, _platform) = tabs();
        let waiter = ReadinessWaiter::new(&client);

        let result = waiter
            .wait_for_ready(DEFAULT_READY_TIMEOUT, Some("not an origin"))
            .await;
        assert!(result.is_err());
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_frees_the_slot() {
        let (client, platform) = tabs();
        let waiter = ReadinessWaiter::new(&client);
        assert!(!waiter.cancel());

        let stale = waiter.wait_for_ready(Duration::from_secs(15), Some(PLATFORM_ORIGIN));
        assert_eq!(client.listener_count(), 1);
        assert!(waiter.cancel());
        assert_eq!(client.listener_count(), 0);
        assert!(matches!(stale.await, Err(Error::ReadyCancelled)));

        tokio::time::sleep(Duration::from_secs(14)).await;
        let fresh = waiter.wait_for_ready(Duration::from_secs(15), Some(PLATFORM_ORIGIN));
        tokio::time::sleep(Duration::from_secs(5)).await;
        send_ready(&client, &platform);
        assert_ok!(fresh.await);
    }

    #[tokio::test]
    async fn test_reload_resets_readiness() {
        let (client, platform) = tabs();
        let wait = ReadinessWaiter::new(&client).wait_for_ready(DEFAULT_READY_TIMEOUT, None);
        send_ready(&client, &platform);
        assert_ok!(wait.await);

        client.reload();
        assert!(!ReadinessWaiter::new(&client).is_ready());
    }
}
