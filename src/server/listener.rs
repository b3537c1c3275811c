//! Server end of the bridge.
//!
//! [`ServerListener`] runs in the privileged page. It accepts messages from
//! exactly one trusted origin, arms itself on HELLO and executes allow-listed
//! CALLs against a [`FunctionRegistry`].
//!
//! # Handshake State
//!
//! ```text
//!            HELLO(n)               HELLO(m)
//! Unarmed ───────────► Armed(n) ───────────► Armed(m)
//! ```
//!
//! The last HELLO always wins. CALLs are executed only while armed and only
//! when they carry the active nonce.
//!
//! # Replies
//!
//! Every CALL that can be attributed to the trusted origin is answered with
//! exactly one RESULT, carrying the best-known call id (`null` when the id
//! itself could not be read) and the nonce the CALL was sent with.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{CallId, CallbackId, ListenerId, Nonce};
use crate::protocol::envelope::HELLO_TYPE;
use crate::protocol::{
    CallMessage, Callback, CallbackMessage, Envelope, ResultMessage, is_call,
    parse_callback_token, type_of,
};
use crate::transport::{BrowsingContext, MessageEvent, Origin, WindowHandle};

use super::allow_list::AllowList;
use super::config::ServerConfig;
use super::registry::{Argument, FunctionRegistry, Invocation, RemoteFunction, run};

// ============================================================================
// HandshakeState
// ============================================================================

/// Handshake state of one installed listener.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// No HELLO received yet.
    #[default]
    Unarmed,
    /// Armed with the nonce of the most recent HELLO.
    Armed(Nonce),
}

// ============================================================================
// ServerListener
// ============================================================================

/// Shared listener configuration.
struct ListenerInner {
    config: ServerConfig,
    registry: Arc<FunctionRegistry>,
}

/// RPC listener for the privileged page.
///
/// Cheap to clone. Install it on each page load with
/// [`install`](Self::install).
///
/// # Example
///
/// ```ignore
/// let listener = ServerListener::builder()
///     .trusted_origin("http://localhost:3000")
///     .allow("_RB")
///     .allow("rbf_getViewPage")
///     .registry(registry)
///     .build()?;
///
/// browser.on_page_load("https://platform.example.com", move |page| {
///     listener.install(page);
/// })?;
/// ```
#[derive(Clone)]
pub struct ServerListener {
    inner: Arc<ListenerInner>,
}

impl fmt::Debug for ServerListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerListener")
            .field("trusted_origin", &self.inner.config.trusted_origin)
            .field("roots", &self.inner.config.allow_list.roots())
            .finish_non_exhaustive()
    }
}

impl ServerListener {
    /// Creates a new listener builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ServerListenerBuilder {
        ServerListenerBuilder::new()
    }

    /// Creates a listener from a validated configuration.
    #[must_use]
    pub fn new(config: ServerConfig, registry: FunctionRegistry) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                config,
                registry: Arc::new(registry),
            }),
        }
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Installs the listener on a page, starting unarmed.
    pub fn install(&self, page: &Arc<BrowsingContext>) -> ListenerHandle {
        let state = Arc::new(Mutex::new(HandshakeState::Unarmed));

        let inner = Arc::clone(&self.inner);
        let listener_state = Arc::clone(&state);
        let id = page.add_listener(move |event| inner.handle(&listener_state, event));

        info!(
            page = %page.name(),
            trusted_origin = %self.inner.config.trusted_origin,
            roots = %self.inner.config.allow_list.describe(),
            "RPC listener installed"
        );

        ListenerHandle {
            id,
            page: Arc::downgrade(page),
            state,
        }
    }
}

// ============================================================================
// ListenerInner - Dispatch
// ============================================================================

impl ListenerInner {
    /// Routes one inbound message.
    fn handle(&self, state: &Mutex<HandshakeState>, event: &MessageEvent) {
        if !self.config.trusted_origin.matches(&event.origin) {
            trace!(origin = %event.origin, "Untrusted origin ignored");
            return;
        }
        let Some(source) = event.source.clone() else {
            trace!("Message without source ignored");
            return;
        };

        match type_of(&event.data) {
            Some(HELLO_TYPE) => self.handle_hello(state, &event.data, source.as_ref()),
            _ if is_call(&event.data) => self.handle_call(state, &event.data, source),
            _ => trace!("Non-bridge message ignored"),
        }
    }

    /// Arms with the HELLO nonce and answers READY to the sender.
    fn handle_hello(&self, state: &Mutex<HandshakeState>, data: &Value, source: &dyn WindowHandle) {
        let nonce = match Envelope::from_value(data) {
            Ok(Envelope::Hello { nonce }) => nonce,
            _ => {
                trace!("HELLO without nonce ignored");
                return;
            }
        };

        let previous = std::mem::replace(&mut *state.lock(), HandshakeState::Armed(nonce.clone()));
        match previous {
            HandshakeState::Armed(old) if old != nonce => {
                info!(displaced = %old, "Handshake replaced the active nonce");
            }
            HandshakeState::Armed(_) => trace!("Handshake repeated"),
            HandshakeState::Unarmed => debug!("Listener armed"),
        }

        post(
            source,
            &self.config.trusted_origin,
            &Envelope::Ready { nonce: Some(nonce) },
        );
    }

    /// Validates a CALL and executes it off the event loop.
    fn handle_call(
        &self,
        state: &Mutex<HandshakeState>,
        data: &Value,
        source: Arc<dyn WindowHandle>,
    ) {
        let call = match Envelope::from_value(data) {
            Ok(Envelope::Call(call)) => call,
            Ok(_) => return,
            Err(e) => {
                let id = data
                    .get("id")
                    .and_then(|id| serde_json::from_value::<CallId>(id.clone()).ok());
                debug!(call_id = ?id, error = %e, "Malformed call rejected");
                self.reply(source.as_ref(), ResultMessage::failure(id, e.to_string(), None));
                return;
            }
        };

        let function = match self.validate(state, &call) {
            Ok(function) => function,
            Err(e) => {
                debug!(call_id = %call.id, name = %call.name, error = %e, "Call rejected");
                self.reply(
                    source.as_ref(),
                    ResultMessage::failure(Some(call.id), e.to_string(), call.nonce),
                );
                return;
            }
        };

        let CallMessage {
            id, name, args, nonce, ..
        } = call;
        debug!(call_id = %id, name = %name, "Executing call");

        let args = self.materialize(id, args, nonce.as_ref(), &source);
        let invocation = Invocation::new(name, args);
        let target = self.config.trusted_origin.clone();

        tokio::spawn(async move {
            let reply = match run(function, invocation).await {
                Ok(result) => ResultMessage::success(id, result, nonce),
                Err(e) => {
                    debug!(call_id = %id, error = %e, "Call failed");
                    ResultMessage::failure(Some(id), e.to_string(), nonce)
                }
            };
            post(source.as_ref(), &target, &Envelope::Result(reply));
        });
    }

    /// Applies the nonce gate, the name checks and resolution.
    fn validate(
        &self,
        state: &Mutex<HandshakeState>,
        call: &CallMessage,
    ) -> Result<Arc<dyn RemoteFunction>> {
        match &*state.lock() {
            HandshakeState::Unarmed => return Err(Error::HandshakeRequired),
            HandshakeState::Armed(active) if call.nonce.as_ref() != Some(active) => {
                return Err(Error::StaleNonce);
            }
            HandshakeState::Armed(_) => {}
        }

        if call.name.is_empty() {
            return Err(Error::MissingName);
        }
        let allow_list: &AllowList = &self.config.allow_list;
        if !allow_list.permits(&call.name) {
            return Err(Error::name_not_allowed(&call.name, allow_list.describe()));
        }
        self.registry.resolve(&call.name)
    }

    /// Turns callback tokens into callbacks that post back to the caller.
    fn materialize(
        &self,
        call_id: CallId,
        args: Vec<Value>,
        nonce: Option<&Nonce>,
        source: &Arc<dyn WindowHandle>,
    ) -> Vec<Argument> {
        args.into_iter()
            .map(|arg| match parse_callback_token(&arg) {
                Some(callback_id) => Argument::Callback(self.callback(
                    call_id,
                    callback_id,
                    nonce.cloned(),
                    Arc::clone(source),
                )),
                None => Argument::Value(arg),
            })
            .collect()
    }

    /// Builds the callback for one token.
    fn callback(
        &self,
        call_id: CallId,
        callback_id: CallbackId,
        nonce: Option<Nonce>,
        source: Arc<dyn WindowHandle>,
    ) -> Callback {
        let target = self.config.trusted_origin.clone();
        Callback::new(callback_id, move |args| {
            let message = Envelope::CallbackInvoke(CallbackMessage {
                id: call_id,
                callback: callback_id,
                args,
                nonce: nonce.clone(),
            });
            post(source.as_ref(), &target, &message);
        })
    }

    fn reply(&self, source: &dyn WindowHandle, result: ResultMessage) {
        post(source, &self.config.trusted_origin, &Envelope::Result(result));
    }
}

/// Posts an envelope to the trusted origin, logging failures.
fn post(target: &dyn WindowHandle, origin: &Origin, envelope: &Envelope) {
    let result = envelope
        .to_value()
        .and_then(|value| target.post_message(value, origin.as_str()));
    if let Err(e) = result {
        warn!(kind = envelope.type_tag(), error = %e, "Failed to post reply");
    }
}

// ============================================================================
// ListenerHandle
// ============================================================================

/// One installation of a [`ServerListener`] on a page.
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    page: Weak<BrowsingContext>,
    state: Arc<Mutex<HandshakeState>>,
}

impl ListenerHandle {
    /// Returns the listener id on the page.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns the handshake state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state.lock().clone()
    }

    /// Returns the nonce CALLs must carry, once armed.
    #[must_use]
    pub fn active_nonce(&self) -> Option<Nonce> {
        match &*self.state.lock() {
            HandshakeState::Armed(nonce) => Some(nonce.clone()),
            HandshakeState::Unarmed => None,
        }
    }

    /// Removes the listener from its page.
    ///
    /// Returns `false` if the page is gone or already reloaded.
    pub fn uninstall(&self) -> bool {
        self.page
            .upgrade()
            .is_some_and(|page| page.remove_listener(self.id))
    }
}

// ============================================================================
// ServerListenerBuilder
// ============================================================================

/// Builder for [`ServerListener`].
#[derive(Debug, Default)]
pub struct ServerListenerBuilder {
    trusted_origin: Option<String>,
    roots: Vec<String>,
    registry: Option<FunctionRegistry>,
}

impl ServerListenerBuilder {
    /// Creates an empty builder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the only origin whose messages are processed.
    #[inline]
    #[must_use]
    pub fn trusted_origin(mut self, origin: impl Into<String>) -> Self {
        self.trusted_origin = Some(origin.into());
        self
    }

    /// Permits a root name and everything under it.
    #[inline]
    #[must_use]
    pub fn allow(mut self, root: impl Into<String>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Sets the callable registry.
    #[inline]
    #[must_use]
    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the listener with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no trusted origin or no root is set
    /// - [`Error::InvalidOrigin`] / [`Error::Url`] if the origin is invalid
    pub fn build(self) -> Result<ServerListener> {
        let origin = self.trusted_origin.ok_or_else(|| {
            Error::config(
                "Trusted origin is required. Use .trusted_origin() to set it.\n\
                 Example: ServerListener::builder().trusted_origin(\"http://localhost:3000\")",
            )
        })?;
        let config = ServerConfig::new(&origin, self.roots)?;
        let registry = self.registry.unwrap_or_default();

        let names = registry.names();
        for root in config.allow_list.roots() {
            let prefix = format!("{root}.");
            if !names.iter().any(|name| name == root || name.starts_with(&prefix)) {
                debug!(root = %root, "Allow-listed root has no registered entries");
            }
        }

        Ok(ServerListener::new(config, registry))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use crate::args;
    use crate::client::{BridgeConfig, PopupClient};
    use crate::protocol::{CallArg, HostValue};
    use crate::transport::Browser;

    const CLIENT_URL: &str = "http://localhost:3000/";
    const CLIENT_ORIGIN: &str = "http://localhost:3000";
    const PLATFORM_URL: &str = "https://platform.example.com/main.jsp";

    fn registry(invoked: Arc<PlMutex<Vec<String>>>) -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        let log = Arc::clone(&invoked);
        registry.register_sync("_RB.selectQuery", move |invocation| {
            log.lock().push(invocation.name.clone());
            Ok(json!([{"id": 1, "name": "Ops"}]))
        });
        let log = Arc::clone(&invoked);
        registry.register_sync("_RBX.evil", move |invocation| {
            log.lock().push(invocation.name.clone());
            Ok(json!("pwned"))
        });
        registry.register_value("_RB.version", json!("5.2"));
        registry.register_fn("_RB.job", |invocation| async move {
            let Some(callback) = invocation.callback(1).cloned() else {
                return Err(Error::execution("missing progress callback"));
            };
            callback.invoke(vec![HostValue::Json(json!(10))]);
            callback.invoke(vec![
                HostValue::Json(json!(100)),
                HostValue::Function(Arc::new(|_: Vec<Value>| {})),
            ]);
            Ok(json!("done"))
        });
        registry.register_sync("_RB.fail", |_| Err(Error::execution("boom")));
        registry
    }

    fn listener(invoked: Arc<PlMutex<Vec<String>>>) -> ServerListener {
        ServerListener::builder()
            .trusted_origin(CLIENT_ORIGIN)
            .allow("_RB")
            .allow("rbf_getViewPage")
            .registry(registry(invoked))
            .build()
            .expect("listener")
    }

    /// Client tab recording every message it receives, plus the platform page.
    struct Harness {
        page: Arc<BrowsingContext>,
        handle: ListenerHandle,
        client_tab: Arc<BrowsingContext>,
        inbox: UnboundedReceiver<Value>,
        invoked: Arc<PlMutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            let browser = Browser::new();
            let invoked = Arc::new(PlMutex::new(Vec::new()));
            let page = browser.open_tab(PLATFORM_URL).expect("page");
            let handle = listener(Arc::clone(&invoked)).install(&page);

            let client_tab = browser.open_tab(CLIENT_URL).expect("tab");
            let (tx, inbox) = unbounded_channel();
            client_tab.add_listener(move |event| {
                let _ = tx.send(event.data.clone());
            });

            Self {
                page,
                handle,
                client_tab,
                inbox,
                invoked,
            }
        }

        fn send(&self, message: Value) {
            self.page
                .handle_for(&self.client_tab)
                .post_message(message, "https://platform.example.com")
                .expect("post");
        }

        async fn hello(&mut self, nonce: &str) {
            self.send(json!({"type": "LCAP_HELLO", "nonce": nonce}));
            let ready = self.next().await;
            assert_eq!(ready, json!({"type": "LCAP_READY", "nonce": nonce}));
        }

        async fn next(&mut self) -> Value {
            self.inbox.recv().await.expect("reply")
        }
    }

    #[tokio::test]
    async fn test_hello_arms_and_replies_ready() {
        let mut harness = Harness::new();
        assert_eq!(harness.handle.state(), HandshakeState::Unarmed);

        harness.hello("a").await;
        assert_eq!(harness.handle.active_nonce(), Some(Nonce::from("a")));
    }

    #[tokio::test]
    async fn test_call_before_handshake_rejected() {
        let mut harness = Harness::new();
        harness.send(json!({"type": "LCAP_RPC", "id": 1, "name": "_RB.selectQuery", "nonce": "a"}));

        let reply = harness.next().await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["error"], "RPC rejected: no handshake yet");
        assert!(harness.invoked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_last_hello_wins() {
        let mut harness = Harness::new();
        harness.hello("a").await;

        // A second tab on the trusted origin takes over the handshake.
        let other_tab = Browser::new().open_tab(CLIENT_URL).expect("other tab");
        let (tx, mut other_inbox) = unbounded_channel();
        other_tab.add_listener(move |event| {
            let _ = tx.send(event.data.clone());
        });
        harness
            .page
            .handle_for(&other_tab)
            .post_message(
                json!({"type": "LCAP_HELLO", "nonce": "b"}),
                "https://platform.example.com",
            )
            .expect("post");
        let ready = other_inbox.recv().await.expect("ready");
        assert_eq!(ready, json!({"type": "LCAP_READY", "nonce": "b"}));
        assert_eq!(harness.handle.active_nonce(), Some(Nonce::from("b")));

        harness.send(json!({"type": "LCAP_RPC", "id": 1, "name": "_RB.selectQuery", "nonce": "a"}));
        let reply = harness.next().await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "RPC rejected: stale or missing nonce");
        assert_eq!(reply["nonce"], "a");

        harness.send(json!({"type": "LCAP_RPC", "id": 2, "name": "_RB.selectQuery"}));
        let reply = harness.next().await;
        assert_eq!(reply["ok"], false);
        assert!(harness.invoked.lock().is_empty());
        assert!(other_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_successful_call() {
        let mut harness = Harness::new();
        harness.hello("a").await;

        harness.send(json!({
            "type": "LCAP_RPC", "id": 7, "root": "_RB", "name": "_RB.selectQuery",
            "args": [["id", "name"], "Section", "", 100, true], "nonce": "a"
        }));
        let reply = harness.next().await;
        assert_eq!(
            reply,
            json!({
                "type": "LCAP_RPC_RESULT", "id": 7, "ok": true,
                "result": [{"id": 1, "name": "Ops"}], "nonce": "a"
            })
        );
    }

    #[tokio::test]
    async fn test_validation_failures() {
        let mut harness = Harness::new();
        harness.hello("a").await;

        let cases = [
            (json!({"type": "LCAP_RPC", "id": 1, "nonce": "a"}), "RPC missing \"name\""),
            (
                json!({"type": "LCAP_RPC_CALL", "id": 2, "name": "_RBX.evil", "nonce": "a"}),
                "RPC name must start with/equals one of: _RB, rbf_getViewPage",
            ),
            (
                json!({"type": "LCAP_RPC", "id": 3, "name": "_RB.version", "nonce": "a"}),
                "Not a function: _RB.version",
            ),
            (
                json!({"type": "LCAP_RPC", "id": 4, "name": "rbf_getViewPage", "nonce": "a"}),
                "Not a function: rbf_getViewPage",
            ),
            (json!({"type": "LCAP_RPC", "id": 5, "name": "_RB.fail", "nonce": "a"}), "boom"),
        ];

        for (message, expected) in cases {
            let id = message["id"].clone();
            harness.send(message);
            let reply = harness.next().await;
            assert_eq!(reply["ok"], false);
            assert_eq!(reply["id"], id);
            assert_eq!(reply["error"], expected);
        }
        assert!(harness.invoked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_call_gets_best_known_id() {
        let mut harness = Harness::new();
        harness.hello("a").await;

        harness.send(json!({"type": "LCAP_RPC", "id": 9, "name": "_RB.selectQuery", "args": "x"}));
        let reply = harness.next().await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["id"], 9);

        harness.send(json!({"type": "LCAP_RPC", "name": "_RB.selectQuery"}));
        let reply = harness.next().await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_untrusted_origin_and_noise_ignored() {
        let mut harness = Harness::new();
        harness.send(json!({"type": "webpackOk"}));
        harness.send(json!("noise"));

        let evil = Browser::new().open_tab("https://evil.example.com/").expect("tab");
        harness
            .page
            .handle_for(&evil)
            .post_message(json!({"type": "LCAP_HELLO", "nonce": "x"}), "*")
            .expect("post");

        harness.hello("a").await;
        assert_eq!(harness.handle.active_nonce(), Some(Nonce::from("a")));
    }

    #[tokio::test]
    async fn test_callback_tokens_post_back() {
        let mut harness = Harness::new();
        harness.hello("a").await;

        harness.send(json!({
            "type": "LCAP_RPC", "id": 3, "name": "_RB.job",
            "args": ["export", {"callback": 7}], "nonce": "a"
        }));

        let first = harness.next().await;
        let second = harness.next().await;
        let result = harness.next().await;

        assert_eq!(
            first,
            json!({"type": "LCAP_RPC_CB", "id": 3, "callback": 7, "args": [10], "nonce": "a"})
        );
        assert_eq!(second["callback"], 7);
        assert_eq!(
            second["args"],
            json!([100, {"__type": "function", "note": "omitted"}])
        );
        assert_eq!(result["ok"], true);
        assert_eq!(result["result"], "done");
    }

    #[tokio::test]
    async fn test_uninstall() {
        let harness = Harness::new();
        assert!(harness.handle.uninstall());
        assert!(!harness.handle.uninstall());
        assert_eq!(harness.page.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_with_popup_client() {
        let browser = Browser::new();
        let invoked = Arc::new(PlMutex::new(Vec::new()));
        let server = listener(Arc::clone(&invoked));
        browser
            .on_page_load("https://platform.example.com", move |page| {
                server.install(page);
            })
            .expect("loader");

        let tab = browser.open_tab(CLIENT_URL).expect("tab");
        let config = BridgeConfig::builder()
            .platform_url(PLATFORM_URL)
            .build()
            .expect("config");
        let client = PopupClient::initialize(&tab, config);
        tab.with_user_gesture(|g| client.connect_from_click(g))
            .expect("connect");

        let rows = client
            .call(
                "_RB.selectQuery",
                args![["id", "name"], "EA_SA_OperationsSection", "", 100, true],
            )
            .await
            .expect("rows");
        assert_eq!(rows, json!([{"id": 1, "name": "Ops"}]));
        assert!(client.is_connected());

        let progress = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        let done = client
            .call(
                "_RB.job",
                args!["export", CallArg::callback(move |args| sink.lock().push(args))],
            )
            .await
            .expect("job");
        assert_eq!(done, json!("done"));
        assert_eq!(progress.lock().len(), 2);

        let err = client.call("_RBX.evil", args![]).await.unwrap_err();
        assert!(err.to_string().starts_with("RPC name must start with/equals one of"));
        assert_eq!(*invoked.lock(), vec!["_RB.selectQuery".to_string()]);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(client.pending_count(), 0);
    }
}
