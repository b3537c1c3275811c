//! Development/production call routing.
//!
//! Application code issues every platform call through a [`Dispatcher`].
//! During development the calls travel over the popup bridge; once the
//! application runs inside the platform itself they go straight to the
//! [`FunctionRegistry`].

use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::identifiers::CallbackId;
use crate::protocol::{CallArg, Callback};
use crate::server::{Argument, FunctionRegistry};

use super::popup::PopupClient;

/// Routes calls to the bridge or to an in-process registry.
#[derive(Clone)]
pub enum Dispatcher {
    /// Calls go through the popup bridge.
    Remote(PopupClient),
    /// Calls run in-process.
    Local(Arc<FunctionRegistry>),
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(client) => f.debug_tuple("Remote").field(client).finish(),
            Self::Local(registry) => f.debug_tuple("Local").field(registry).finish(),
        }
    }
}

impl Dispatcher {
    /// Routes through `client`.
    #[inline]
    #[must_use]
    pub fn remote(client: PopupClient) -> Self {
        Self::Remote(client)
    }

    /// Routes to `registry` in-process.
    #[inline]
    #[must_use]
    pub fn local(registry: FunctionRegistry) -> Self {
        Self::Local(Arc::new(registry))
    }

    /// Returns `true` when calls go through the bridge.
    #[inline]
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Calls `name` with `args`.
    ///
    /// Failures are logged and returned unchanged.
    ///
    /// # Errors
    ///
    /// Whatever the bridge or the registered function reports.
    pub fn request(&self, name: &str, args: Vec<CallArg>) -> BoxFuture<'static, Result<Value>> {
        let pending = match self {
            Self::Remote(client) => client.call(name, args),
            Self::Local(registry) => {
                let registry = Arc::clone(registry);
                let name = name.to_string();
                let args = local_arguments(args);
                async move { registry.invoke(&name, args).await }.boxed()
            }
        };

        let name = name.to_string();
        async move {
            pending
                .await
                .inspect_err(|e| warn!(name = %name, error = %e, "Request failed"))
        }
        .boxed()
    }
}

/// Converts client arguments for a direct invocation.
///
/// Function arguments are handed over as callbacks that run the original
/// function in place, numbered by position.
fn local_arguments(args: Vec<CallArg>) -> Vec<Argument> {
    args.into_iter()
        .zip(1u64..)
        .map(|(arg, position)| match arg {
            CallArg::Value(value) => Argument::Value(value),
            CallArg::Callback(function) => Argument::Callback(Callback::new(
                CallbackId::new(position),
                move |args| function(args),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::args;
    use crate::client::BridgeConfig;
    use crate::error::Error;
    use crate::protocol::HostValue;
    use crate::transport::Browser;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register_sync("_RB.describe", |invocation| {
            Ok(json!({
                "receiver": invocation.receiver,
                "first": invocation.value(0).cloned(),
            }))
        });
        registry.register_sync("_RB.progress", |invocation| {
            let callback = invocation
                .callback(0)
                .ok_or_else(|| Error::execution("missing callback"))?;
            callback.invoke(vec![HostValue::Json(json!(1))]);
            callback.invoke(vec![HostValue::Json(json!(2))]);
            Ok(Value::Null)
        });
        registry
    }

    #[tokio::test]
    async fn test_local_passes_receiver_and_values() {
        let dispatcher = Dispatcher::local(registry());
        assert!(!dispatcher.is_remote());

        let value = dispatcher
            .request("_RB.describe", args!["Section"])
            .await
            .expect("ok");
        assert_eq!(value, json!({"receiver": "_RB", "first": "Section"}));
    }

    #[tokio::test]
    async fn test_local_delivers_callbacks_directly() {
        let dispatcher = Dispatcher::local(registry());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        dispatcher
            .request(
                "_RB.progress",
                args![CallArg::callback(move |args| sink.lock().extend(args))],
            )
            .await
            .expect("ok");
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_local_missing_function() {
        let dispatcher = Dispatcher::local(registry());
        let err = dispatcher.request("_RB.nothing", args![]).await.unwrap_err();
        assert!(matches!(err, Error::NotAFunction { .. }));
    }

    #[tokio::test]
    async fn test_remote_without_connection() {
        let browser = Browser::new();
        let tab = browser.open_tab("http://localhost:3000/").expect("tab");
        let config = BridgeConfig::builder()
            .platform_url("https://platform.example.com/main.jsp")
            .build()
            .expect("config");
        let dispatcher = Dispatcher::remote(crate::client::PopupClient::initialize(&tab, config));

        assert!(dispatcher.is_remote());
        let err = dispatcher.request("_RB.describe", args![]).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
