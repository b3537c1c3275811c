//! Name → callable registration table.
//!
//! The privileged side registers every function it exposes under its full
//! dotted name once at startup. Lookups never walk an object graph: a name is
//! either registered as a function, registered as a plain value, or absent.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = FunctionRegistry::new();
//! registry.register_fn("_RB.selectQuery", |invocation| async move {
//!     let columns = invocation.value(0).cloned().unwrap_or_default();
//!     Ok(select(columns).await)
//! });
//! registry.register_value("_RB.version", json!("5.2"));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::protocol::Callback;

// ============================================================================
// Argument
// ============================================================================

/// A materialized call argument.
#[derive(Debug, Clone)]
pub enum Argument {
    /// Plain JSON value.
    Value(Value),
    /// Function argument; invoking it reaches the caller.
    Callback(Callback),
}

impl Argument {
    /// Returns the JSON value, if this is one.
    #[inline]
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Callback(_) => None,
        }
    }

    /// Returns the callback, if this is one.
    #[inline]
    #[must_use]
    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            Self::Callback(callback) => Some(callback),
            Self::Value(_) => None,
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// Everything a registered function receives.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Full dotted name that was called.
    pub name: String,
    /// Parent path of `name`; `None` for bare global names.
    pub receiver: Option<String>,
    /// Materialized arguments.
    pub args: Vec<Argument>,
}

impl Invocation {
    /// Creates an invocation, deriving the receiver from `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Argument>) -> Self {
        let name = name.into();
        let receiver = name.rsplit_once('.').map(|(parent, _)| parent.to_string());
        Self {
            name,
            receiver,
            args,
        }
    }

    /// Returns argument `index` as JSON.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.args.get(index).and_then(Argument::as_value)
    }

    /// Returns argument `index` as a callback.
    #[must_use]
    pub fn callback(&self, index: usize) -> Option<&Callback> {
        self.args.get(index).and_then(Argument::as_callback)
    }
}

// ============================================================================
// RemoteFunction
// ============================================================================

/// A function callable across the bridge.
#[async_trait]
pub trait RemoteFunction: Send + Sync {
    /// Runs the function.
    ///
    /// Return [`Error::Execution`] to report a failure; its message is
    /// forwarded to the caller.
    async fn call(&self, invocation: Invocation) -> Result<Value>;
}

/// [`RemoteFunction`] backed by an async closure.
struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> RemoteFunction for AsyncFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, invocation: Invocation) -> Result<Value> {
        (self.0)(invocation).await
    }
}

/// [`RemoteFunction`] backed by a synchronous closure.
struct SyncFn<F>(F);

#[async_trait]
impl<F> RemoteFunction for SyncFn<F>
where
    F: Fn(Invocation) -> Result<Value> + Send + Sync + 'static,
{
    async fn call(&self, invocation: Invocation) -> Result<Value> {
        (self.0)(invocation)
    }
}

// ============================================================================
// FunctionRegistry
// ============================================================================

/// Registered entry.
#[derive(Clone)]
enum Entry {
    Function(Arc<dyn RemoteFunction>),
    Value(Value),
}

/// Registry mapping dotted names to functions and values.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    entries: FxHashMap<String, Entry>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function under `name`.
    pub fn register(&mut self, name: &str, function: impl RemoteFunction + 'static) {
        self.entries
            .insert(name.to_owned(), Entry::Function(Arc::new(function)));
    }

    /// Registers an async closure under `name`.
    pub fn register_fn<F, Fut>(&mut self, name: &str, function: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, AsyncFn(function));
    }

    /// Registers a synchronous closure under `name`.
    pub fn register_sync<F>(&mut self, name: &str, function: F)
    where
        F: Fn(Invocation) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, SyncFn(function));
    }

    /// Registers a plain value under `name`.
    ///
    /// Calling it fails with [`Error::NotAFunction`].
    pub fn register_value(&mut self, name: &str, value: Value) {
        self.entries.insert(name.to_owned(), Entry::Value(value));
    }

    /// Returns the function registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAFunction`] if `name` is absent or a plain value.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RemoteFunction>> {
        match self.entries.get(name) {
            Some(Entry::Function(function)) => Ok(Arc::clone(function)),
            Some(Entry::Value(_)) | None => Err(Error::not_a_function(name)),
        }
    }

    /// Resolves and runs `name`.
    ///
    /// A panic inside the function is reported as [`Error::Execution`].
    ///
    /// # Errors
    ///
    /// - [`Error::NotAFunction`] if `name` does not resolve to a function
    /// - whatever the function returns
    #[instrument(level = "debug", skip(self, args), fields(arg_count = args.len()))]
    pub async fn invoke(&self, name: &str, args: Vec<Argument>) -> Result<Value> {
        let function = self.resolve(name)?;
        run(function, Invocation::new(name, args)).await
    }

    /// Returns the plain value registered under `name`.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.entries.get(name) {
            Some(Entry::Value(value)) => Some(value),
            Some(Entry::Function(_)) | None => None,
        }
    }

    /// Returns `true` if `name` is registered as a function.
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(Entry::Function(_)))
    }

    /// Lists every registered name (sorted).
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Runs a resolved function, converting a panic into an execution error.
pub(crate) async fn run(function: Arc<dyn RemoteFunction>, invocation: Invocation) -> Result<Value> {
    let name = invocation.name.clone();
    match AssertUnwindSafe(function.call(invocation)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!(name = %name, "Remote function panicked");
            Err(Error::execution(format!("{name} panicked")))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RemoteFunction for Echo {
        async fn call(&self, invocation: Invocation) -> Result<Value> {
            Ok(json!({
                "receiver": invocation.receiver,
                "args": invocation.args.iter().filter_map(Argument::as_value).collect::<Vec<_>>(),
            }))
        }
    }

    #[test]
    fn test_receiver_is_parent_path() {
        assert_eq!(
            Invocation::new("_RB.api.selectQuery", vec![]).receiver.as_deref(),
            Some("_RB.api")
        );
        assert_eq!(Invocation::new("rbf_getViewPage", vec![]).receiver, None);
    }

    #[tokio::test]
    async fn test_invoke_registered_function() {
        let mut registry = FunctionRegistry::new();
        registry.register("_RB.echo", Echo);

        let value = registry
            .invoke("_RB.echo", vec![json!(1).into(), json!("a").into()])
            .await
            .expect("ok");
        assert_eq!(value, json!({"receiver": "_RB", "args": [1, "a"]}));
    }

    #[tokio::test]
    async fn test_async_and_sync_closures() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("_RB.double", |invocation| async move {
            let n = invocation.value(0).and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        });
        registry.register_sync("_RB.fail", |_| Err(Error::execution("boom")));

        assert_eq!(
            registry.invoke("_RB.double", vec![json!(21).into()]).await.expect("ok"),
            json!(42)
        );
        let err = registry.invoke("_RB.fail", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_values_and_absent_names_are_not_functions() {
        let mut registry = FunctionRegistry::new();
        registry.register_value("_RB.version", json!("5.2"));

        let err = registry.invoke("_RB.version", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "Not a function: _RB.version");
        assert!(matches!(
            registry.invoke("_RB.nothing", vec![]).await,
            Err(Error::NotAFunction { .. })
        ));
        assert!(!registry.has_function("_RB.version"));
        assert_eq!(registry.value("_RB.version"), Some(&json!("5.2")));
    }

    #[tokio::test]
    async fn test_panic_becomes_execution_error() {
        let mut registry = FunctionRegistry::new();
        registry.register_sync("_RB.crash", |_| panic!("bug"));

        let err = registry.invoke("_RB.crash", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = FunctionRegistry::new();
        registry.register("b", Echo);
        registry.register_value("a", json!(1));
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
