//! Client bridge configuration.
//!
//! Provides [`BridgeConfig`] and a fluent builder for it.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use lcap_bridge::BridgeConfig;
//!
//! # fn example() -> lcap_bridge::Result<()> {
//! let config = BridgeConfig::builder()
//!     .platform_url("https://platform.example.com/prod1/m/main.jsp?pageId=1")
//!     .call_timeout(Duration::from_secs(120))
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! # JSON
//!
//! Durations are given in milliseconds:
//!
//! ```json
//! {
//!   "platform_url": "https://platform.example.com/prod1/m/main.jsp",
//!   "target_origin": "https://platform.example.com",
//!   "window_name": "lcap-dev-bridge",
//!   "call_timeout_ms": 3600000,
//!   "auto_attach": true
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::Origin;

// ============================================================================
// Constants
// ============================================================================

/// Default name of the platform window.
pub const DEFAULT_WINDOW_NAME: &str = "lcap-dev-bridge";

/// Default per-call timeout (60 minutes).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default interval between HELLO reposts.
pub const DEFAULT_HELLO_INTERVAL: Duration = Duration::from_millis(400);

/// Default length of the HELLO burst.
pub const DEFAULT_HELLO_BURST: Duration = Duration::from_secs(5);

/// Default maximum number of live callback registrations.
pub const DEFAULT_CALLBACK_CAPACITY: usize = 1024;

/// Default lifetime of a callback registration.
pub const DEFAULT_CALLBACK_TTL: Duration = Duration::from_secs(60 * 60);

// ============================================================================
// BridgeConfig
// ============================================================================

/// Validated client bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawBridgeConfig")]
pub struct BridgeConfig {
    /// Page on the platform origin opened by `connect_from_click`.
    pub platform_url: Url,
    /// Exact origin every send targets and every receive must come from.
    pub target_origin: Origin,
    /// Name of the platform window.
    pub window_name: String,
    /// Per-call timeout.
    pub call_timeout: Duration,
    /// Attach to an already-open platform window on initialize.
    pub auto_attach: bool,
    /// Interval between HELLO reposts during a burst.
    pub hello_interval: Duration,
    /// Length of the HELLO burst.
    pub hello_burst: Duration,
    /// Maximum number of live callback registrations.
    pub callback_capacity: usize,
    /// Lifetime of a callback registration.
    pub callback_ttl: Duration,
}

impl BridgeConfig {
    /// Creates a new configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value fails validation
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawBridgeConfig = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    /// Returns the call timeout in milliseconds.
    #[inline]
    #[must_use]
    pub fn call_timeout_ms(&self) -> u64 {
        u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

// ============================================================================
// BridgeConfigBuilder
// ============================================================================

/// Builder for [`BridgeConfig`].
///
/// Use [`BridgeConfig::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct BridgeConfigBuilder {
    platform_url: Option<String>,
    target_origin: Option<String>,
    window_name: Option<String>,
    call_timeout: Option<Duration>,
    auto_attach: Option<bool>,
    hello_interval: Option<Duration>,
    hello_burst: Option<Duration>,
    callback_capacity: Option<usize>,
    callback_ttl: Option<Duration>,
}

impl BridgeConfigBuilder {
    /// Creates an empty builder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the platform page to open.
    ///
    /// Any valid page on the platform origin works.
    #[inline]
    #[must_use]
    pub fn platform_url(mut self, url: impl Into<String>) -> Self {
        self.platform_url = Some(url.into());
        self
    }

    /// Sets the platform origin.
    ///
    /// Defaults to the origin of the platform URL.
    #[inline]
    #[must_use]
    pub fn target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = Some(origin.into());
        self
    }

    /// Sets the platform window name.
    #[inline]
    #[must_use]
    pub fn window_name(mut self, name: impl Into<String>) -> Self {
        self.window_name = Some(name.into());
        self
    }

    /// Sets the per-call timeout.
    #[inline]
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Enables or disables attaching to an open window on initialize.
    #[inline]
    #[must_use]
    pub fn auto_attach(mut self, enabled: bool) -> Self {
        self.auto_attach = Some(enabled);
        self
    }

    /// Sets the HELLO repost interval.
    #[inline]
    #[must_use]
    pub fn hello_interval(mut self, interval: Duration) -> Self {
        self.hello_interval = Some(interval);
        self
    }

    /// Sets how long the HELLO burst lasts.
    #[inline]
    #[must_use]
    pub fn hello_burst(mut self, burst: Duration) -> Self {
        self.hello_burst = Some(burst);
        self
    }

    /// Sets the maximum number of live callback registrations.
    #[inline]
    #[must_use]
    pub fn callback_capacity(mut self, capacity: usize) -> Self {
        self.callback_capacity = Some(capacity);
        self
    }

    /// Sets how long a callback registration stays live.
    #[inline]
    #[must_use]
    pub fn callback_ttl(mut self, ttl: Duration) -> Self {
        self.callback_ttl = Some(ttl);
        self
    }

    /// Builds the configuration with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the platform URL is missing or a value is out of range
    /// - [`Error::Url`] if the platform URL is invalid
    /// - [`Error::InvalidOrigin`] if the target origin is invalid
    pub fn build(self) -> Result<BridgeConfig> {
        let platform_url = self.validate_platform_url()?;
        let target_origin = self.validate_target_origin(&platform_url)?;
        let window_name = self.validate_window_name()?;
        let (hello_interval, hello_burst) = self.validate_hello()?;

        let call_timeout = self.call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        if call_timeout.is_zero() {
            return Err(Error::config("Call timeout must be greater than zero"));
        }

        let callback_capacity = self.callback_capacity.unwrap_or(DEFAULT_CALLBACK_CAPACITY);
        if callback_capacity == 0 {
            return Err(Error::config("Callback capacity must be at least 1"));
        }

        let callback_ttl = self.callback_ttl.unwrap_or(DEFAULT_CALLBACK_TTL);
        if callback_ttl.is_zero() {
            return Err(Error::config("Callback TTL must be greater than zero"));
        }

        Ok(BridgeConfig {
            platform_url,
            target_origin,
            window_name,
            call_timeout,
            auto_attach: self.auto_attach.unwrap_or(true),
            hello_interval,
            hello_burst,
            callback_capacity,
            callback_ttl,
        })
    }
}

// ============================================================================
// Validation
// ============================================================================

impl BridgeConfigBuilder {
    /// Validates the platform URL.
    fn validate_platform_url(&self) -> Result<Url> {
        let raw = self.platform_url.as_deref().ok_or_else(|| {
            Error::config(
                "Platform URL is required. Use .platform_url() to set it.\n\
                 Example: BridgeConfig::builder().platform_url(\"https://platform.example.com/main.jsp\")",
            )
        })?;
        Ok(Url::parse(raw)?)
    }

    /// Validates the target origin, deriving it from the URL when unset.
    fn validate_target_origin(&self, platform_url: &Url) -> Result<Origin> {
        match self.target_origin.as_deref() {
            Some(origin) => Origin::parse(origin),
            None => Origin::parse(platform_url.as_str()),
        }
    }

    /// Validates the window name.
    fn validate_window_name(&self) -> Result<String> {
        let name = self
            .window_name
            .clone()
            .unwrap_or_else(|| DEFAULT_WINDOW_NAME.to_string());
        if name.trim().is_empty() {
            return Err(Error::config("Window name must not be empty"));
        }
        Ok(name)
    }

    /// Validates the HELLO burst timing.
    fn validate_hello(&self) -> Result<(Duration, Duration)> {
        let interval = self.hello_interval.unwrap_or(DEFAULT_HELLO_INTERVAL);
        let burst = self.hello_burst.unwrap_or(DEFAULT_HELLO_BURST);
        if interval.is_zero() {
            return Err(Error::config("HELLO interval must be greater than zero"));
        }
        if burst < interval {
            return Err(Error::config(format!(
                "HELLO burst ({}ms) must be at least one interval ({}ms)",
                burst.as_millis(),
                interval.as_millis()
            )));
        }
        Ok((interval, burst))
    }
}

// ============================================================================
// RawBridgeConfig
// ============================================================================

/// JSON form of [`BridgeConfig`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBridgeConfig {
    platform_url: String,
    #[serde(default)]
    target_origin: Option<String>,
    #[serde(default)]
    window_name: Option<String>,
    #[serde(default)]
    call_timeout_ms: Option<u64>,
    #[serde(default)]
    auto_attach: Option<bool>,
    #[serde(default)]
    hello_interval_ms: Option<u64>,
    #[serde(default)]
    hello_burst_ms: Option<u64>,
    #[serde(default)]
    callback_capacity: Option<usize>,
    #[serde(default)]
    callback_ttl_ms: Option<u64>,
}

impl TryFrom<RawBridgeConfig> for BridgeConfig {
    type Error = Error;

    fn try_from(raw: RawBridgeConfig) -> Result<Self> {
        let mut builder = BridgeConfig::builder().platform_url(raw.platform_url);
        builder.target_origin = raw.target_origin;
        builder.window_name = raw.window_name;
        builder.call_timeout = raw.call_timeout_ms.map(Duration::from_millis);
        builder.auto_attach = raw.auto_attach;
        builder.hello_interval = raw.hello_interval_ms.map(Duration::from_millis);
        builder.hello_burst = raw.hello_burst_ms.map(Duration::from_millis);
        builder.callback_capacity = raw.callback_capacity;
        builder.callback_ttl = raw.callback_ttl_ms.map(Duration::from_millis);
        builder.build()
    }
}

// ============================================================================
// Tests
// ============================================================================
