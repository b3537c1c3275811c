//! Server listener configuration.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::transport::Origin;

use super::allow_list::AllowList;

/// Validated listener configuration.
///
/// JSON form:
///
/// ```json
/// { "trusted_origin": "http://localhost:3000", "roots": ["_RB", "rbf_getViewPage"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    /// The only origin whose messages are processed.
    pub trusted_origin: Origin,
    /// Permitted call names.
    pub allow_list: AllowList,
}

impl ServerConfig {
    /// Creates a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin or a root is invalid.
    pub fn new<I, S>(trusted_origin: &str, roots: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            trusted_origin: Origin::parse(trusted_origin)?,
            allow_list: AllowList::new(roots)?,
        })
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] / [`Error::InvalidOrigin`] if a value fails validation
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawServerConfig = serde_json::from_str(json)?;
        Self::try_from(raw)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServerConfig {
    trusted_origin: String,
    roots: Vec<String>,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = Error;

    fn try_from(raw: RawServerConfig) -> Result<Self> {
        Self::new(&raw.trusted_origin, raw.roots)
    }
}
