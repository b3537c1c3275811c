//! Normalized web origins.
//!
//! Every send names the exact origin expected to receive it and every receive
//! compares the sender's origin by exact string equality, so origins are
//! normalized once, up front.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Target origin accepted by `post_message` meaning "any receiver".
pub const ANY_ORIGIN: &str = "*";

// ============================================================================
// Origin
// ============================================================================

/// A `scheme://host[:port]` origin.
///
/// Default ports are omitted and the host is lowercased, so two spellings of
/// the same origin compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin(String);

impl Origin {
    /// Parses the origin of a URL or origin string.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the input is not a URL
    /// - [`Error::InvalidOrigin`] if the URL has an opaque origin (`data:`, `file:`)
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input.trim())?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(Error::invalid_origin(input));
        }
        Ok(Self(origin.ascii_serialization()))
    }

    /// The serialized form of an opaque origin.
    pub(crate) fn opaque() -> Self {
        Self(String::from("null"))
    }

    /// Returns the serialized origin.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `other` is exactly this origin.
    #[inline]
    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        self.0 == other
    }

    /// Returns `true` if a message posted with `target_origin` may be delivered here.
    #[inline]
    #[must_use]
    pub fn accepts_target(&self, target_origin: &str) -> bool {
        target_origin == ANY_ORIGIN || self.matches(target_origin)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Origin {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.0
    }
}

// ============================================================================
// Tests
// ============================================================================
