//! Allow-listed call names.
//!
//! A name is permitted if it equals a root, or starts with a root followed
//! by a literal `.`. So root `_RB` admits `_RB` and `_RB.selectQuery` but not
//! `_RBX.selectQuery`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Dotted identifier path, e.g. `_RB` or `app.api`.
const ROOT_PATTERN: &str = r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*)*$";

static ROOT_REGEX: OnceLock<Regex> = OnceLock::new();

fn root_regex() -> &'static Regex {
    ROOT_REGEX.get_or_init(|| Regex::new(ROOT_PATTERN).expect("valid regex pattern"))
}

// ============================================================================
// AllowList
// ============================================================================

/// Immutable set of permitted roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    roots: Vec<String>,
}

impl AllowList {
    /// Creates an allow-list from root names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the list is empty or a root is not a
    /// dotted identifier path.
    pub fn new<I, S>(roots: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut validated: Vec<String> = Vec::new();
        for root in roots {
            let root = root.into();
            if !root_regex().is_match(&root) {
                return Err(Error::config(format!(
                    "Invalid allow-list root '{root}'. Expected a dotted identifier such as '_RB' or 'app.api'"
                )));
            }
            if !validated.contains(&root) {
                validated.push(root);
            }
        }

        if validated.is_empty() {
            return Err(Error::config(
                "Allow-list is empty. Use .allow() to permit at least one root.",
            ));
        }
        Ok(Self { roots: validated })
    }

    /// Returns `true` if `name` is a root or lies under one.
    #[must_use]
    pub fn permits(&self, name: &str) -> bool {
        self.roots.iter().any(|root| {
            name == root
                || name
                    .strip_prefix(root.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Returns the roots in configuration order.
    #[inline]
    #[must_use]
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Returns the roots joined for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        self.roots.join(", ")
    }
}

// ============================================================================
// Tests
// ============================================================================
