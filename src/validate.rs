//! Schema name validation
//!
//! Experiment names double as partition identifiers in the datastore and are
//! interpolated into identifiers (never bound as query values), so every
//! boundary that accepts a name from outside must go through
//! [`validate_schema_name`]. [`PartitionName`] can only be constructed by
//! passing the validator, which lets the rest of the crate take it as proof.
//!
//! Partition identifiers are case-insensitive in the datastore, so a
//! [`PartitionName`] is folded to lowercase: `Exp_A` and `exp_a` name the
//! same experiment everywhere.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Returns `true` if `name` is safe to use as a partition identifier.
///
/// Valid names are non-empty, contain only ASCII letters, digits and
/// underscores, and do not start with a digit.
///
/// ```rust
/// use labrelay::validate::validate_schema_name;
///
/// assert!(validate_schema_name("my_experiment_123"));
/// assert!(!validate_schema_name("test-experiment"));
/// assert!(!validate_schema_name("123experiment"));
/// ```
#[must_use]
pub fn validate_schema_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A validated, lowercase experiment/partition name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PartitionName(String);

impl PartitionName {
    /// Validate `name` and wrap its lowercase form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] if the name fails [`validate_schema_name`].
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let mut name = name.into();
        if validate_schema_name(&name) {
            name.make_ascii_lowercase();
            Ok(Self(name))
        } else {
            Err(Error::InvalidName(name))
        }
    }

    /// Borrow the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PartitionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for PartitionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for PartitionName {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}
