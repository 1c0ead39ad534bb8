//! Addresses of stored blobs and of nodes inside bundles.
//!
//! A [`BlobLocator`] is assigned by the storage backend when a blob is
//! written and never changes afterwards. A [`NodeLocator`] narrows it down
//! to one export of the bundle stored in that blob.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Characters that may not appear in a blob locator.
const FORBIDDEN_CHARS: &[char] = &[' ', '\t', '\n', '\r', '#', '\\'];

/// Backend-assigned identifier of a stored blob.
///
/// Cheap to clone; the text is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobLocator(Arc<str>);

impl BlobLocator {
    /// Validate and wrap a locator string.
    ///
    /// ```
    /// use arbor_types::BlobLocator;
    ///
    /// assert!(BlobLocator::new("bundles/0001").is_ok());
    /// assert!(BlobLocator::new("").is_err());
    /// assert!(BlobLocator::new("a/../b").is_err());
    /// ```
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        validate_locator(&value)?;
        Ok(Self(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Locator of one export inside the bundle stored at this blob.
    pub fn node(&self, export_index: usize) -> NodeLocator {
        NodeLocator::new(self.clone(), export_index)
    }
}

fn validate_locator(value: &str) -> Result<(), TypeError> {
    let fail = |reason: &str| {
        Err(TypeError::InvalidLocator {
            value: value.to_string(),
            reason: reason.to_string(),
        })
    };

    if value.is_empty() {
        return fail("must not be empty");
    }
    if let Some(ch) = value.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return fail(&format!("contains forbidden character: {ch:?}"));
    }
    if value.starts_with('/') || value.ends_with('/') {
        return fail("must not start or end with '/'");
    }
    if value.split('/').any(|part| part.is_empty() || part == "..") {
        return fail("path segments must be non-empty and not '..'");
    }
    Ok(())
}

impl fmt::Debug for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobLocator({})", self.0)
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobLocator {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BlobLocator {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlobLocator> for String {
    fn from(locator: BlobLocator) -> Self {
        locator.0.to_string()
    }
}

/// One export inside a bundle: `(blob, export index)`.
///
/// Textual form is `blob#index`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeLocator {
    pub blob: BlobLocator,
    pub export_index: usize,
}

impl NodeLocator {
    pub fn new(blob: BlobLocator, export_index: usize) -> Self {
        Self { blob, export_index }
    }
}

impl fmt::Debug for NodeLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeLocator({}#{})", self.blob, self.export_index)
    }
}

impl fmt::Display for NodeLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.blob, self.export_index)
    }
}

impl FromStr for NodeLocator {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TypeError::InvalidLocator {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (blob, index) = s
            .rsplit_once('#')
            .ok_or_else(|| invalid("missing '#<export index>' suffix"))?;
        let export_index = index
            .parse::<usize>()
            .map_err(|_| invalid("export index is not a number"))?;
        Ok(Self::new(BlobLocator::new(blob)?, export_index))
    }
}
