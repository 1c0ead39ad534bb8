//! Names of refs: the mutable, named pointers to root nodes.
//!
//! Valid ref names:
//! - Must be non-empty
//! - Must not contain whitespace, `~`, `^`, `:`, `?`, `*`, `[`, `\`
//! - Must not contain `..` or `//`
//! - Must not start or end with `.` or `/`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const FORBIDDEN_CHARS: &[char] = &[' ', '\t', '\n', '\r', '~', '^', ':', '?', '*', '[', '\\'];

/// A validated ref name, e.g. `builds/main/latest`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RefName(String);

impl RefName {
    /// ```
    /// use arbor_types::RefName;
    ///
    /// assert!(RefName::new("builds/main").is_ok());
    /// assert!(RefName::new("bad..name").is_err());
    /// ```
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        validate_ref_name(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_ref_name(name: &str) -> Result<(), TypeError> {
    let fail = |reason: String| {
        Err(TypeError::InvalidRefName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return fail("ref name must not be empty".into());
    }
    for ch in FORBIDDEN_CHARS {
        if name.contains(*ch) {
            return fail(format!("contains forbidden character: {ch:?}"));
        }
    }
    if name.contains("..") {
        return fail("must not contain '..'".into());
    }
    if name.contains("//") {
        return fail("must not contain '//'".into());
    }
    if name.starts_with('.') || name.ends_with('.') {
        return fail("must not start or end with '.'".into());
    }
    if name.starts_with('/') || name.ends_with('/') {
        return fail("must not start or end with '/'".into());
    }
    Ok(())
}

impl fmt::Debug for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefName({})", self.0)
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RefName {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RefName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RefName> for String {
    fn from(name: RefName) -> Self {
        name.0
    }
}
