//! Function path definitions.
//!
//! A function path names a server function as `module:function`. Paths are
//! canonicalized on parse so that `"messages"`, `"messages:default"` and
//! `"messages.js:default"` all name the same function.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

const DEFAULT_FUNCTION: &str = "default";

/// A canonical `module:function` path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionPath {
    canonical: String,
    split: usize,
}

impl FunctionPath {
    /// Parses and canonicalizes a function path.
    pub fn parse(path: &str) -> Result<Self> {
        let (module, function) = match path.rsplit_once(':') {
            Some((module, function)) => (module, function),
            None => (path, DEFAULT_FUNCTION),
        };
        let module = module.strip_suffix(".js").unwrap_or(module);

        if module.is_empty() {
            return Err(Error::invalid_function_path(path, "module is empty"));
        }
        if function.is_empty() {
            return Err(Error::invalid_function_path(path, "function name is empty"));
        }
        if path.chars().any(char::is_whitespace) {
            return Err(Error::invalid_function_path(path, "contains whitespace"));
        }

        Ok(Self {
            canonical: format!("{}:{}", module, function),
            split: module.len(),
        })
    }

    /// Returns the module part.
    #[inline]
    pub fn module(&self) -> &str {
        &self.canonical[..self.split]
    }

    /// Returns the function part.
    #[inline]
    pub fn function(&self) -> &str {
        &self.canonical[self.split + 1..]
    }

    /// Returns the canonical `module:function` string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for FunctionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for FunctionPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for FunctionPath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
