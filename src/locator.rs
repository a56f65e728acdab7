//! Source locators
//!
//! A locator names a source configuration as `scheme://authority/path?query`.
//! The string and structured forms of the same configuration normalize to the
//! same [`Locator`] and therefore the same identity fingerprint.

use crate::cache::types::Fingerprint;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Query parameter that turns per-request result caching on or off
pub const CACHE_FLAG: &str = "cache";

/// Canonical form of a source configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub scheme: String,
    #[serde(default)]
    pub authority: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl Locator {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Parse a locator string
    ///
    /// Repeated query keys keep the last value.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CacheError::LocatorError("empty locator".to_string()));
        }

        let (without_fragment, _) = split_once_or_all(input, '#');
        let (head, raw_query) = split_once_or_all(without_fragment, '?');

        let (scheme, rest) = match head.find(':') {
            Some(idx) if is_scheme(&head[..idx]) => (head[..idx].to_string(), &head[idx + 1..]),
            _ => (String::new(), head),
        };

        let (authority, path) = match rest.strip_prefix("//") {
            Some(after) => match after.find('/') {
                Some(idx) => (after[..idx].to_string(), after[idx..].to_string()),
                None => (after.to_string(), String::new()),
            },
            None => (String::new(), rest.to_string()),
        };

        let mut query = BTreeMap::new();
        if let Some(raw) = raw_query {
            for pair in raw.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = split_once_or_all(pair, '=');
                query.insert(percent_decode(key)?, percent_decode(value.unwrap_or(""))?);
            }
        }

        Self {
            scheme,
            authority,
            path,
            query,
        }
        .normalize()
    }

    /// Canonical form shared by parsed and structured locators
    ///
    /// Schemes are case-insensitive and are lowercased. A locator with no
    /// scheme, authority or path is a `LocatorError`.
    pub fn normalize(mut self) -> Result<Self> {
        self.scheme = self.scheme.trim().to_ascii_lowercase();
        if self.scheme.is_empty() && self.authority.is_empty() && self.path.is_empty() {
            return Err(CacheError::LocatorError(format!(
                "locator has no scheme or path: {:?}",
                self.to_string()
            )));
        }
        Ok(self)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Read the `cache` flag
    ///
    /// Absent means enabled. The value is parsed as JSON and read for
    /// truthiness: `false`, `null`, `0` and `""` disable result caching, any
    /// other value enables it. A value that is not JSON is a `ConfigError`.
    pub fn cache_flag(&self) -> Result<bool> {
        let Some(raw) = self.param(CACHE_FLAG) else {
            return Ok(true);
        };

        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Ok(is_truthy(&value)),
            Err(e) => Err(CacheError::ConfigError(format!(
                "cache flag {:?} is not valid JSON: {}",
                raw, e
            ))),
        }
    }

    /// Identity fingerprint of this configuration
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        Fingerprint::of(self)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}:", self.scheme)?;
        }
        if !self.authority.is_empty() || !self.scheme.is_empty() {
            write!(f, "//{}", self.authority)?;
        }
        f.write_str(&self.path)?;
        for (i, (key, value)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, percent_encode(key), percent_encode(value))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Locator {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Either representation of a locator accepted by the cache
#[derive(Debug, Clone)]
pub enum LocatorInput {
    Uri(String),
    Structured(Locator),
}

impl LocatorInput {
    /// Normalize into an owned [`Locator`]
    pub fn into_locator(self) -> Result<Locator> {
        match self {
            LocatorInput::Uri(uri) => Locator::parse(&uri),
            LocatorInput::Structured(locator) => locator.normalize(),
        }
    }
}

impl From<&str> for LocatorInput {
    fn from(s: &str) -> Self {
        LocatorInput::Uri(s.to_string())
    }
}

impl From<String> for LocatorInput {
    fn from(s: String) -> Self {
        LocatorInput::Uri(s)
    }
}

impl From<Locator> for LocatorInput {
    fn from(locator: Locator) -> Self {
        LocatorInput::Structured(locator)
    }
}

impl From<&Locator> for LocatorInput {
    fn from(locator: &Locator) -> Self {
        LocatorInput::Structured(locator.clone())
    }
}

fn split_once_or_all(s: &str, sep: char) -> (&str, Option<&str>) {
    match s.split_once(sep) {
        Some((head, tail)) => (head, Some(tail)),
        None => (s, None),
    }
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    // single letters are drive prefixes, not schemes
    candidate.len() > 1
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Escape a query component so `parse` reads it back unchanged
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' | b':'
            | b',' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn percent_decode(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let byte = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| {
                        CacheError::LocatorError(format!("invalid percent escape at byte {}", i))
                    })?;
                out.push(byte);
                i += 2;
            }
            b'%' => {
                return Err(CacheError::LocatorError(
                    "truncated percent escape".to_string(),
                ))
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out)
        .map_err(|_| CacheError::LocatorError("query is not valid UTF-8".to_string()))
}
