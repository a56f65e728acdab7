//! Fingerprints for fetch results
//!
//! A result key combines the operation name, the identity of the source
//! configuration, the caller's request properties and the positional
//! arguments. The serialized form is
//! `{namespace}:{identity}@{properties}{args}` where properties are a JSON
//! object with sorted keys and args are comma-joined JSON values; the key is
//! the SHA-256 digest of that string.

use crate::cache::types::Fingerprint;
use crate::source::RequestContext;
use serde_json::{Map, Value};

/// Builder for result fingerprints
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    namespace: String,
    identity: Option<Fingerprint>,
    properties: Map<String, Value>,
    args: Vec<Value>,
}

impl KeyBuilder {
    /// Start a key in the given namespace (the operation name)
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            identity: None,
            properties: Map::new(),
            args: Vec::new(),
        }
    }

    /// Set the identity of the source configuration
    pub fn identity(mut self, identity: Fingerprint) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Fold in every property attached to a request
    pub fn context(mut self, ctx: &RequestContext) -> Self {
        for (key, value) in ctx.properties() {
            self.properties.insert(key.clone(), value.clone());
        }
        self
    }

    /// Add a single property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Canonical string the fingerprint is computed over
    pub fn canonical(&self) -> String {
        let identity = self
            .identity
            .map(|id| id.to_hex())
            .unwrap_or_default();
        // Map is ordered by key and Value's Display is compact JSON
        let properties = Value::Object(self.properties.clone());
        let args: Vec<String> = self.args.iter().map(Value::to_string).collect();

        format!(
            "{}:{}@{}{}",
            self.namespace,
            identity,
            properties,
            args.join(",")
        )
    }

    /// Build the fingerprint
    pub fn build(&self) -> Fingerprint {
        Fingerprint::digest(self.canonical())
    }
}
