//! Ordered, name-unique header collections attached to commits and messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header naming the component that produced a message.
pub const ORIGIN: &str = "origin";

/// Header carrying the milliseconds-since-epoch creation time of a message.
pub const TIMESTAMP: &str = "timestamp";

/// Header recording the concrete aggregate type on a stream's first commit.
///
/// Replay has to know what to instantiate before any state exists, so the
/// store stamps this on the version-1 commit.
pub const AGGREGATE_TYPE: &str = "aggregate-type";

/// Header identifying the actor a unit of work is correlated with.
pub const CORRELATION_ACTOR: &str = "correlation-actor";

/// A single named header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Header {
    name: String,
    value: Value,
}

/// An ordered collection of name-unique key/value metadata.
///
/// Setting an existing name replaces its value in place, preserving the
/// original insertion position. Iteration always follows insertion order,
/// which is also the order headers are persisted in.
///
/// # Examples
///
/// ```
/// use ledgerstream::Headers;
/// use serde_json::json;
///
/// let mut headers = Headers::new();
/// headers.set("origin", json!("command"));
/// headers.set("attempt", json!(1));
/// headers.set("attempt", json!(2)); // replaced in place
///
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers.get("attempt"), Some(&json!(2)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    /// Create an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing value under the same name.
    ///
    /// A replaced header keeps its original position; a new name is
    /// appended at the end.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|h| h.name == name) {
            Some(existing) => existing.value = value,
            None => self.entries.push(Header { name, value }),
        }
    }

    /// Builder-style variant of [`set`](Headers::set).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Look up a header value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|h| h.name == name)
            .map(|h| &h.value)
    }

    /// True when a header with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|h| h.name == name)
    }

    /// Number of headers in the collection.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no headers are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|h| (h.name.as_str(), &h.value))
    }

    /// Copy every header from `other` into `self`, replacing collisions.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.set(name, value.clone());
        }
    }
}
