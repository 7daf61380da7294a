//! Environment keys and the documents cached for them.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key identifying a tenant environment. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct EnvironmentKey(Arc<str>);

impl EnvironmentKey {
    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<T: Into<Arc<str>>> From<T> for EnvironmentKey {
    fn from(value: T) -> EnvironmentKey {
        EnvironmentKey(value.into())
    }
}

impl AsRef<str> for EnvironmentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for EnvironmentKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl std::borrow::Borrow<str> for EnvironmentKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl log::kv::ToValue for EnvironmentKey {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

/// Content fingerprint of an environment document: lowercase hex MD5 of the wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// Compute fingerprint of raw document bytes.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Fingerprint {
        let digest = md5::compute(bytes);
        Fingerprint(format!("{:x}", digest).into())
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An environment document as served by the upstream API.
///
/// Documents are immutable: a refresh builds a new document and swaps it into the
/// [`CacheStore`](crate::CacheStore) as a whole, so readers holding an `Arc` to an older document
/// keep a consistent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentDocument {
    /// Opaque document contents (flags, segments, identity overrides).
    pub contents: serde_json::Value,
    /// Fingerprint of the wire representation.
    pub fingerprint: Fingerprint,
    /// When the document was fetched from upstream.
    pub fetched_at: DateTime<Utc>,
}

impl EnvironmentDocument {
    /// Build a document from a raw upstream response body.
    pub fn from_wire_json(bytes: &[u8]) -> serde_json::Result<EnvironmentDocument> {
        let contents = serde_json::from_slice(bytes)?;
        Ok(EnvironmentDocument {
            contents,
            fingerprint: Fingerprint::of_bytes(bytes),
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{EnvironmentDocument, EnvironmentKey, Fingerprint};

    #[test]
    fn fingerprint_depends_only_on_bytes() {
        assert_eq!(
            Fingerprint::of_bytes(b"{\"flags\":[]}"),
            Fingerprint::of_bytes(b"{\"flags\":[]}")
        );
        assert_ne!(
            Fingerprint::of_bytes(b"{\"flags\":[]}"),
            Fingerprint::of_bytes(b"{\"flags\":[1]}")
        );
        assert_eq!(
            Fingerprint::of_bytes(b"").as_str(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn document_from_malformed_json_fails() {
        assert!(EnvironmentDocument::from_wire_json(b"not json").is_err());
    }

    #[test]
    fn document_keeps_contents() {
        let doc = EnvironmentDocument::from_wire_json(br#"{"api_key":"envA"}"#).unwrap();
        assert_eq!(doc.contents["api_key"], "envA");
    }

    #[test]
    fn key_borrows_as_str() {
        let keys: std::collections::HashSet<EnvironmentKey> = ["envA".into()].into_iter().collect();
        assert!(keys.contains("envA"));
    }
}
