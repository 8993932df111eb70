//! Session payload.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Application-defined key/value payload of a session.
///
/// Keys are kept sorted so that packing the same mapping always yields the
/// same bytes; this is what lets an unchanged session skip rewriting `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionData {
    values: BTreeMap<String, serde_json::Value>,
}

impl SessionData {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value from the session data.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set a value in the session data.
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> SessionResult<()> {
        let json_value =
            serde_json::to_value(value).map_err(|e| SessionError::Serialization(e.to_string()))?;
        self.values.insert(key.to_string(), json_value);
        Ok(())
    }

    /// Remove a value from the session data.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    /// Check if a key exists in the session data.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Get all keys in the session data.
    pub fn keys(&self) -> Vec<&String> {
        self.values.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Clear all session data.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Serialize into the opaque blob stored in the `data` attribute.
    pub fn pack(&self) -> SessionResult<Vec<u8>> {
        serde_json::to_vec(&self.values).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    /// Inverse of [`pack`](Self::pack).
    pub fn unpack(bytes: &[u8]) -> SessionResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut data = SessionData::new();
        data.set("user_id", 123).unwrap();
        data.set("username", "alice").unwrap();

        assert_eq!(data.get::<i32>("user_id"), Some(123));
        assert_eq!(data.get::<String>("username").as_deref(), Some("alice"));
        assert_eq!(data.get::<i32>("username"), None);
        assert!(data.contains("user_id"));
        assert_eq!(data.len(), 2);

        data.remove("user_id");
        assert!(!data.contains("user_id"));
    }

    #[test]
    fn test_pack_is_deterministic() {
        let mut a = SessionData::new();
        a.set("zeta", 1).unwrap();
        a.set("alpha", 2).unwrap();

        let mut b = SessionData::new();
        b.set("alpha", 2).unwrap();
        b.set("zeta", 1).unwrap();

        assert_eq!(a.pack().unwrap(), b.pack().unwrap());
        assert_eq!(SessionData::unpack(&a.pack().unwrap()).unwrap(), b);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(matches!(
            SessionData::unpack(b"\x00not json"),
            Err(SessionError::Deserialization(_))
        ));
    }
}
