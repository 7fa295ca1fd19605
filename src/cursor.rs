//! Opaque, storable position markers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized position within a task's collection.
///
/// The engine never looks inside a cursor. Only the enumerator that produced
/// it knows what it means.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

/// Error converting between a position and its stored form.
#[derive(Error, Debug)]
pub enum CursorError {
    #[error("failed to encode cursor: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode cursor {raw:?}: {source}")]
    Decode {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Cursor {
    /// Wrap an already-serialized cursor, e.g. one read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Serialize a position.
    pub fn encode<P: Serialize>(position: &P) -> Result<Self, CursorError> {
        serde_json::to_string(position)
            .map(Self)
            .map_err(CursorError::Encode)
    }

    /// Deserialize the position this cursor was encoded from.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, CursorError> {
        serde_json::from_str(&self.0).map_err(|source| CursorError::Decode {
            raw: self.0.clone(),
            source,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode an optional cursor. `None` means start from the beginning.
pub fn decode_opt<P: DeserializeOwned>(cursor: Option<&Cursor>) -> Result<Option<P>, CursorError> {
    cursor.map(Cursor::decode).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_integer() {
        let cursor = Cursor::encode(&42u64).unwrap();
        assert_eq!(cursor.as_str(), "42");
        assert_eq!(cursor.decode::<u64>().unwrap(), 42);
    }

    #[test]
    fn test_round_trip_composite_position() {
        let position = ("2024-01-01T00:00:00Z".to_string(), 17i64);
        let cursor = Cursor::encode(&position).unwrap();
        let decoded: (String, i64) = cursor.decode().unwrap();
        assert_eq!(decoded, position);
    }

    #[test]
    fn test_missing_cursor_means_beginning() {
        let decoded: Option<u64> = decode_opt(None).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let cursor = Cursor::from_raw("\"not a number\"");
        let err = cursor.decode::<u64>().unwrap_err();
        assert!(matches!(err, CursorError::Decode { .. }));
    }
}
