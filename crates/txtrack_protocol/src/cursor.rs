//! Durable synchronization cursor.

use crate::error::{ProtocolError, ProtocolResult};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// Version of the persisted cursor record.
pub const CURSOR_RECORD_VERSION: u16 = 1;

/// Position of the last fully applied transaction.
///
/// Cursors order like transactions: by commit time, then by id. The zero
/// cursor means nothing has been applied yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Cursor {
    /// Commit time of the last applied transaction.
    pub commit_time_ms: u64,
    /// Id of the last applied transaction.
    pub tx_id: u64,
}

#[derive(Serialize, Deserialize)]
struct CursorRecord {
    version: u16,
    commit_time_ms: u64,
    tx_id: u64,
}

impl Cursor {
    /// Creates a cursor.
    pub fn new(commit_time_ms: u64, tx_id: u64) -> Self {
        Self {
            commit_time_ms,
            tx_id,
        }
    }

    /// Returns the cursor positioned at `tx`.
    pub fn at(tx: &Transaction) -> Self {
        Self::new(tx.commit_time_ms, tx.id)
    }

    /// Returns true if nothing has been applied.
    pub fn is_origin(&self) -> bool {
        self.commit_time_ms == 0 && self.tx_id == 0
    }

    /// Returns the later of `self` and the position of `tx`.
    pub fn advanced_to(self, tx: &Transaction) -> Self {
        self.max(Self::at(tx))
    }

    /// Encodes the cursor as a versioned CBOR record.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let record = CursorRecord {
            version: CURSOR_RECORD_VERSION,
            commit_time_ms: self.commit_time_ms,
            tx_id: self.tx_id,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&record, &mut bytes)
            .map_err(|e| ProtocolError::encoding(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes a cursor record.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let record: CursorRecord =
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::decoding(e.to_string()))?;
        if record.version != CURSOR_RECORD_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                expected: CURSOR_RECORD_VERSION,
                found: record.version,
            });
        }
        Ok(Self::new(record.commit_time_ms, record.tx_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_record_roundtrip() {
        let cursor = Cursor::new(1_700_000_000_000, 42);
        let bytes = cursor.encode().unwrap();
        assert_eq!(Cursor::decode(&bytes).unwrap(), cursor);
    }

    #[test]
    fn rejects_other_versions() {
        let record = CursorRecord {
            version: 9,
            commit_time_ms: 1,
            tx_id: 1,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&record, &mut bytes).unwrap();

        let err = Cursor::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnsupportedVersion {
                expected: CURSOR_RECORD_VERSION,
                found: 9
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Cursor::decode(&[0xff, 0x00]),
            Err(ProtocolError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn advances_monotonically() {
        let cursor = Cursor::new(200, 2);
        assert_eq!(cursor.advanced_to(&Transaction::marker(1, 100)), cursor);
        assert_eq!(
            cursor.advanced_to(&Transaction::marker(3, 200)),
            Cursor::new(200, 3)
        );
        assert!(Cursor::default().is_origin());
    }
}
