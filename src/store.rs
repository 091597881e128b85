//! Durable `requestId -> IntentRecord` table with a secondary status index,
//! backed by `sled` (an embedded ordered KV store — the corpus's preferred
//! embedded Rust database for exactly this kind of local durable state).

use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::errors::RelayerError;
use crate::model::{IntentRecord, IntentStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("illegal status transition for {request_id}: {from} -> {to}")]
    IllegalTransition {
        request_id: String,
        from: IntentStatus,
        to: IntentStatus,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<StoreError> for RelayerError {
    fn from(e: StoreError) -> Self {
        RelayerError::Storage(e.to_string())
    }
}

/// Metadata accompanying a status update to an `IntentRecord`'s optional
/// fields.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub evm_tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub error_message: Option<String>,
}

fn status_key(status: IntentStatus, request_id: &str) -> Vec<u8> {
    let mut key = format!("{status}\0").into_bytes();
    key.extend_from_slice(request_id.as_bytes());
    key
}

fn status_prefix(status: IntentStatus) -> Vec<u8> {
    format!("{status}\0").into_bytes()
}

/// Durable mapping `requestId -> IntentRecord`, plus a secondary index for
/// querying by status.
pub struct PersistentStore {
    db: sled::Db,
    records: sled::Tree,
    by_status: sled::Tree,
}

impl PersistentStore {
    /// Opens (or creates) the store at `path`. Schema migrations are out of
    /// scope: a fresh schema is initialized on empty storage simply by
    /// virtue of `sled` creating empty trees on first use.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        let db = sled::open(path)?;
        let records = db.open_tree("intent_records")?;
        let by_status = db.open_tree("by_status")?;
        Ok(PersistentStore {
            db,
            records,
            by_status,
        })
    }

    /// In-memory store for tests and for environments without a filesystem.
    #[cfg(test)]
    fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let records = db.open_tree("intent_records")?;
        let by_status = db.open_tree("by_status")?;
        Ok(PersistentStore {
            db,
            records,
            by_status,
        })
    }

    fn get(&self, request_id: &str) -> Result<Option<IntentRecord>, StoreError> {
        match self.records.get(request_id)? {
            Some(bytes) => {
                let record: IntentRecord = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// `isProcessed(requestId) -> bool`: true iff a record exists with any
    /// status.
    pub fn is_processed(&self, request_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.contains_key(request_id)?)
    }

    /// `markPending(record)`: insert if absent; no-op if present
    /// (first-writer wins). Durability contract: this must be visible to
    /// `is_processed` before the caller proceeds to enqueue, which holds
    /// trivially since the transaction below commits before returning.
    pub fn mark_pending(&self, record: IntentRecord) -> Result<bool, StoreError> {
        let request_id = record.request_id.clone();
        let bytes = bincode::serialize(&record).map_err(|e| StoreError::Backend(e.to_string()))?;
        let status_index_key = status_key(record.status, &request_id);

        let inserted = (&self.records, &self.by_status)
            .transaction(|(records, by_status)| {
                if records.get(request_id.as_bytes())?.is_some() {
                    return Ok(false);
                }
                records.insert(request_id.as_bytes(), bytes.clone())?;
                by_status.insert(status_index_key.clone(), request_id.as_bytes())?;
                Ok(true)
            })
            .map_err(|e: TransactionError<()>| StoreError::Backend(e.to_string()))?;

        if inserted {
            self.db.flush().map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(inserted)
    }

    /// `updateStatus(requestId, status, meta)`: update in place; reject
    /// illegal status transitions.
    pub fn update_status(
        &self,
        request_id: &str,
        new_status: IntentStatus,
        meta: StatusUpdate,
        now: i64,
    ) -> Result<IntentRecord, StoreError> {
        let existing = self
            .get(request_id)?
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;

        if !existing.status.can_transition_to(new_status) {
            return Err(StoreError::IllegalTransition {
                request_id: request_id.to_string(),
                from: existing.status,
                to: new_status,
            });
        }

        let mut updated = existing.clone();
        updated.status = new_status;
        updated.last_updated_at = now;
        if meta.evm_tx_hash.is_some() {
            updated.evm_tx_hash = meta.evm_tx_hash;
        }
        if meta.block_number.is_some() {
            updated.block_number = meta.block_number;
        }
        if meta.error_message.is_some() {
            updated.error_message = meta.error_message;
        }

        let old_key = status_key(existing.status, request_id);
        let new_key = status_key(new_status, request_id);
        let bytes = bincode::serialize(&updated).map_err(|e| StoreError::Backend(e.to_string()))?;

        (&self.records, &self.by_status)
            .transaction(|(records, by_status)| {
                records.insert(request_id.as_bytes(), bytes.clone())?;
                by_status.remove(old_key.clone())?;
                by_status.insert(new_key.clone(), request_id.as_bytes())?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| StoreError::Backend(e.to_string()))?;

        self.db.flush().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(updated)
    }

    /// `listByStatus(status, limit)`: for health/metrics and the startup
    /// recovery sweep.
    pub fn list_by_status(
        &self,
        status: IntentStatus,
        limit: usize,
    ) -> Result<Vec<IntentRecord>, StoreError> {
        let prefix = status_prefix(status);
        let mut out = Vec::new();
        for kv in self.by_status.scan_prefix(prefix).take(limit) {
            let (_, request_id_bytes) = kv?;
            let request_id = String::from_utf8_lossy(&request_id_bytes).to_string();
            if let Some(record) = self.get(&request_id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn get_record(&self, request_id: &str) -> Result<Option<IntentRecord>, StoreError> {
        self.get(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainId, TransferIntent};
    use rust_decimal::Decimal;

    fn sample_intent(request_id: &str) -> TransferIntent {
        TransferIntent {
            request_id: request_id.to_string(),
            source_tx_id: format!("tx-{request_id}"),
            chain_id: ChainId::Sepolia,
            amount: Decimal::new(1, 2),
            recipient: "0xabcdef0123456789abcdef0123456789abcdef01".to_string(),
            created_at: 0,
            retry_count: 0,
        }
    }

    #[test]
    fn mark_pending_is_first_writer_wins() {
        let store = PersistentStore::open_temp().unwrap();
        let intent = sample_intent("r1");
        let record = IntentRecord::new_pending(&intent, 100);
        assert!(store.mark_pending(record.clone()).unwrap());
        assert!(store.is_processed("r1").unwrap());

        let mut second = record.clone();
        second.aleo_tx_id = "different-tx".to_string();
        assert!(!store.mark_pending(second).unwrap());

        let stored = store.get_record("r1").unwrap().unwrap();
        assert_eq!(stored.aleo_tx_id, record.aleo_tx_id);
    }

    #[test]
    fn update_status_rejects_illegal_transitions() {
        let store = PersistentStore::open_temp().unwrap();
        let intent = sample_intent("r2");
        store.mark_pending(IntentRecord::new_pending(&intent, 0)).unwrap();

        let err = store
            .update_status("r2", IntentStatus::Confirmed, StatusUpdate::default(), 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        store
            .update_status("r2", IntentStatus::InFlight, StatusUpdate::default(), 1)
            .unwrap();
        let confirmed = store
            .update_status(
                "r2",
                IntentStatus::Confirmed,
                StatusUpdate {
                    evm_tx_hash: Some("0xdead".to_string()),
                    ..Default::default()
                },
                2,
            )
            .unwrap();
        assert_eq!(confirmed.status, IntentStatus::Confirmed);
        assert_eq!(confirmed.evm_tx_hash.as_deref(), Some("0xdead"));
    }

    #[test]
    fn list_by_status_reflects_transitions() {
        let store = PersistentStore::open_temp().unwrap();
        for id in ["a", "b", "c"] {
            store
                .mark_pending(IntentRecord::new_pending(&sample_intent(id), 0))
                .unwrap();
        }
        assert_eq!(store.list_by_status(IntentStatus::Pending, 10).unwrap().len(), 3);

        store
            .update_status("a", IntentStatus::InFlight, StatusUpdate::default(), 1)
            .unwrap();
        assert_eq!(store.list_by_status(IntentStatus::Pending, 10).unwrap().len(), 2);
        assert_eq!(store.list_by_status(IntentStatus::InFlight, 10).unwrap().len(), 1);
    }

    #[test]
    fn idempotency_at_most_one_confirmed_record() {
        let store = PersistentStore::open_temp().unwrap();
        let intent = sample_intent("idem-1");
        store.mark_pending(IntentRecord::new_pending(&intent, 0)).unwrap();
        // A second "settlement attempt" observes the record already exists
        // and does not create a second entry.
        assert!(!store.mark_pending(IntentRecord::new_pending(&intent, 1)).unwrap());
        store
            .update_status("idem-1", IntentStatus::InFlight, StatusUpdate::default(), 1)
            .unwrap();
        store
            .update_status("idem-1", IntentStatus::Confirmed, StatusUpdate::default(), 2)
            .unwrap();
        let confirmed = store.list_by_status(IntentStatus::Confirmed, 10).unwrap();
        assert_eq!(confirmed.len(), 1);
    }
}
