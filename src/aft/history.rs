//! Transfer History
//!
//! Circular buffer of completed non-zero transfers. Its only consumer is the
//! duplicate transaction id check: a host retry reuses the id of the most
//! recent entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::store::{Persisted, Store, StoreError, UnitOfWork};

use super::types::{
    RestrictedExpiration, TransferAmounts, TransferData, TransferStatus, TransferType,
};

const HISTORY_KEY: &str = "aft.history";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHistoryEntry {
    pub transaction_id: String,
    pub transfer_type: TransferType,
    pub transferred: TransferAmounts,
    pub status: TransferStatus,
    pub expiration: RestrictedExpiration,
    pub pool_id: u16,
    pub transaction_date: Option<DateTime<Utc>>,
}

impl From<&TransferData> for TransferHistoryEntry {
    fn from(data: &TransferData) -> Self {
        Self {
            transaction_id: data.transaction_id.clone(),
            transfer_type: data.transfer_type,
            transferred: data.transferred,
            status: data.status,
            expiration: data.expiration,
            pool_id: data.pool_id,
            transaction_date: data.transaction_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryIndex {
    MostRecent,
    /// Entries back from the most recent; `At(0)` is the most recent
    At(u8),
}

pub trait TransferHistory: Send + Sync {
    fn get_entry(&self, index: HistoryIndex) -> Option<TransferHistoryEntry>;

    /// Stage an append into `work`
    fn add_entry(
        &self,
        entry: TransferHistoryEntry,
        work: &mut UnitOfWork,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryRecord {
    entries: VecDeque<TransferHistoryEntry>,
}

/// History stored as a single record; newest entry at the back
pub struct PersistedHistory {
    capacity: usize,
    persisted: Persisted<HistoryRecord>,
}

impl PersistedHistory {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            persisted: Persisted::new(store, HISTORY_KEY),
        }
    }

    pub fn len(&self) -> usize {
        self.persisted.get().map(|r| r.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransferHistory for PersistedHistory {
    fn get_entry(&self, index: HistoryIndex) -> Option<TransferHistoryEntry> {
        let record = match self.persisted.get() {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read transfer history");
                return None;
            }
        };
        let back = match index {
            HistoryIndex::MostRecent => 0,
            HistoryIndex::At(n) => usize::from(n),
        };
        record.entries.iter().rev().nth(back).cloned()
    }

    fn add_entry(
        &self,
        entry: TransferHistoryEntry,
        work: &mut UnitOfWork,
    ) -> Result<(), StoreError> {
        let mut record = self.persisted.get()?;
        record.entries.push_back(entry);
        while record.entries.len() > self.capacity {
            record.entries.pop_front();
        }
        self.persisted.save(&record, Some(work))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn entry(id: &str) -> TransferHistoryEntry {
        let mut data = TransferData::new(
            id,
            TransferType::InHouseToHost,
            Default::default(),
            TransferAmounts::new(100, 0, 0),
        );
        data.transferred = data.requested;
        data.status = TransferStatus::FullTransferSuccessful;
        TransferHistoryEntry::from(&data)
    }

    #[test]
    fn test_wraps_at_capacity() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let history = PersistedHistory::new(store.clone(), 3);
        assert!(history.get_entry(HistoryIndex::MostRecent).is_none());

        for id in ["A", "B", "C", "D"] {
            let mut work = UnitOfWork::new();
            history.add_entry(entry(id), &mut work).unwrap();
            store.commit(work).unwrap();
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.get_entry(HistoryIndex::MostRecent).unwrap().transaction_id, "D");
        assert_eq!(history.get_entry(HistoryIndex::At(2)).unwrap().transaction_id, "B");
        assert!(history.get_entry(HistoryIndex::At(3)).is_none());
    }

    #[test]
    fn test_staged_entry_invisible_until_commit() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let history = PersistedHistory::new(store.clone(), 10);
        let mut work = UnitOfWork::new();
        history.add_entry(entry("A"), &mut work).unwrap();
        assert!(history.is_empty());
        store.commit(work).unwrap();
        assert!(!history.is_empty());
    }
}
