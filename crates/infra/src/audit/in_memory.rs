use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{AuditEntryId, AuditError, AuditLog, AuditLogEntry, AuditOutcome, AuditQuery, AuditRecord};

/// In-memory audit log for tests/dev. Ids start at 1 and increase by one.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, oldest first.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntryId, AuditError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AuditError::Storage("audit log lock poisoned".to_string()))?;
        let id = AuditEntryId(entries.len() as i64 + 1);
        entries.push(AuditLogEntry { id, record });
        Ok(id)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| AuditError::Storage("audit log lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|entry| query.matches(&entry.record))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn count(&self, outcome: AuditOutcome) -> Result<u64, AuditError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| AuditError::Storage("audit log lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|entry| entry.record.outcome == outcome)
            .count() as u64)
    }
}
