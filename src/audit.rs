//! Append-only audit trail of state transitions
use super::error::RecordError;
use super::section::Actor;
use super::storage::{Storage, StoreTx, TxResult};
use super::types::{Document, TimeStamp};
use super::utils::{self, AUDIT_HRP};
use chrono::Utc;
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use uuid7::uuid7;

pub const WRITE_SECTION: &str = "WRITE_SECTION";
pub const INITIALIZE_SECTIONS: &str = "INITIALIZE_SECTIONS";
pub const PROPAGATE_SECTION_STATUS: &str = "PROPAGATE_SECTION_STATUS";
pub const UPDATE_BATCH_STATUS: &str = "UPDATE_BATCH_STATUS";
pub const REGISTER_BATCH: &str = "REGISTER_BATCH";
pub const CREATE_APPROVAL_REQUEST: &str = "CREATE_APPROVAL_REQUEST";
pub const APPROVE_CHANGE_REQUEST: &str = "APPROVE_CHANGE_REQUEST";
pub const REJECT_CHANGE_REQUEST: &str = "REJECT_CHANGE_REQUEST";
pub const CREATE_SIGNATURE: &str = "CREATE_SIGNATURE";
pub const CONSUME_SIGNATURE: &str = "CONSUME_SIGNATURE";

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub action: String,
    #[n(2)]
    pub entity_type: String,
    #[n(3)]
    pub entity_id: String,
    #[n(4)]
    pub old_value: Option<Document>,
    #[n(5)]
    pub new_value: Option<Document>,
    #[n(6)]
    pub user_id: String,
    #[n(7)]
    pub ip: Option<String>,
    #[n(8)]
    pub user_agent: Option<String>,
    #[n(9)]
    pub batch_record_id: Option<String>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
}

impl AuditLogEntry {
    /// Id and timestamp are assigned when the entry is recorded.
    pub fn new(action: &str, entity_type: &str, entity_id: &str, actor: &Actor) -> Self {
        Self {
            id: String::new(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            old_value: None,
            new_value: None,
            user_id: actor.user_id.clone(),
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            batch_record_id: None,
            created_at: TimeStamp::new(),
        }
    }

    pub fn values(mut self, old_value: Option<Document>, new_value: Option<Document>) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub fn batch(mut self, batch_record_id: &str) -> Self {
        self.batch_record_id = Some(batch_record_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AuditTrail {
    storage: Storage,
}

impl AuditTrail {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Appends one entry in its own transaction.
    pub fn append(&self, entry: AuditLogEntry) -> Result<AuditLogEntry, RecordError> {
        self.storage
            .transaction(|tx| AuditTrail::record(tx, entry.clone()))
    }

    /// Appends inside an enclosing transaction; the entry commits or rolls back with it.
    pub(crate) fn record(tx: &StoreTx<'_>, mut entry: AuditLogEntry) -> TxResult<AuditLogEntry> {
        let uuid = uuid7();
        entry.id = utils::uuid_to_bech32(AUDIT_HRP, &uuid)
            .map_err(|e| ConflictableTransactionError::Abort(RecordError::Internal(e)))?;
        entry.created_at = TimeStamp::new();

        tx.put_audit(uuid.as_bytes(), &entry)?;

        tracing::debug!(
            audit_id = %entry.id,
            action = %entry.action,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            "audit entry recorded"
        );
        Ok(entry)
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Result<Vec<AuditLogEntry>, RecordError> {
        self.storage.audit_entries()
    }

    pub fn entries_for_batch(&self, batch_record_id: &str) -> Result<Vec<AuditLogEntry>, RecordError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.batch_record_id.as_deref() == Some(batch_record_id))
            .collect())
    }
}
