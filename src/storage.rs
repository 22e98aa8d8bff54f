//! sled-backed persistence.
//!
//! Every record is minicbor-encoded. Besides the record trees, two index trees
//! carry the structural guarantees:
//!
//! - `active`: section path key -> id of the one active version for that path
//! - `pending`: section path key -> id of the one pending approval request
//!
//! Mutations go through [`Storage::transaction`], a serializable multi-tree
//! sled transaction, so a reader never observes a path without an active
//! version once it has one, or with two.
use super::approval::ApprovalRequest;
use super::audit::AuditLogEntry;
use super::error::RecordError;
use super::section::{BatchRecord, SectionPath, SectionRecord};
use super::signature::{ElectronicSignature, SignatureConsumption};
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{IVec, Tree};
use std::path::Path;
use std::sync::Arc;

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, RecordError>;

pub(crate) fn abort<T>(err: RecordError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, RecordError> {
    minicbor::to_vec(value).map_err(|e| RecordError::Corrupt(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, RecordError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| RecordError::Corrupt(e.to_string()))
}

fn decode_str(bytes: &IVec) -> Result<String, RecordError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| RecordError::Corrupt(e.to_string()))
}

fn decode_u64(bytes: &IVec) -> Result<u64, RecordError> {
    let raw: [u8; 8] = bytes
        .as_ref()
        .try_into()
        .map_err(|_| RecordError::Corrupt("version head is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Read access to active section versions, inside or outside a transaction.
pub trait SectionReader {
    type Error;

    fn active_section(&self, path: &SectionPath) -> Result<Option<SectionRecord>, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct Storage {
    db: Arc<sled::Db>,
    sections: Tree,
    active: Tree,
    heads: Tree,
    approvals: Tree,
    pending: Tree,
    signatures: Tree,
    consumed: Tree,
    batches: Tree,
    audit: Tree,
}

impl Storage {
    pub fn new(db: Arc<sled::Db>) -> Result<Self, RecordError> {
        Ok(Self {
            sections: db.open_tree("sections")?,
            active: db.open_tree("active")?,
            heads: db.open_tree("heads")?,
            approvals: db.open_tree("approvals")?,
            pending: db.open_tree("pending")?,
            signatures: db.open_tree("signatures")?,
            consumed: db.open_tree("consumed_signatures")?,
            batches: db.open_tree("batches")?,
            audit: db.open_tree("audit")?,
            db,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let db = sled::open(path)?;
        Self::new(Arc::new(db))
    }

    pub fn flush(&self) -> Result<(), RecordError> {
        self.db.flush()?;
        Ok(())
    }

    /// Runs `f` as one atomic transaction over every tree.
    ///
    /// sled may re-run `f` when another writer touched the same keys, so `f`
    /// must not have side effects outside the transaction view.
    pub(crate) fn transaction<A, F>(&self, f: F) -> Result<A, RecordError>
    where
        F: Fn(&StoreTx<'_>) -> TxResult<A>,
    {
        let trees = (
            &self.sections,
            &self.active,
            &self.heads,
            &self.approvals,
            &self.pending,
            &self.signatures,
            &self.consumed,
            &self.batches,
            &self.audit,
        );

        trees
            .transaction(
                |(sections, active, heads, approvals, pending, signatures, consumed, batches, audit)| {
                    let tx = StoreTx {
                        sections,
                        active,
                        heads,
                        approvals,
                        pending,
                        signatures,
                        consumed,
                        batches,
                        audit,
                    };
                    f(&tx)
                },
            )
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => RecordError::Storage(err),
            })
    }

    fn get_decoded<T>(tree: &Tree, key: &[u8]) -> Result<Option<T>, RecordError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match tree.get(key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn section(&self, record_id: &str) -> Result<Option<SectionRecord>, RecordError> {
        Self::get_decoded(&self.sections, record_id.as_bytes())
    }

    pub(crate) fn active_id(&self, path: &SectionPath) -> Result<Option<String>, RecordError> {
        match self.active.get(path.key())? {
            Some(bytes) => decode_str(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn head(&self, path: &SectionPath) -> Result<u64, RecordError> {
        match self.heads.get(path.key())? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Ids of the active versions of every section in a batch.
    pub(crate) fn active_ids_for_batch(&self, batch_record_id: &str) -> Result<Vec<String>, RecordError> {
        let prefix = super::utils::key_prefix(batch_record_id);
        let mut ids = vec![];
        for entry in self.active.scan_prefix(prefix) {
            let (_, value) = entry?;
            ids.push(decode_str(&value)?);
        }
        Ok(ids)
    }

    pub(crate) fn approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, RecordError> {
        Self::get_decoded(&self.approvals, request_id.as_bytes())
    }

    pub(crate) fn pending_request_id(&self, path: &SectionPath) -> Result<Option<String>, RecordError> {
        match self.pending.get(path.key())? {
            Some(bytes) => decode_str(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn signature(&self, signature_id: &str) -> Result<Option<ElectronicSignature>, RecordError> {
        Self::get_decoded(&self.signatures, signature_id.as_bytes())
    }

    pub(crate) fn consumption(&self, signature_id: &str) -> Result<Option<SignatureConsumption>, RecordError> {
        Self::get_decoded(&self.consumed, signature_id.as_bytes())
    }

    pub(crate) fn batch(&self, batch_record_id: &str) -> Result<Option<BatchRecord>, RecordError> {
        Self::get_decoded(&self.batches, batch_record_id.as_bytes())
    }

    /// Audit entries in commit order.
    pub(crate) fn audit_entries(&self) -> Result<Vec<AuditLogEntry>, RecordError> {
        let mut entries = vec![];
        for entry in self.audit.iter() {
            let (_, value) = entry?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }
}

impl SectionReader for Storage {
    type Error = RecordError;

    fn active_section(&self, path: &SectionPath) -> Result<Option<SectionRecord>, RecordError> {
        match self.active_id(path)? {
            Some(id) => match self.section(&id)? {
                Some(record) => Ok(Some(record)),
                None => Err(RecordError::Corrupt(format!(
                    "active pointer for section '{}' refers to missing version {}",
                    path.section_id, id
                ))),
            },
            None => Ok(None),
        }
    }
}

/// Typed view over the trees of one running transaction.
pub(crate) struct StoreTx<'a> {
    sections: &'a TransactionalTree,
    active: &'a TransactionalTree,
    heads: &'a TransactionalTree,
    approvals: &'a TransactionalTree,
    pending: &'a TransactionalTree,
    signatures: &'a TransactionalTree,
    consumed: &'a TransactionalTree,
    batches: &'a TransactionalTree,
    audit: &'a TransactionalTree,
}

impl StoreTx<'_> {
    fn get_decoded<T>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match tree.get(key)? {
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(ConflictableTransactionError::Abort),
            None => Ok(None),
        }
    }

    fn put_encoded<T: minicbor::Encode<()>>(
        tree: &TransactionalTree,
        key: &[u8],
        value: &T,
    ) -> TxResult<()> {
        let bytes = encode(value).map_err(ConflictableTransactionError::Abort)?;
        tree.insert(key, bytes)?;
        Ok(())
    }

    fn get_str(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<String>> {
        match tree.get(key)? {
            Some(bytes) => decode_str(&bytes)
                .map(Some)
                .map_err(ConflictableTransactionError::Abort),
            None => Ok(None),
        }
    }

    pub(crate) fn section(&self, record_id: &str) -> TxResult<Option<SectionRecord>> {
        Self::get_decoded(self.sections, record_id.as_bytes())
    }

    pub(crate) fn put_section(&self, record: &SectionRecord) -> TxResult<()> {
        Self::put_encoded(self.sections, record.id.as_bytes(), record)
    }

    pub(crate) fn active_id(&self, path: &SectionPath) -> TxResult<Option<String>> {
        Self::get_str(self.active, &path.key())
    }

    pub(crate) fn set_active(&self, path: &SectionPath, record_id: &str) -> TxResult<()> {
        self.active.insert(path.key(), record_id.as_bytes())?;
        Ok(())
    }

    pub(crate) fn head(&self, path: &SectionPath) -> TxResult<u64> {
        match self.heads.get(path.key())? {
            Some(bytes) => decode_u64(&bytes).map_err(ConflictableTransactionError::Abort),
            None => Ok(0),
        }
    }

    pub(crate) fn set_head(&self, path: &SectionPath, version: u64) -> TxResult<()> {
        self.heads.insert(path.key(), version.to_be_bytes().to_vec())?;
        Ok(())
    }

    pub(crate) fn approval(&self, request_id: &str) -> TxResult<Option<ApprovalRequest>> {
        Self::get_decoded(self.approvals, request_id.as_bytes())
    }

    pub(crate) fn put_approval(&self, request: &ApprovalRequest) -> TxResult<()> {
        Self::put_encoded(self.approvals, request.id.as_bytes(), request)
    }

    pub(crate) fn pending_request_id(&self, path: &SectionPath) -> TxResult<Option<String>> {
        Self::get_str(self.pending, &path.key())
    }

    pub(crate) fn set_pending(&self, path: &SectionPath, request_id: &str) -> TxResult<()> {
        self.pending.insert(path.key(), request_id.as_bytes())?;
        Ok(())
    }

    pub(crate) fn clear_pending(&self, path: &SectionPath) -> TxResult<()> {
        self.pending.remove(path.key())?;
        Ok(())
    }

    pub(crate) fn signature(&self, signature_id: &str) -> TxResult<Option<ElectronicSignature>> {
        Self::get_decoded(self.signatures, signature_id.as_bytes())
    }

    pub(crate) fn put_signature(&self, signature: &ElectronicSignature) -> TxResult<()> {
        Self::put_encoded(self.signatures, signature.id.as_bytes(), signature)
    }

    pub(crate) fn consumption(&self, signature_id: &str) -> TxResult<Option<SignatureConsumption>> {
        Self::get_decoded(self.consumed, signature_id.as_bytes())
    }

    pub(crate) fn put_consumption(&self, consumption: &SignatureConsumption) -> TxResult<()> {
        Self::put_encoded(
            self.consumed,
            consumption.signature_id.as_bytes(),
            consumption,
        )
    }

    pub(crate) fn batch(&self, batch_record_id: &str) -> TxResult<Option<BatchRecord>> {
        Self::get_decoded(self.batches, batch_record_id.as_bytes())
    }

    pub(crate) fn put_batch(&self, batch: &BatchRecord) -> TxResult<()> {
        Self::put_encoded(self.batches, batch.id.as_bytes(), batch)
    }

    pub(crate) fn put_audit(&self, key: &[u8], entry: &AuditLogEntry) -> TxResult<()> {
        Self::put_encoded(self.audit, key, entry)
    }
}

impl SectionReader for StoreTx<'_> {
    type Error = ConflictableTransactionError<RecordError>;

    fn active_section(&self, path: &SectionPath) -> TxResult<Option<SectionRecord>> {
        match self.active_id(path)? {
            Some(id) => match self.section(&id)? {
                Some(record) => Ok(Some(record)),
                None => abort(RecordError::Corrupt(format!(
                    "active pointer for section '{}' refers to missing version {}",
                    path.section_id, id
                ))),
            },
            None => Ok(None),
        }
    }
}
