//! Versioned section storage.
//!
//! Every write to a section path either fills the untouched version-1
//! placeholder or appends version `head + 1`, flipping the previous active
//! version to inactive in the same transaction. Locked sections (completed or
//! under review) only change through approval resolution.
use super::audit::{self, AuditLogEntry, AuditTrail};
use super::dependency::DependencyEvaluator;
use super::error::RecordError;
use super::section::{Actor, SectionPath, SectionRecord};
use super::status::{BatchPlan, StatusAggregator};
use super::storage::{SectionReader, Storage, StoreTx, TxResult, abort};
use super::template::TemplateProvider;
use super::types::{Document, SectionStatus, TimeStamp};
use super::utils::{self, SECTION_HRP};
use chrono::Utc;
use sled::transaction::ConflictableTransactionError;
use std::sync::Arc;

fn new_section_id() -> TxResult<String> {
    utils::new_uuid_to_bech32(SECTION_HRP)
        .map_err(|e| ConflictableTransactionError::Abort(RecordError::Internal(e)))
}

#[derive(Clone)]
pub struct SectionStore {
    storage: Storage,
    templates: Arc<dyn TemplateProvider>,
    dependencies: DependencyEvaluator,
}

impl SectionStore {
    pub fn new(storage: Storage, templates: Arc<dyn TemplateProvider>) -> Self {
        Self {
            dependencies: DependencyEvaluator::new(storage.clone(), templates.clone()),
            storage,
            templates,
        }
    }

    pub(crate) fn plan(&self, batch_record_id: &str) -> Result<BatchPlan, RecordError> {
        BatchPlan::load(&self.storage, self.templates.as_ref(), batch_record_id)
    }

    /// Saves `data` to a section as a new version (or into its untouched
    /// placeholder). Fails with a lock conflict when the section is completed
    /// or under review.
    pub fn write(
        &self,
        batch_record_id: &str,
        section_id: &str,
        data: Document,
        actor: &Actor,
        parent_section_id: Option<&str>,
        target_status: SectionStatus,
    ) -> Result<SectionRecord, RecordError> {
        actor.validate()?;
        let plan = self.plan(batch_record_id)?;
        let path = plan.resolve(section_id, parent_section_id);
        path.validate()?;

        // optimistic snapshot; the transaction fails if another writer moved the path
        let expected = (self.storage.active_section(&path)?, self.storage.head(&path)?);
        let now = TimeStamp::new();

        let result = self.storage.transaction(|tx| {
            let current = (tx.active_section(&path)?, tx.head(&path)?);
            // materializing the tree in between only adds an untouched placeholder
            let materialized = expected.0.is_none()
                && current.0.as_ref().is_some_and(SectionRecord::is_untouched_placeholder);
            if current != expected && !materialized {
                return abort(RecordError::ConcurrencyConflict {
                    section_id: path.section_id.clone(),
                    detail: format!(
                        "expected version {} as read but found version {} ({})",
                        expected.1,
                        current.1,
                        current.0.as_ref().map_or("none", |r| r.status.as_str())
                    ),
                });
            }
            self.write_in(tx, &plan, &path, &data, actor, target_status, false, &now)
        });

        match &result {
            Ok(record) => tracing::info!(
                batch_record_id,
                section_id,
                version = record.version,
                status = %record.status,
                user_id = %actor.user_id,
                "section written"
            ),
            Err(err) => tracing::warn!(
                batch_record_id,
                section_id,
                error = %err,
                "section write rejected"
            ),
        }
        result
    }

    /// The write algorithm, run inside the caller's transaction. Only the
    /// approval-resolution path passes `bypass_locks`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_in(
        &self,
        tx: &StoreTx<'_>,
        plan: &BatchPlan,
        path: &SectionPath,
        data: &Document,
        actor: &Actor,
        target_status: SectionStatus,
        bypass_locks: bool,
        now: &TimeStamp<Utc>,
    ) -> TxResult<SectionRecord> {
        Self::materialize_in(tx, plan, actor, now)?;

        let active = tx.active_section(path)?;
        let head = tx.head(path)?;

        if let Some(current) = &active {
            if current.is_untouched_placeholder()
                && data.is_empty()
                && target_status == SectionStatus::Draft
            {
                return Ok(current.clone());
            }

            if current.status.is_locked() {
                let rules = self
                    .dependencies
                    .rules_for(&plan.batch.template_id, &path.section_id)
                    .map_err(ConflictableTransactionError::Abort)?;
                DependencyEvaluator::evaluate(
                    tx,
                    &plan.tree,
                    &path.batch_record_id,
                    &path.section_id,
                    &rules,
                )?
                .into_result(&path.section_id)
                .map_err(ConflictableTransactionError::Abort)?;

                if !bypass_locks {
                    return abort(match current.status {
                        SectionStatus::PendingApproval => RecordError::PendingApprovalExists {
                            section_id: path.section_id.clone(),
                        },
                        status => RecordError::SectionLocked {
                            section_id: path.section_id.clone(),
                            status,
                        },
                    });
                }
            }
        }

        let old_data = active.as_ref().map(|r| r.section_data.clone());
        let record = match active {
            Some(mut placeholder) if placeholder.is_untouched_placeholder() => {
                placeholder.section_data = data.clone();
                placeholder
                    .apply_status(target_status, &actor.user_id, now)
                    .map_err(ConflictableTransactionError::Abort)?;
                placeholder.created_by = actor.user_id.clone();
                tx.put_section(&placeholder)?;
                placeholder
            }
            previous => {
                let mut record = SectionRecord {
                    id: new_section_id()?,
                    version: head + 1,
                    section_data: data.clone(),
                    status: previous.as_ref().map_or(SectionStatus::Draft, |p| p.status),
                    previous_version_id: previous.as_ref().map(|p| p.id.clone()),
                    ..SectionRecord::placeholder(String::new(), path, &actor.user_id, now)
                };
                record
                    .apply_status(target_status, &actor.user_id, now)
                    .map_err(ConflictableTransactionError::Abort)?;

                if let Some(mut superseded) = previous {
                    superseded.is_active = false;
                    tx.put_section(&superseded)?;
                }
                tx.put_section(&record)?;
                tx.set_active(path, &record.id)?;
                tx.set_head(path, record.version)?;
                record
            }
        };

        StatusAggregator::propagate_in(tx, &plan.tree, path, actor, now)?;
        StatusAggregator::recompute_batch_in(tx, &plan.tree, &path.batch_record_id, actor, now)?;

        AuditTrail::record(
            tx,
            AuditLogEntry::new(audit::WRITE_SECTION, "BatchRecordSection", &record.id, actor)
                .values(old_data, Some(record.section_data.clone()))
                .batch(&record.batch_record_id),
        )?;
        Ok(record)
    }

    /// Creates `DRAFT` placeholders for every template section the batch
    /// does not have yet. Returns how many were created.
    pub fn initialize(&self, batch_record_id: &str, actor: &Actor) -> Result<usize, RecordError> {
        actor.validate()?;
        let plan = self.plan(batch_record_id)?;
        let now = TimeStamp::new();
        let created = self
            .storage
            .transaction(|tx| Self::materialize_in(tx, &plan, actor, &now))?;
        tracing::debug!(batch_record_id, created, "section tree initialized");
        Ok(created)
    }

    pub(crate) fn materialize_in(
        tx: &StoreTx<'_>,
        plan: &BatchPlan,
        actor: &Actor,
        now: &TimeStamp<Utc>,
    ) -> TxResult<usize> {
        let mut created = 0;
        for (section_id, parent) in plan.tree.entries() {
            let path = SectionPath::new(&plan.batch.id, section_id, parent);
            if tx.head(&path)? > 0 {
                continue;
            }
            let record = SectionRecord::placeholder(new_section_id()?, &path, &actor.user_id, now);
            tx.put_section(&record)?;
            tx.set_active(&path, &record.id)?;
            tx.set_head(&path, record.version)?;
            created += 1;
        }

        if created > 0 {
            AuditTrail::record(
                tx,
                AuditLogEntry::new(audit::INITIALIZE_SECTIONS, "BatchRecord", &plan.batch.id, actor)
                    .values(None, Some(Document(serde_json::json!({ "created": created }))))
                    .batch(&plan.batch.id),
            )?;
        }
        Ok(created)
    }

    pub fn active(&self, path: &SectionPath) -> Result<Option<SectionRecord>, RecordError> {
        self.storage.active_section(path)
    }

    /// Active version of a section, resolving its parent from the template.
    pub fn active_in_batch(
        &self,
        batch_record_id: &str,
        section_id: &str,
    ) -> Result<Option<SectionRecord>, RecordError> {
        let plan = self.plan(batch_record_id)?;
        self.active(&plan.resolve(section_id, None))
    }

    pub fn get(&self, record_id: &str) -> Result<Option<SectionRecord>, RecordError> {
        self.storage.section(record_id)
    }

    /// All versions of a path, oldest first.
    pub fn history(&self, path: &SectionPath) -> Result<Vec<SectionRecord>, RecordError> {
        let head = self.storage.head(path)?;
        let mut chain = vec![];
        let mut next = self.storage.active_id(path)?;

        while let Some(id) = next {
            let record = self
                .storage
                .section(&id)?
                .ok_or_else(|| RecordError::Corrupt(format!("version {id} is missing")))?;
            next = record.previous_version_id.clone();
            chain.push(record);
            if chain.len() as u64 > head {
                return Err(RecordError::Corrupt(format!(
                    "version chain of section '{}' is longer than its head",
                    path.section_id
                )));
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Active versions of every section in a batch.
    pub fn batch_sections(&self, batch_record_id: &str) -> Result<Vec<SectionRecord>, RecordError> {
        let mut records = vec![];
        for id in self.storage.active_ids_for_batch(batch_record_id)? {
            if let Some(record) = self.storage.section(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
