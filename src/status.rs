//! Parent-section and batch-level status derived from child sections
use super::audit::{self, AuditLogEntry, AuditTrail};
use super::error::RecordError;
use super::section::{Actor, BatchRecord, SectionPath};
use super::storage::{SectionReader, Storage, StoreTx, TxResult, abort};
use super::template::{MAX_TREE_DEPTH, SectionTree, TemplateProvider};
use super::types::{BatchStatus, Document, SectionStatus, TimeStamp};
use chrono::Utc;
use serde_json::json;
use sled::transaction::ConflictableTransactionError;
use std::sync::Arc;

/// A batch together with its template's section tree.
pub(crate) struct BatchPlan {
    pub batch: BatchRecord,
    pub tree: SectionTree,
}

impl BatchPlan {
    pub(crate) fn load(
        storage: &Storage,
        templates: &dyn TemplateProvider,
        batch_record_id: &str,
    ) -> Result<Self, RecordError> {
        let batch = storage
            .batch(batch_record_id)?
            .ok_or_else(|| RecordError::not_found("BatchRecord", batch_record_id))?;
        let tree = SectionTree::build(&templates.section_tree(&batch.template_id)?)?;
        Ok(Self { batch, tree })
    }

    /// Falls back to the template's parent when the caller names none.
    pub(crate) fn resolve(&self, section_id: &str, parent_section_id: Option<&str>) -> SectionPath {
        let parent = parent_section_id.or_else(|| self.tree.parent_of(section_id).flatten());
        SectionPath::new(&self.batch.id, section_id, parent)
    }
}

#[derive(Clone)]
pub struct StatusAggregator {
    storage: Storage,
    templates: Arc<dyn TemplateProvider>,
}

impl StatusAggregator {
    pub fn new(storage: Storage, templates: Arc<dyn TemplateProvider>) -> Self {
        Self { storage, templates }
    }

    pub fn register_batch(
        &self,
        batch_record_id: &str,
        template_id: &str,
        actor: &Actor,
    ) -> Result<BatchRecord, RecordError> {
        actor.validate()?;
        if batch_record_id.trim().is_empty() || template_id.trim().is_empty() {
            return Err(RecordError::validation(
                "batchRecordId and templateId are required",
            ));
        }
        let sections = self.templates.section_tree(template_id).map_err(|e| {
            RecordError::validation(format!("template '{template_id}' is unavailable: {e}"))
        })?;
        SectionTree::build(&sections)?;

        let batch = BatchRecord {
            id: batch_record_id.into(),
            template_id: template_id.into(),
            status: BatchStatus::InProgress,
            completed_at: None,
            completed_by: None,
            created_by: actor.user_id.clone(),
            created_at: TimeStamp::new(),
        };

        self.storage.transaction(|tx| {
            if tx.batch(batch_record_id)?.is_some() {
                return abort(RecordError::validation(format!(
                    "batch record '{batch_record_id}' already exists"
                )));
            }
            tx.put_batch(&batch)?;
            AuditTrail::record(
                tx,
                AuditLogEntry::new(audit::REGISTER_BATCH, "BatchRecord", batch_record_id, actor)
                    .values(None, Some(Document(json!({ "templateId": template_id }))))
                    .batch(batch_record_id),
            )?;
            Ok(())
        })?;

        tracing::info!(batch_record_id, template_id, "batch record registered");
        Ok(batch)
    }

    pub fn batch(&self, batch_record_id: &str) -> Result<Option<BatchRecord>, RecordError> {
        self.storage.batch(batch_record_id)
    }

    /// Re-derives the batch status from its top-level sections.
    pub fn recompute(&self, batch_record_id: &str, actor: &Actor) -> Result<BatchRecord, RecordError> {
        let plan = BatchPlan::load(&self.storage, self.templates.as_ref(), batch_record_id)?;
        let now = TimeStamp::new();
        self.storage
            .transaction(|tx| Self::recompute_batch_in(tx, &plan.tree, batch_record_id, actor, &now))
    }

    /// Walks up from `path`, completing a parent once every child is
    /// completed-equivalent and reverting a derived `COMPLETED` parent to
    /// `DRAFT` otherwise. Parents under review or approved are left alone.
    pub(crate) fn propagate_in(
        tx: &StoreTx<'_>,
        tree: &SectionTree,
        path: &SectionPath,
        actor: &Actor,
        now: &TimeStamp<Utc>,
    ) -> TxResult<()> {
        let mut child = path.clone();

        for _ in 0..MAX_TREE_DEPTH {
            let Some(parent_id) = child.parent_section_id.clone() else {
                break;
            };
            let children = tree.children_of(&parent_id);
            if children.is_empty() {
                break;
            }
            let parent_path = SectionPath::new(
                &child.batch_record_id,
                &parent_id,
                tree.parent_of(&parent_id).flatten(),
            );
            let Some(mut parent) = tx.active_section(&parent_path)? else {
                tracing::warn!(
                    batch_record_id = %child.batch_record_id,
                    section_id = %parent_id,
                    "parent section has no active version"
                );
                break;
            };

            let mut all_complete = true;
            for sibling in children {
                let sibling_path = SectionPath::new(&child.batch_record_id, sibling, Some(&parent_id));
                let complete = tx
                    .active_section(&sibling_path)?
                    .is_some_and(|record| record.status.is_completed_equivalent());
                if !complete {
                    all_complete = false;
                    break;
                }
            }

            let next = match (all_complete, parent.status) {
                (true, SectionStatus::Draft) => SectionStatus::Completed,
                (false, SectionStatus::Completed) => SectionStatus::Draft,
                _ => break,
            };
            let previous = parent.status;
            parent
                .apply_status(next, &actor.user_id, now)
                .map_err(ConflictableTransactionError::Abort)?;
            tx.put_section(&parent)?;

            AuditTrail::record(
                tx,
                AuditLogEntry::new(
                    audit::PROPAGATE_SECTION_STATUS,
                    "BatchRecordSection",
                    &parent.id,
                    actor,
                )
                .values(
                    Some(Document(json!({ "status": previous }))),
                    Some(Document(json!({ "status": next }))),
                )
                .batch(&parent.batch_record_id),
            )?;
            tracing::info!(
                batch_record_id = %parent.batch_record_id,
                section_id = %parent.section_id,
                from = %previous,
                to = %next,
                "parent section status propagated"
            );

            child = parent_path;
        }
        Ok(())
    }

    /// A batch is completed once every top-level section is completed-equivalent.
    pub(crate) fn recompute_batch_in(
        tx: &StoreTx<'_>,
        tree: &SectionTree,
        batch_record_id: &str,
        actor: &Actor,
        now: &TimeStamp<Utc>,
    ) -> TxResult<BatchRecord> {
        let Some(mut batch) = tx.batch(batch_record_id)? else {
            return abort(RecordError::not_found("BatchRecord", batch_record_id));
        };

        let roots = tree.roots();
        let mut complete = !roots.is_empty();
        for root in roots {
            let path = SectionPath::new(batch_record_id, root, None);
            let done = tx
                .active_section(&path)?
                .is_some_and(|record| record.status.is_completed_equivalent());
            if !done {
                complete = false;
                break;
            }
        }

        let next = if complete {
            BatchStatus::Completed
        } else {
            BatchStatus::InProgress
        };
        if batch.status == next {
            return Ok(batch);
        }

        let previous = batch.status;
        batch.status = next;
        if complete {
            batch.completed_at = Some(now.clone());
            batch.completed_by = Some(actor.user_id.clone());
        } else {
            batch.completed_at = None;
            batch.completed_by = None;
        }
        tx.put_batch(&batch)?;

        AuditTrail::record(
            tx,
            AuditLogEntry::new(audit::UPDATE_BATCH_STATUS, "BatchRecord", batch_record_id, actor)
                .values(
                    Some(Document(json!({ "status": previous }))),
                    Some(Document(json!({ "status": next }))),
                )
                .batch(batch_record_id),
        )?;
        tracing::info!(batch_record_id, status = ?next, "batch status recomputed");
        Ok(batch)
    }
}
