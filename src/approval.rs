//! Change requests: the only way to alter a locked section
use super::audit::{self, AuditLogEntry, AuditTrail};
use super::error::RecordError;
use super::section::{Actor, SectionPath, SectionRecord};
use super::status::StatusAggregator;
use super::storage::{SectionReader, Storage, abort};
use super::store::SectionStore;
use super::types::{ApprovalStatus, Document, RequestType, SectionStatus, TimeStamp};
use super::utils::{self, APPROVAL_HRP};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sled::transaction::ConflictableTransactionError;

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub batch_record_id: String,
    #[n(2)]
    pub section_id: String,
    #[n(3)]
    pub parent_section_id: Option<String>,
    #[n(4)]
    pub section_record_id: String, // version under review
    #[n(5)]
    pub request_type: RequestType,
    #[n(6)]
    pub reason: String,
    #[n(7)]
    pub existing_data: Option<Document>,
    #[n(8)]
    pub proposed_data: Option<Document>,
    #[n(9)]
    pub status: ApprovalStatus,
    #[n(10)]
    pub status_before_request: SectionStatus,
    #[n(11)]
    pub requested_by: String,
    #[n(12)]
    pub requested_at: TimeStamp<Utc>,
    #[n(13)]
    pub reviewed_by: Option<String>,
    #[n(14)]
    pub reviewed_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub review_comments: Option<String>,
    #[n(16)]
    pub resulting_record_id: Option<String>,
}

impl ApprovalRequest {
    pub fn path(&self) -> SectionPath {
        SectionPath::new(
            &self.batch_record_id,
            &self.section_id,
            self.parent_section_id.as_deref(),
        )
    }

    /// Only pending requests can be resolved.
    pub fn ensure_pending(&self) -> Result<(), RecordError> {
        if self.status != ApprovalStatus::Pending {
            return Err(RecordError::validation(format!(
                "approval request '{}' is not pending ({:?})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn review(&mut self, status: ApprovalStatus, reviewer: &Actor, comments: Option<&str>, now: &TimeStamp<Utc>) {
        self.status = status;
        self.reviewed_by = Some(reviewer.user_id.clone());
        self.reviewed_at = Some(now.clone());
        self.review_comments = comments.map(Into::into);
    }
}

#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub batch_record_id: String,
    pub section_id: String,
    pub parent_section_id: Option<String>,
    pub request_type: RequestType,
    pub reason: String,
    pub existing_data: Option<Document>,
    pub proposed_data: Option<Document>,
}

/// A resolved request and the section version it left active.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub request: ApprovalRequest,
    pub section: SectionRecord,
}

#[derive(Clone)]
pub struct ApprovalWorkflow {
    storage: Storage,
    sections: SectionStore,
}

impl ApprovalWorkflow {
    pub fn new(storage: Storage, sections: SectionStore) -> Self {
        Self { storage, sections }
    }

    /// Opens a request and moves the section to `PENDING_APPROVAL`.
    pub fn create_request(
        &self,
        new: NewApprovalRequest,
        actor: &Actor,
    ) -> Result<ApprovalRequest, RecordError> {
        actor.validate()?;
        if new.reason.trim().is_empty() {
            return Err(RecordError::validation("a reason is required for an approval request"));
        }
        if new.request_type.proposes_change() && new.proposed_data.is_none() {
            return Err(RecordError::validation(format!(
                "{} requests must carry proposedData",
                new.request_type.as_str()
            )));
        }

        let plan = self.sections.plan(&new.batch_record_id)?;
        let path = plan.resolve(&new.section_id, new.parent_section_id.as_deref());
        path.validate()?;
        let request_id = utils::new_uuid_to_bech32(APPROVAL_HRP)?;
        let now = TimeStamp::new();

        let result = self.storage.transaction(|tx| {
            let Some(mut section) = tx.active_section(&path)? else {
                return abort(RecordError::not_found("Section", &path.section_id));
            };
            if section.status == SectionStatus::PendingApproval
                || tx.pending_request_id(&path)?.is_some()
            {
                return abort(RecordError::PendingApprovalExists {
                    section_id: path.section_id.clone(),
                });
            }

            let request = ApprovalRequest {
                id: request_id.clone(),
                batch_record_id: path.batch_record_id.clone(),
                section_id: path.section_id.clone(),
                parent_section_id: path.parent_section_id.clone(),
                section_record_id: section.id.clone(),
                request_type: new.request_type.clone(),
                reason: new.reason.clone(),
                existing_data: new
                    .existing_data
                    .clone()
                    .or_else(|| Some(section.section_data.clone())),
                proposed_data: new.proposed_data.clone(),
                status: ApprovalStatus::Pending,
                status_before_request: section.status,
                requested_by: actor.user_id.clone(),
                requested_at: now.clone(),
                reviewed_by: None,
                reviewed_at: None,
                review_comments: None,
                resulting_record_id: None,
            };
            tx.put_approval(&request)?;
            tx.set_pending(&path, &request.id)?;

            section
                .apply_status(SectionStatus::PendingApproval, &actor.user_id, &now)
                .map_err(ConflictableTransactionError::Abort)?;
            section.pending_request_id = Some(request.id.clone());
            tx.put_section(&section)?;

            StatusAggregator::propagate_in(tx, &plan.tree, &path, actor, &now)?;
            StatusAggregator::recompute_batch_in(tx, &plan.tree, &path.batch_record_id, actor, &now)?;

            AuditTrail::record(
                tx,
                AuditLogEntry::new(audit::CREATE_APPROVAL_REQUEST, "ApprovalRequest", &request.id, actor)
                    .values(
                        Some(Document(json!({
                            "sectionRecordId": section.id,
                            "sectionStatus": request.status_before_request,
                        }))),
                        Some(Document(json!({
                            "requestType": request.request_type,
                            "reason": request.reason,
                            "proposedData": request.proposed_data,
                            "sectionRecordId": section.id,
                            "sectionStatus": section.status,
                        }))),
                    )
                    .batch(&path.batch_record_id),
            )?;
            Ok(request)
        });

        match &result {
            Ok(request) => tracing::info!(
                request_id = %request.id,
                batch_record_id = %request.batch_record_id,
                section_id = %request.section_id,
                request_type = request.request_type.as_str(),
                "approval request opened"
            ),
            Err(err) => tracing::warn!(
                batch_record_id = %new.batch_record_id,
                section_id = %new.section_id,
                error = %err,
                "approval request refused"
            ),
        }
        result
    }

    /// Approves a pending request. A data change lands as a new `APPROVED`
    /// version; a plain section approval promotes the version under review.
    pub fn approve(
        &self,
        request_id: &str,
        reviewer: &Actor,
        comments: Option<&str>,
    ) -> Result<ApprovalOutcome, RecordError> {
        reviewer.validate()?;
        let request = self
            .get(request_id)?
            .ok_or_else(|| RecordError::not_found("ApprovalRequest", request_id))?;
        let plan = self.sections.plan(&request.batch_record_id)?;
        let path = request.path();
        let now = TimeStamp::new();

        let result = self.storage.transaction(|tx| {
            let Some(mut request) = tx.approval(request_id)? else {
                return abort(RecordError::not_found("ApprovalRequest", request_id));
            };
            request
                .ensure_pending()
                .map_err(ConflictableTransactionError::Abort)?;
            request.review(ApprovalStatus::Approved, reviewer, comments, &now);
            tx.clear_pending(&path)?;

            let section = match &request.proposed_data {
                Some(proposed) if request.request_type.proposes_change() => self.sections.write_in(
                    tx,
                    &plan,
                    &path,
                    proposed,
                    reviewer,
                    SectionStatus::Approved,
                    true,
                    &now,
                )?,
                _ => {
                    let Some(mut section) = tx.active_section(&path)? else {
                        return abort(RecordError::not_found("Section", &path.section_id));
                    };
                    section
                        .apply_status(SectionStatus::Approved, &reviewer.user_id, &now)
                        .map_err(ConflictableTransactionError::Abort)?;
                    section.pending_request_id = None;
                    tx.put_section(&section)?;

                    StatusAggregator::propagate_in(tx, &plan.tree, &path, reviewer, &now)?;
                    StatusAggregator::recompute_batch_in(
                        tx,
                        &plan.tree,
                        &path.batch_record_id,
                        reviewer,
                        &now,
                    )?;
                    section
                }
            };

            request.resulting_record_id = Some(section.id.clone());
            tx.put_approval(&request)?;

            AuditTrail::record(
                tx,
                AuditLogEntry::new(audit::APPROVE_CHANGE_REQUEST, "ApprovalRequest", &request.id, reviewer)
                    .values(
                        Some(Document(json!({ "status": ApprovalStatus::Pending }))),
                        Some(Document(json!({
                            "status": request.status,
                            "sectionRecordId": section.id,
                            "version": section.version,
                            "sectionStatus": section.status,
                        }))),
                    )
                    .batch(&path.batch_record_id),
            )?;
            Ok(ApprovalOutcome { request, section })
        });

        match &result {
            Ok(outcome) => tracing::info!(
                request_id,
                section_id = %outcome.section.section_id,
                version = outcome.section.version,
                reviewed_by = %reviewer.user_id,
                "approval request approved"
            ),
            Err(err) => tracing::warn!(request_id, error = %err, "approval refused"),
        }
        result
    }

    /// Rejects a pending request, restoring the section's pre-request status.
    /// Section data is never touched.
    pub fn reject(
        &self,
        request_id: &str,
        reviewer: &Actor,
        comments: Option<&str>,
    ) -> Result<ApprovalOutcome, RecordError> {
        reviewer.validate()?;
        let request = self
            .get(request_id)?
            .ok_or_else(|| RecordError::not_found("ApprovalRequest", request_id))?;
        let plan = self.sections.plan(&request.batch_record_id)?;
        let path = request.path();
        let now = TimeStamp::new();

        let result = self.storage.transaction(|tx| {
            let Some(mut request) = tx.approval(request_id)? else {
                return abort(RecordError::not_found("ApprovalRequest", request_id));
            };
            request
                .ensure_pending()
                .map_err(ConflictableTransactionError::Abort)?;
            request.review(ApprovalStatus::Rejected, reviewer, comments, &now);
            tx.put_approval(&request)?;
            tx.clear_pending(&path)?;

            let Some(mut section) = tx.active_section(&path)? else {
                return abort(RecordError::not_found("Section", &path.section_id));
            };
            let under_review = section.status;
            section
                .apply_status(request.status_before_request, &reviewer.user_id, &now)
                .map_err(ConflictableTransactionError::Abort)?;
            section.pending_request_id = None;
            tx.put_section(&section)?;

            StatusAggregator::propagate_in(tx, &plan.tree, &path, reviewer, &now)?;
            StatusAggregator::recompute_batch_in(tx, &plan.tree, &path.batch_record_id, reviewer, &now)?;

            AuditTrail::record(
                tx,
                AuditLogEntry::new(audit::REJECT_CHANGE_REQUEST, "ApprovalRequest", &request.id, reviewer)
                    .values(
                        Some(Document(json!({
                            "status": ApprovalStatus::Pending,
                            "sectionStatus": under_review,
                        }))),
                        Some(Document(json!({
                            "status": request.status,
                            "sectionStatus": section.status,
                            "reviewComments": request.review_comments,
                        }))),
                    )
                    .batch(&path.batch_record_id),
            )?;
            Ok(ApprovalOutcome { request, section })
        });

        match &result {
            Ok(outcome) => tracing::info!(
                request_id,
                section_id = %outcome.section.section_id,
                restored = %outcome.section.status,
                reviewed_by = %reviewer.user_id,
                "approval request rejected"
            ),
            Err(err) => tracing::warn!(request_id, error = %err, "rejection refused"),
        }
        result
    }

    pub fn get(&self, request_id: &str) -> Result<Option<ApprovalRequest>, RecordError> {
        self.storage.approval(request_id)
    }

    /// The open request on a section, if any.
    pub fn pending_for(&self, path: &SectionPath) -> Result<Option<ApprovalRequest>, RecordError> {
        match self.storage.pending_request_id(path)? {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }
}
