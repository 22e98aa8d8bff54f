//! Service layer API: request bodies in, records or client-facing errors out
use super::approval::{ApprovalOutcome, ApprovalRequest, ApprovalWorkflow, NewApprovalRequest};
use super::audit::{self, AuditTrail};
use super::config::Config;
use super::error::RecordError;
use super::section::{Actor, BatchRecord, SectionPath, SectionRecord};
use super::signature::{SignatureRequest, SignatureService};
use super::status::StatusAggregator;
use super::storage::Storage;
use super::store::SectionStore;
use super::template::TemplateProvider;
use super::types::{Document, RequestType, SectionStatus, TimeStamp};
use super::validation::{self, SectionValidator};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

pub const COMPLETE_SECTION: &str = "COMPLETE_SECTION";
pub const SECTION_ENTITY: &str = "BatchRecordSection";
pub const APPROVAL_ENTITY: &str = "ApprovalRequest";

/// The payload a user signs to complete a section.
pub fn complete_section_payload(
    batch_record_id: &str,
    section_id: &str,
    parent_section_id: Option<&str>,
) -> Value {
    json!({
        "action": COMPLETE_SECTION,
        "entityType": SECTION_ENTITY,
        "batchRecordId": batch_record_id,
        "sectionId": section_id,
        "parentSectionId": parent_section_id,
    })
}

/// The payload a reviewer signs to approve a change request.
pub fn approve_request_payload(request_id: &str, batch_record_id: &str, section_id: &str) -> Value {
    json!({
        "action": audit::APPROVE_CHANGE_REQUEST,
        "entityType": APPROVAL_ENTITY,
        "entityId": request_id,
        "batchRecordId": batch_record_id,
        "sectionId": section_id,
    })
}

/// Error shape handed back to clients.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{status} {code}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
}

impl From<RecordError> for ApiError {
    fn from(err: RecordError) -> Self {
        let kind = err.kind();
        if kind.status_code() >= 500 {
            tracing::error!(error = %err, code = kind.code(), "request failed");
        }
        ApiError {
            status: kind.status_code(),
            code: kind.code(),
            message: err.to_string(),
        }
    }
}

/// Decodes a JSON request body, reporting malformed input as a validation error.
pub fn decode_body<T: DeserializeOwned>(raw: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(raw)
        .map_err(|e| ApiError::from(RecordError::validation(format!("malformed request body: {e}"))))
}

/// Transport metadata copied into audit entries and signatures.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn actor(&self, user_id: &str) -> Actor {
        Actor {
            user_id: user_id.into(),
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBatchBody {
    pub batch_record_id: String,
    pub template_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSectionBody {
    pub section_id: String,
    pub section_data: Document,
    #[serde(default)]
    pub parent_section_id: Option<String>,
    pub user_id: String,
    pub signature_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApprovalBody {
    pub batch_record_id: String,
    pub section_id: String,
    #[serde(default)]
    pub parent_section_id: Option<String>,
    pub request_type: String,
    pub reason: String,
    #[serde(default)]
    pub existing_data: Option<Document>,
    #[serde(default)]
    pub proposed_data: Option<Document>,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveBody {
    pub reviewed_by: String,
    #[serde(default)]
    pub review_comments: Option<String>,
    pub signature_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectBody {
    pub reviewed_by: String,
    #[serde(default)]
    pub review_comments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSignatureBody {
    pub user_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub canonical_payload: Value,
    #[serde(default)]
    pub batch_record_id: Option<String>,
    #[serde(default)]
    pub section_record_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureReceipt {
    pub id: String,
    pub created_at: TimeStamp<Utc>,
}

pub struct RecordService {
    storage: Storage,
    sections: SectionStore,
    approvals: ApprovalWorkflow,
    signatures: SignatureService,
    status: StatusAggregator,
    audit: AuditTrail,
    config: Config,
    validators: Vec<Box<dyn SectionValidator>>,
}

impl RecordService {
    pub fn new(
        instance: Arc<sled::Db>,
        templates: Arc<dyn TemplateProvider>,
        config: Config,
    ) -> Result<Self, RecordError> {
        let storage = Storage::new(instance)?;
        let sections = SectionStore::new(storage.clone(), templates.clone());

        Ok(Self {
            approvals: ApprovalWorkflow::new(storage.clone(), sections.clone()),
            signatures: SignatureService::new(storage.clone()),
            status: StatusAggregator::new(storage.clone(), templates),
            audit: AuditTrail::new(storage.clone()),
            sections,
            storage,
            config,
            validators: vec![],
        })
    }

    /// Opens the database at `config.db_path`.
    pub fn open(templates: Arc<dyn TemplateProvider>, config: Config) -> Result<Self, RecordError> {
        let db = sled::open(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "batch record store opened");
        Self::new(Arc::new(db), templates, config)
    }

    pub fn with_validator(mut self, validator: impl SectionValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn sections(&self) -> &SectionStore {
        &self.sections
    }

    pub fn approvals(&self) -> &ApprovalWorkflow {
        &self.approvals
    }

    pub fn signatures(&self) -> &SignatureService {
        &self.signatures
    }

    pub fn status(&self) -> &StatusAggregator {
        &self.status
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flush(&self) -> Result<(), ApiError> {
        Ok(self.storage.flush()?)
    }

    /// Spends or checks a signature against the payload rebuilt from the request.
    fn authorize(
        &self,
        signature_id: &str,
        user_id: &str,
        payload: &Value,
        action: &str,
    ) -> Result<(), RecordError> {
        if signature_id.trim().is_empty() {
            return Err(RecordError::validation("signatureId is required"));
        }
        let max_age = Some(self.config.signature_max_age());

        if self.config.single_use_signatures {
            self.signatures
                .consume(signature_id, user_id, payload, max_age, action)?;
            Ok(())
        } else {
            self.signatures
                .verify(signature_id, user_id, payload, max_age)?
                .into_result()
        }
    }

    pub fn register_batch(
        &self,
        body: RegisterBatchBody,
        ctx: &RequestContext,
    ) -> Result<BatchRecord, ApiError> {
        let actor = ctx.actor(&body.user_id);
        Ok(self
            .status
            .register_batch(&body.batch_record_id, &body.template_id, &actor)?)
    }

    /// `POST /batchRecordSections/{batchRecordId}/section[/{sectionId}]`
    pub fn complete_section(
        &self,
        batch_record_id: &str,
        route_section_id: Option<&str>,
        body: CompleteSectionBody,
        ctx: &RequestContext,
    ) -> Result<SectionRecord, ApiError> {
        if let Some(route) = route_section_id {
            if route != body.section_id {
                return Err(RecordError::validation(format!(
                    "route section '{route}' does not match body section '{}'",
                    body.section_id
                ))
                .into());
            }
        }
        let actor = ctx.actor(&body.user_id);
        actor.validate()?;
        SectionPath::new(
            batch_record_id,
            &body.section_id,
            body.parent_section_id.as_deref(),
        )
        .validate()?;
        if body.section_data.is_empty() {
            return Err(RecordError::validation(format!(
                "sectionData is required to complete section '{}'",
                body.section_id
            ))
            .into());
        }
        validation::run_all(&self.validators, &body.section_id, &body.section_data)?;

        let payload = complete_section_payload(
            batch_record_id,
            &body.section_id,
            body.parent_section_id.as_deref(),
        );
        self.authorize(&body.signature_id, &body.user_id, &payload, COMPLETE_SECTION)?;

        Ok(self.sections.write(
            batch_record_id,
            &body.section_id,
            body.section_data,
            &actor,
            body.parent_section_id.as_deref(),
            SectionStatus::Completed,
        )?)
    }

    /// `POST /approvalRequests`
    pub fn create_approval_request(
        &self,
        body: CreateApprovalBody,
        ctx: &RequestContext,
    ) -> Result<ApprovalRequest, ApiError> {
        let actor = ctx.actor(&body.user_id);
        let request_type = RequestType::parse(&body.request_type)?;
        if let Some(proposed) = &body.proposed_data {
            validation::run_all(&self.validators, &body.section_id, proposed)?;
        }

        Ok(self.approvals.create_request(
            NewApprovalRequest {
                batch_record_id: body.batch_record_id,
                section_id: body.section_id,
                parent_section_id: body.parent_section_id,
                request_type,
                reason: body.reason,
                existing_data: body.existing_data,
                proposed_data: body.proposed_data,
            },
            &actor,
        )?)
    }

    /// `POST /approvalRequests/{id}/approve`
    pub fn approve_request(
        &self,
        request_id: &str,
        body: ApproveBody,
        ctx: &RequestContext,
    ) -> Result<ApprovalOutcome, ApiError> {
        let reviewer = ctx.actor(&body.reviewed_by);
        reviewer.validate()?;
        let request = self
            .approvals
            .get(request_id)?
            .ok_or_else(|| RecordError::not_found("ApprovalRequest", request_id))?;
        // checked before the signature is spent
        request.ensure_pending()?;

        let payload =
            approve_request_payload(request_id, &request.batch_record_id, &request.section_id);
        self.authorize(
            &body.signature_id,
            &body.reviewed_by,
            &payload,
            audit::APPROVE_CHANGE_REQUEST,
        )?;

        Ok(self
            .approvals
            .approve(request_id, &reviewer, body.review_comments.as_deref())?)
    }

    /// `POST /approvalRequests/{id}/reject`
    pub fn reject_request(
        &self,
        request_id: &str,
        body: RejectBody,
        ctx: &RequestContext,
    ) -> Result<ApprovalOutcome, ApiError> {
        let reviewer = ctx.actor(&body.reviewed_by);
        Ok(self
            .approvals
            .reject(request_id, &reviewer, body.review_comments.as_deref())?)
    }

    /// `POST /signatures`
    pub fn create_signature(
        &self,
        body: CreateSignatureBody,
        ctx: &RequestContext,
    ) -> Result<SignatureReceipt, ApiError> {
        let signature = self.signatures.create(SignatureRequest {
            user_id: body.user_id,
            entity_type: body.entity_type,
            entity_id: body.entity_id,
            payload: body.canonical_payload,
            batch_record_id: body.batch_record_id,
            section_record_id: body.section_record_id,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
        })?;

        Ok(SignatureReceipt {
            id: signature.id,
            created_at: signature.created_at,
        })
    }

    pub fn section_history(
        &self,
        batch_record_id: &str,
        section_id: &str,
    ) -> Result<Vec<SectionRecord>, ApiError> {
        let Some(active) = self.sections.active_in_batch(batch_record_id, section_id)? else {
            return Err(RecordError::not_found("Section", section_id).into());
        };
        Ok(self.sections.history(&active.path())?)
    }
}
