//! Electronic signatures binding a user to the exact payload of an action.
//!
//! A signature stores only the sha256 of the canonicalized payload. To authorize
//! an action the caller rebuilds the payload from the request it is about to
//! execute; any drift in the parameters changes the hash and the check fails.
use super::audit::{self, AuditLogEntry, AuditTrail};
use super::canonical;
use super::error::{RecordError, SignatureFailure};
use super::section::Actor;
use super::storage::{Storage, abort};
use super::types::{Document, TimeStamp};
use super::utils::{self, SIGNATURE_HRP};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

/// Immutable once stored.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectronicSignature {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub entity_type: String,
    #[n(3)]
    pub entity_id: String,
    #[n(4)]
    pub payload_hash: String,
    #[n(5)]
    pub batch_record_id: Option<String>,
    #[n(6)]
    pub section_record_id: Option<String>,
    #[n(7)]
    pub ip: Option<String>,
    #[n(8)]
    pub user_agent: Option<String>,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

/// Marks a signature as spent by one protected action.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct SignatureConsumption {
    #[n(0)]
    pub signature_id: String,
    #[n(1)]
    pub action: String,
    #[n(2)]
    pub consumed_by: String,
    #[n(3)]
    pub consumed_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SignatureRequest {
    pub user_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub batch_record_id: Option<String>,
    pub section_record_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid(SignatureFailure),
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verification::Valid)
    }

    pub fn reason(&self) -> Option<SignatureFailure> {
        match self {
            Verification::Valid => None,
            Verification::Invalid(reason) => Some(*reason),
        }
    }

    pub fn into_result(self) -> Result<(), RecordError> {
        match self {
            Verification::Valid => Ok(()),
            Verification::Invalid(reason) => Err(RecordError::SignatureInvalid(reason)),
        }
    }
}

fn expected_hash<T: Serialize + ?Sized>(payload: &T) -> Result<String, RecordError> {
    canonical::payload_hash(payload)
        .map_err(|e| RecordError::validation(format!("payload cannot be canonicalized: {e}")))
}

/// Checks in a fixed order: user, payload hash, then age.
fn evaluate(
    signature: &ElectronicSignature,
    expected_user_id: &str,
    expected_hash: &str,
    max_age: Option<Duration>,
    now: &TimeStamp<Utc>,
) -> Verification {
    if signature.user_id != expected_user_id {
        return Verification::Invalid(SignatureFailure::UserMismatch);
    }
    if signature.payload_hash != expected_hash {
        return Verification::Invalid(SignatureFailure::HashMismatch);
    }
    if let Some(max_age) = max_age {
        let max_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        if now.since(&signature.created_at).num_milliseconds() > max_ms {
            return Verification::Invalid(SignatureFailure::Expired);
        }
    }
    Verification::Valid
}

#[derive(Debug, Clone)]
pub struct SignatureService {
    storage: Storage,
}

impl SignatureService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn create(&self, request: SignatureRequest) -> Result<ElectronicSignature, RecordError> {
        if request.user_id.trim().is_empty() {
            return Err(RecordError::validation("userId is required to sign"));
        }
        if request.entity_type.trim().is_empty() {
            return Err(RecordError::validation("entityType is required to sign"));
        }

        let signature = ElectronicSignature {
            id: utils::new_uuid_to_bech32(SIGNATURE_HRP)?,
            user_id: request.user_id.clone(),
            entity_type: request.entity_type.clone(),
            entity_id: request.entity_id.clone(),
            payload_hash: expected_hash(&request.payload)?,
            batch_record_id: request.batch_record_id.clone(),
            section_record_id: request.section_record_id.clone(),
            ip: request.ip.clone(),
            user_agent: request.user_agent.clone(),
            created_at: TimeStamp::new(),
        };
        let actor = Actor {
            user_id: request.user_id,
            ip: request.ip,
            user_agent: request.user_agent,
        };

        self.storage.transaction(|tx| {
            tx.put_signature(&signature)?;

            let mut entry = AuditLogEntry::new(
                audit::CREATE_SIGNATURE,
                "ElectronicSignature",
                &signature.id,
                &actor,
            )
            .values(
                None,
                Some(Document(json!({
                    "entityType": signature.entity_type,
                    "entityId": signature.entity_id,
                    "payloadHash": signature.payload_hash,
                }))),
            );
            if let Some(batch) = &signature.batch_record_id {
                entry = entry.batch(batch);
            }
            AuditTrail::record(tx, entry)?;
            Ok(())
        })?;

        tracing::info!(
            signature_id = %signature.id,
            user_id = %signature.user_id,
            entity_type = %signature.entity_type,
            "electronic signature created"
        );
        Ok(signature)
    }

    pub fn get(&self, signature_id: &str) -> Result<Option<ElectronicSignature>, RecordError> {
        self.storage.signature(signature_id)
    }

    /// Read-only check; may be repeated any number of times.
    pub fn verify<T: Serialize + ?Sized>(
        &self,
        signature_id: &str,
        expected_user_id: &str,
        expected_payload: &T,
        max_age: Option<Duration>,
    ) -> Result<Verification, RecordError> {
        self.verify_at(
            signature_id,
            expected_user_id,
            expected_payload,
            max_age,
            &TimeStamp::new(),
        )
    }

    pub fn verify_at<T: Serialize + ?Sized>(
        &self,
        signature_id: &str,
        expected_user_id: &str,
        expected_payload: &T,
        max_age: Option<Duration>,
        now: &TimeStamp<Utc>,
    ) -> Result<Verification, RecordError> {
        let hash = expected_hash(expected_payload)?;
        let verification = match self.storage.signature(signature_id)? {
            Some(signature) => evaluate(&signature, expected_user_id, &hash, max_age, now),
            None => Verification::Invalid(SignatureFailure::NotFound),
        };

        if let Verification::Invalid(reason) = verification {
            tracing::warn!(signature_id, %reason, "signature verification failed");
        }
        Ok(verification)
    }

    /// Verifies and spends the signature for `action` in one transaction.
    pub fn consume<T: Serialize + ?Sized>(
        &self,
        signature_id: &str,
        expected_user_id: &str,
        expected_payload: &T,
        max_age: Option<Duration>,
        action: &str,
    ) -> Result<ElectronicSignature, RecordError> {
        self.consume_at(
            signature_id,
            expected_user_id,
            expected_payload,
            max_age,
            action,
            &TimeStamp::new(),
        )
    }

    pub fn consume_at<T: Serialize + ?Sized>(
        &self,
        signature_id: &str,
        expected_user_id: &str,
        expected_payload: &T,
        max_age: Option<Duration>,
        action: &str,
        now: &TimeStamp<Utc>,
    ) -> Result<ElectronicSignature, RecordError> {
        let hash = expected_hash(expected_payload)?;
        let actor = Actor::new(expected_user_id);

        let result = self.storage.transaction(|tx| {
            let Some(signature) = tx.signature(signature_id)? else {
                return abort(RecordError::SignatureInvalid(SignatureFailure::NotFound));
            };
            if let Verification::Invalid(reason) =
                evaluate(&signature, expected_user_id, &hash, max_age, now)
            {
                return abort(RecordError::SignatureInvalid(reason));
            }
            if tx.consumption(signature_id)?.is_some() {
                return abort(RecordError::SignatureInvalid(
                    SignatureFailure::AlreadyConsumed,
                ));
            }

            tx.put_consumption(&SignatureConsumption {
                signature_id: signature_id.into(),
                action: action.into(),
                consumed_by: expected_user_id.into(),
                consumed_at: now.clone(),
            })?;

            let mut entry =
                AuditLogEntry::new(audit::CONSUME_SIGNATURE, "ElectronicSignature", signature_id, &actor)
                    .values(None, Some(Document(json!({ "action": action }))));
            if let Some(batch) = &signature.batch_record_id {
                entry = entry.batch(batch);
            }
            AuditTrail::record(tx, entry)?;
            Ok(signature)
        });

        match &result {
            Ok(_) => tracing::info!(signature_id, action, "signature consumed"),
            Err(err) => tracing::warn!(signature_id, action, error = %err, "signature rejected"),
        }
        result
    }

    /// The action a signature was spent on, if any.
    pub fn consumption(&self, signature_id: &str) -> Result<Option<SignatureConsumption>, RecordError> {
        self.storage.consumption(signature_id)
    }
}
