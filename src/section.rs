//! Section versions, section paths and batch records
use super::error::RecordError;
use super::types::{BatchStatus, Document, SectionStatus, TimeStamp};
use super::utils::{self, KEY_SEPARATOR};
use chrono::Utc;
use serde::Serialize;

/// Identifies one section slot in a batch. Each path owns a chain of versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionPath {
    pub batch_record_id: String,
    pub section_id: String,
    pub parent_section_id: Option<String>,
}

impl SectionPath {
    pub fn new(batch_record_id: &str, section_id: &str, parent_section_id: Option<&str>) -> Self {
        Self {
            batch_record_id: batch_record_id.into(),
            section_id: section_id.into(),
            parent_section_id: parent_section_id.map(Into::into),
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        let parts = [
            ("batchRecordId", Some(self.batch_record_id.as_str())),
            ("sectionId", Some(self.section_id.as_str())),
            ("parentSectionId", self.parent_section_id.as_deref()),
        ];
        for (name, value) in parts {
            match value {
                Some(v) if v.trim().is_empty() => {
                    return Err(RecordError::validation(format!("{name} must not be empty")));
                }
                Some(v) if v.as_bytes().contains(&KEY_SEPARATOR) => {
                    return Err(RecordError::validation(format!(
                        "{name} contains a control character"
                    )));
                }
                _ => {}
            }
        }
        if self.parent_section_id.as_deref() == Some(self.section_id.as_str()) {
            return Err(RecordError::validation(format!(
                "section '{}' cannot be its own parent",
                self.section_id
            )));
        }
        Ok(())
    }

    /// Storage key; unique per path.
    pub fn key(&self) -> Vec<u8> {
        utils::composite_key(&[
            &self.batch_record_id,
            &self.section_id,
            self.parent_section_id.as_deref().unwrap_or(""),
        ])
    }
}

/// One version of a section. `section_data` never changes once inserted;
/// superseded versions are frozen entirely.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionRecord {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub batch_record_id: String,
    #[n(2)]
    pub section_id: String,
    #[n(3)]
    pub parent_section_id: Option<String>,
    #[n(4)]
    pub version: u64,
    #[n(5)]
    pub is_active: bool,
    #[n(6)]
    pub section_data: Document,
    #[n(7)]
    pub status: SectionStatus,
    #[n(8)]
    pub locked_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub locked_by: Option<String>,
    #[n(10)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub completed_by: Option<String>,
    #[n(12)]
    pub previous_version_id: Option<String>, // back-reference to the superseded version
    #[n(13)]
    pub pending_request_id: Option<String>,
    #[n(14)]
    pub created_by: String,
    #[n(15)]
    pub created_at: TimeStamp<Utc>,
}

impl SectionRecord {
    /// Empty version-1 placeholder created when a batch's tree is materialized.
    pub fn placeholder(id: String, path: &SectionPath, created_by: &str, now: &TimeStamp<Utc>) -> Self {
        Self {
            id,
            batch_record_id: path.batch_record_id.clone(),
            section_id: path.section_id.clone(),
            parent_section_id: path.parent_section_id.clone(),
            version: 1,
            is_active: true,
            section_data: Document::empty(),
            status: SectionStatus::Draft,
            locked_at: None,
            locked_by: None,
            completed_at: None,
            completed_by: None,
            previous_version_id: None,
            pending_request_id: None,
            created_by: created_by.into(),
            created_at: now.clone(),
        }
    }

    pub fn path(&self) -> SectionPath {
        SectionPath::new(
            &self.batch_record_id,
            &self.section_id,
            self.parent_section_id.as_deref(),
        )
    }

    pub fn is_untouched_placeholder(&self) -> bool {
        self.version == 1
            && self.previous_version_id.is_none()
            && self.status == SectionStatus::Draft
            && self.section_data.is_empty()
    }

    /// Moves the active version to `status`, stamping lock metadata when it
    /// becomes completed-equivalent for the first time.
    pub fn apply_status(
        &mut self,
        status: SectionStatus,
        user_id: &str,
        now: &TimeStamp<Utc>,
    ) -> Result<(), RecordError> {
        self.status = self.status.transition(status)?;
        if status.is_completed_equivalent() {
            self.stamp_lock(user_id, now);
            if status != SectionStatus::PendingApproval && self.completed_at.is_none() {
                self.completed_at = Some(now.clone());
                self.completed_by = Some(user_id.into());
            }
        } else {
            self.locked_at = None;
            self.locked_by = None;
            self.completed_at = None;
            self.completed_by = None;
        }
        Ok(())
    }

    pub fn stamp_lock(&mut self, user_id: &str, now: &TimeStamp<Utc>) {
        if self.locked_at.is_none() {
            self.locked_at = Some(now.clone());
            self.locked_by = Some(user_id.into());
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub template_id: String,
    #[n(2)]
    pub status: BatchStatus,
    #[n(3)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub completed_by: Option<String>,
    #[n(5)]
    pub created_by: String,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

/// Who performs an operation, and from where.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Actor {
    pub user_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.user_id.trim().is_empty() {
            return Err(RecordError::validation("userId is required"));
        }
        Ok(())
    }
}
