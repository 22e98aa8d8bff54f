//! Shared value types: timestamps, status enums and structured documents
use super::canonical;
use super::error::RecordError;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Time elapsed from `earlier` to `self`; negative when `earlier` is in the future.
    pub fn since(&self, earlier: &TimeStamp<Utc>) -> TimeDelta {
        self.0 - earlier.0
    }
    pub fn plus_seconds(&self, secs: i64) -> Self {
        Self(self.0 + TimeDelta::seconds(secs))
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl Serialize for TimeStamp<Utc> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

/// Lifecycle status of a section version.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SectionStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Completed,
    #[n(2)]
    PendingApproval,
    #[n(3)]
    Approved,
    #[n(4)]
    ApprovedForChange,
}

impl SectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionStatus::Draft => "DRAFT",
            SectionStatus::Completed => "COMPLETED",
            SectionStatus::PendingApproval => "PENDING_APPROVAL",
            SectionStatus::Approved => "APPROVED",
            SectionStatus::ApprovedForChange => "APPROVED_FOR_CHANGE",
        }
    }

    /// Locked sections reject direct writes.
    pub fn is_locked(&self) -> bool {
        matches!(self, SectionStatus::Completed | SectionStatus::PendingApproval)
    }

    /// Statuses that count as "completed" for parent, batch and dependency evaluation.
    pub fn is_completed_equivalent(&self) -> bool {
        !matches!(self, SectionStatus::Draft)
    }

    pub fn is_approved_equivalent(&self) -> bool {
        matches!(
            self,
            SectionStatus::Approved | SectionStatus::ApprovedForChange
        )
    }

    /// Transition table for the active version of a section.
    ///
    /// Approval states are only reachable by resolving a pending request, and a
    /// section can never hold two pending requests at once.
    pub fn can_transition_to(&self, to: SectionStatus) -> bool {
        use SectionStatus::*;

        match (*self, to) {
            (PendingApproval, PendingApproval) => false,
            (_, PendingApproval) => true,
            (PendingApproval, _) => true,
            (Draft, Draft | Completed) => true,
            (Completed, Completed | Draft) => true,
            (Approved | ApprovedForChange, Draft | Completed | Approved | ApprovedForChange) => {
                true
            }
            (Draft | Completed, Approved | ApprovedForChange) => false,
        }
    }

    pub fn transition(&self, to: SectionStatus) -> Result<SectionStatus, RecordError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(RecordError::IllegalTransition { from: *self, to })
        }
    }
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(SectionStatus::Draft),
            "COMPLETED" => Ok(SectionStatus::Completed),
            "PENDING_APPROVAL" => Ok(SectionStatus::PendingApproval),
            "APPROVED" => Ok(SectionStatus::Approved),
            "APPROVED_FOR_CHANGE" => Ok(SectionStatus::ApprovedForChange),
            other => Err(RecordError::validation(format!(
                "unknown section status '{other}'"
            ))),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    #[n(0)]
    InProgress,
    #[n(1)]
    Completed,
}

/// What an approval request asks for. Anything other than a plain sign-off
/// proposes new section data.
#[derive(
    Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum RequestType {
    #[n(0)]
    SectionApproval,
    #[n(1)]
    DataChange {
        #[n(0)]
        kind: String,
    },
}

impl RequestType {
    pub const SECTION_APPROVAL: &'static str = "SECTION_APPROVAL";

    pub fn parse(value: &str) -> Result<Self, RecordError> {
        match value.trim() {
            "" => Err(RecordError::validation("requestType is required")),
            Self::SECTION_APPROVAL => Ok(RequestType::SectionApproval),
            kind => Ok(RequestType::DataChange { kind: kind.into() }),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RequestType::SectionApproval => Self::SECTION_APPROVAL,
            RequestType::DataChange { kind } => kind,
        }
    }

    pub fn proposes_change(&self) -> bool {
        matches!(self, RequestType::DataChange { .. })
    }
}

impl TryFrom<String> for RequestType {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RequestType::parse(&value)
    }
}

impl From<RequestType> for String {
    fn from(value: RequestType) -> Self {
        value.as_str().to_string()
    }
}

/// An arbitrary structured payload (section data, approval snapshots).
///
/// Persisted as its canonical JSON text so the stored bytes do not depend on
/// how the caller built the value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub serde_json::Value);

impl Document {
    pub fn empty() -> Self {
        Document(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// Null, `{}`, `[]` and `""` carry no substantive data.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::String(text) => text.is_empty(),
            _ => false,
        }
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        Document(value)
    }
}

impl<C> minicbor::Encode<C> for Document {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&canonical::canonical_string(&self.0))?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Document {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;

        serde_json::from_str(text)
            .map(Document)
            .map_err(|_| minicbor::decode::Error::message("stored document is not valid json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn approval_states_require_a_pending_request() {
        assert!(!SectionStatus::Completed.can_transition_to(SectionStatus::Approved));
        assert!(!SectionStatus::Draft.can_transition_to(SectionStatus::ApprovedForChange));
        assert!(SectionStatus::PendingApproval.can_transition_to(SectionStatus::Approved));
        assert!(SectionStatus::PendingApproval.can_transition_to(SectionStatus::Completed));
    }

    #[test]
    fn no_double_pending() {
        let err = SectionStatus::PendingApproval
            .transition(SectionStatus::PendingApproval)
            .unwrap_err();
        assert!(matches!(err, RecordError::IllegalTransition { .. }));
        assert!(SectionStatus::Approved.can_transition_to(SectionStatus::PendingApproval));
    }

    #[test]
    fn status_round_trips_through_its_label() {
        for status in [
            SectionStatus::Draft,
            SectionStatus::Completed,
            SectionStatus::PendingApproval,
            SectionStatus::Approved,
            SectionStatus::ApprovedForChange,
        ] {
            assert_eq!(status.as_str().parse::<SectionStatus>().unwrap(), status);
        }
        assert!("REJECTED".parse::<SectionStatus>().is_err());
    }

    #[test]
    fn request_type_parsing() {
        assert_eq!(
            RequestType::parse("SECTION_APPROVAL").unwrap(),
            RequestType::SectionApproval
        );
        let change = RequestType::parse("DATA_CORRECTION").unwrap();
        assert!(change.proposes_change());
        assert_eq!(change.as_str(), "DATA_CORRECTION");
        assert!(RequestType::parse("  ").is_err());
    }

    #[test]
    fn document_emptiness() {
        assert!(Document::empty().is_empty());
        assert!(Document(serde_json::Value::Null).is_empty());
        assert!(!Document(json!({"x": 1})).is_empty());
        assert!(!Document(json!(0)).is_empty());
    }

    #[test]
    fn document_is_stored_canonically() {
        let doc = Document(json!({"b": [2, 1], "a": {"z": true, "y": null}}));

        let encoded = minicbor::to_vec(&doc).unwrap();
        let decoded: Document = minicbor::decode(&encoded).unwrap();

        assert_eq!(doc, decoded);
    }

    #[test]
    fn decimals_survive_storage_exactly() {
        let doc = Document(json!({
            "weight": 985.6906946328695,
            "trace": 1.0715660391465826e-75,
            "yield": [99.1, 0.30000000000000004],
        }));

        let encoded = minicbor::to_vec(&doc).unwrap();
        let decoded: Document = minicbor::decode(&encoded).unwrap();

        assert_eq!(decoded.0["weight"].as_f64(), Some(985.6906946328695));
        assert_eq!(decoded.0["trace"].as_f64(), Some(1.0715660391465826e-75));
        assert_eq!(
            canonical::canonical_string(&decoded.0),
            canonical::canonical_string(&doc.0)
        );
    }
}
