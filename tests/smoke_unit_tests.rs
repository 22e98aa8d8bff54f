//! Smoke screen tests for the components behind the service layer.
//!
//! Each test drives one component (store, signatures, dependencies, status)
//! against its own sled database, without going through request bodies.

use anyhow::Context;
use batch_record::{
    RecordError, SignatureFailure,
    approval::{ApprovalWorkflow, NewApprovalRequest},
    audit::{AuditLogEntry, AuditTrail},
    dependency::{DependencyCheck, DependencyEvaluator},
    section::{Actor, SectionPath},
    signature::{SignatureRequest, SignatureService, Verification},
    status::StatusAggregator,
    storage::Storage,
    store::SectionStore,
    template::{SectionRule, StaticTemplates, TemplateProvider, TemplateSection},
    types::{BatchStatus, Document, RequestType, SectionStatus},
};
use serde_json::json;
use sled::open;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

const TEMPLATE: &str = "tmpl_capsule";

struct Fixture {
    _dir: TempDir,
    storage: Storage,
    templates: Arc<dyn TemplateProvider>,
    store: SectionStore,
    status: StatusAggregator,
}

fn fixture() -> anyhow::Result<Fixture> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join("smoke.db"))?;
    let storage = Storage::new(Arc::new(db))?;
    let templates: Arc<dyn TemplateProvider> = Arc::new(
        StaticTemplates::new()
            .with_template(
                TEMPLATE,
                vec![
                    TemplateSection::leaf("A"),
                    TemplateSection::leaf("B"),
                    TemplateSection::leaf("S1"),
                ],
            )
            .with_rule(TEMPLATE, "B", SectionRule::dependency("A", "completed")),
    );

    let status = StatusAggregator::new(storage.clone(), templates.clone());
    status.register_batch("B1", TEMPLATE, &Actor::new("U1"))?;

    Ok(Fixture {
        _dir: temp_dir,
        store: SectionStore::new(storage.clone(), templates.clone()),
        storage,
        templates,
        status,
    })
}

// SECTION STORE

#[test]
fn empty_draft_write_is_a_no_op() -> anyhow::Result<()> {
    let fx = fixture()?;
    let actor = Actor::new("U1");
    assert_eq!(fx.store.initialize("B1", &actor)?, 3);
    assert_eq!(fx.store.initialize("B1", &actor)?, 0);

    let record = fx
        .store
        .write("B1", "S1", Document::empty(), &actor, None, SectionStatus::Draft)?;
    assert_eq!(record.version, 1);
    assert!(record.is_untouched_placeholder());

    let path = SectionPath::new("B1", "S1", None);
    assert_eq!(fx.store.history(&path)?.len(), 1);
    Ok(())
}

#[test]
fn draft_writes_append_versions() -> anyhow::Result<()> {
    let fx = fixture()?;
    let actor = Actor::new("U1");

    for n in 1..=4 {
        fx.store
            .write("B1", "S1", Document(json!({"n": n})), &actor, None, SectionStatus::Draft)?;
    }

    let history = fx.store.history(&SectionPath::new("B1", "S1", None))?;
    let versions: Vec<u64> = history.iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4]);
    assert_eq!(history.iter().filter(|r| r.is_active).count(), 1);
    assert_eq!(history[0].section_data, Document(json!({"n": 1})));
    for pair in history.windows(2) {
        assert_eq!(pair[1].previous_version_id.as_deref(), Some(pair[0].id.as_str()));
    }
    Ok(())
}

#[test]
fn locked_write_checks_dependencies_first() -> anyhow::Result<()> {
    let fx = fixture()?;
    let actor = Actor::new("U1");
    fx.store
        .write("B1", "B", Document(json!({"y": 1})), &actor, None, SectionStatus::Completed)?;

    let err = fx
        .store
        .write("B1", "B", Document(json!({"y": 2})), &actor, None, SectionStatus::Completed)
        .unwrap_err();
    assert!(matches!(err, RecordError::DependencyUnmet { ref source_section_id, .. } if source_section_id == "A"));

    fx.store
        .write("B1", "A", Document(json!({"z": 1})), &actor, None, SectionStatus::Completed)?;
    let err = fx
        .store
        .write("B1", "B", Document(json!({"y": 2})), &actor, None, SectionStatus::Completed)
        .unwrap_err();
    assert!(matches!(err, RecordError::SectionLocked { status: SectionStatus::Completed, .. }));
    Ok(())
}

#[test]
fn concurrent_writers_never_fork_a_section() -> anyhow::Result<()> {
    let fx = fixture()?;
    fx.store.initialize("B1", &Actor::new("U1"))?;

    let results: Vec<Result<_, RecordError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = &fx.store;
                scope.spawn(move || {
                    store.write(
                        "B1",
                        "S1",
                        Document(json!({"writer": n})),
                        &Actor::new(&format!("U{n}")),
                        None,
                        SectionStatus::Draft,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("writer thread panicked"))
            .collect()
    });

    let succeeded = results.iter().filter(|r| r.is_ok()).count() as u64;
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(err, RecordError::ConcurrencyConflict { .. }), "{err}");
    }

    let history = fx.store.history(&SectionPath::new("B1", "S1", None))?;
    assert_eq!(history.len() as u64, succeeded);
    assert_eq!(history.iter().filter(|r| r.is_active).count(), 1);
    assert!(history.iter().enumerate().all(|(i, r)| r.version == i as u64 + 1));
    Ok(())
}

#[test]
fn batch_sections_lists_active_versions() -> anyhow::Result<()> {
    let fx = fixture()?;
    let actor = Actor::new("U1");
    fx.store
        .write("B1", "A", Document(json!({"a": 1})), &actor, None, SectionStatus::Draft)?;
    fx.store
        .write("B1", "A", Document(json!({"a": 2})), &actor, None, SectionStatus::Draft)?;

    let sections = fx.store.batch_sections("B1")?;
    assert_eq!(sections.len(), 3);
    assert!(sections.iter().all(|r| r.is_active));
    let a = sections
        .iter()
        .find(|r| r.section_id == "A")
        .context("section A")?;
    assert_eq!(a.version, 2);
    Ok(())
}

// DEPENDENCIES

#[test]
fn dependency_check_follows_source_status() -> anyhow::Result<()> {
    let fx = fixture()?;
    let evaluator = DependencyEvaluator::new(fx.storage.clone(), fx.templates.clone());

    // a source that was never written counts as not started
    let check = evaluator.check("B", "B1")?;
    assert!(matches!(check, DependencyCheck::Unmet { ref message, .. } if message.contains("not started")));

    fx.store.write(
        "B1",
        "A",
        Document(json!({"z": 1})),
        &Actor::new("U1"),
        None,
        SectionStatus::Completed,
    )?;
    assert_eq!(evaluator.check("B", "B1")?, DependencyCheck::Satisfied);
    assert!(evaluator.check("S1", "B1")?.is_ok());
    Ok(())
}

#[test]
fn template_message_still_names_the_blocking_section() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let storage = Storage::new(Arc::new(open(temp_dir.path().join("rules.db"))?))?;
    let templates: Arc<dyn TemplateProvider> = Arc::new(
        StaticTemplates::new()
            .with_template(
                TEMPLATE,
                vec![TemplateSection::leaf("A"), TemplateSection::leaf("B")],
            )
            .with_rule(
                TEMPLATE,
                "B",
                SectionRule::dependency("A", "approved").with_message("Dispensing needs QA sign-off"),
            ),
    );
    StatusAggregator::new(storage.clone(), templates.clone())
        .register_batch("B1", TEMPLATE, &Actor::new("U1"))?;

    let check = DependencyEvaluator::new(storage, templates).check("B", "B1")?;
    let DependencyCheck::Unmet { source_section_id, message } = check else {
        panic!("dependency should be unmet");
    };
    assert_eq!(source_section_id, "A");
    assert!(message.starts_with("Dispensing needs QA sign-off"));
    assert!(message.contains("'A'"));
    assert!(message.contains("not started"));
    Ok(())
}

// BATCHES

#[test]
fn batch_registration_is_validated() -> anyhow::Result<()> {
    let fx = fixture()?;
    let actor = Actor::new("U1");

    let err = fx.status.register_batch("B1", TEMPLATE, &actor).unwrap_err();
    assert!(matches!(err, RecordError::Validation(_)));

    let err = fx.status.register_batch("B9", "tmpl_missing", &actor).unwrap_err();
    assert!(matches!(err, RecordError::Validation(_)));

    let err = fx.store.initialize("B9", &actor).unwrap_err();
    assert!(matches!(err, RecordError::NotFound { .. }));
    Ok(())
}

#[test]
fn recompute_reports_batch_progress() -> anyhow::Result<()> {
    let fx = fixture()?;
    let actor = Actor::new("U1");
    for section in ["A", "B", "S1"] {
        fx.store
            .write("B1", section, Document(json!({"ok": 1})), &actor, None, SectionStatus::Completed)?;
    }

    let batch = fx.status.recompute("B1", &actor)?;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert!(batch.completed_at.is_some());
    Ok(())
}

// APPROVALS

fn section_approval(section_id: &str) -> NewApprovalRequest {
    NewApprovalRequest {
        batch_record_id: "B1".into(),
        section_id: section_id.into(),
        parent_section_id: None,
        request_type: RequestType::SectionApproval,
        reason: "ready for QA".into(),
        existing_data: None,
        proposed_data: None,
    }
}

#[test]
fn section_approval_promotes_the_version_in_place() -> anyhow::Result<()> {
    let fx = fixture()?;
    let approvals = ApprovalWorkflow::new(fx.storage.clone(), fx.store.clone());
    let operator = Actor::new("U1");
    let path = SectionPath::new("B1", "S1", None);

    let completed = fx.store.write(
        "B1",
        "S1",
        Document(json!({"yield": 98.4})),
        &operator,
        None,
        SectionStatus::Completed,
    )?;
    let versions = fx.store.history(&path)?.len();

    let request = approvals.create_request(section_approval("S1"), &operator)?;
    let outcome = approvals.approve(&request.id, &Actor::new("QA1"), Some("ok"))?;

    assert_eq!(outcome.section.id, completed.id);
    assert_eq!(outcome.section.version, completed.version);
    assert_eq!(outcome.section.status, SectionStatus::Approved);
    assert_eq!(outcome.request.resulting_record_id.as_deref(), Some(completed.id.as_str()));

    let active = fx.store.active(&path)?.context("active section")?;
    assert_eq!(active.id, completed.id);
    assert_eq!(active.status, SectionStatus::Approved);
    assert_eq!(active.section_data, completed.section_data);
    assert!(active.pending_request_id.is_none());
    assert_eq!(fx.store.history(&path)?.len(), versions);
    Ok(())
}

#[test]
fn reject_restores_draft_and_releases_the_lock() -> anyhow::Result<()> {
    let fx = fixture()?;
    let approvals = ApprovalWorkflow::new(fx.storage.clone(), fx.store.clone());
    let operator = Actor::new("U1");
    let path = SectionPath::new("B1", "S1", None);

    let draft = fx.store.write(
        "B1",
        "S1",
        Document(json!({"yield": 12.5})),
        &operator,
        None,
        SectionStatus::Draft,
    )?;
    assert!(draft.locked_by.is_none());

    let request = approvals.create_request(section_approval("S1"), &operator)?;
    let under_review = fx.store.active(&path)?.context("active section")?;
    assert_eq!(under_review.status, SectionStatus::PendingApproval);
    assert_eq!(under_review.locked_by.as_deref(), Some("U1"));

    let outcome = approvals.reject(&request.id, &Actor::new("QA1"), None)?;
    assert_eq!(outcome.request.status_before_request, SectionStatus::Draft);

    let restored = fx.store.active(&path)?.context("active section")?;
    assert_eq!(restored.id, draft.id);
    assert_eq!(restored.status, SectionStatus::Draft);
    assert!(restored.locked_by.is_none());
    assert!(restored.locked_at.is_none());
    assert!(restored.completed_by.is_none());
    assert!(restored.pending_request_id.is_none());
    assert_eq!(restored.section_data, draft.section_data);
    Ok(())
}

#[test]
fn reject_restores_approved_status() -> anyhow::Result<()> {
    let fx = fixture()?;
    let approvals = ApprovalWorkflow::new(fx.storage.clone(), fx.store.clone());
    let operator = Actor::new("U1");
    let reviewer = Actor::new("QA1");
    let path = SectionPath::new("B1", "S1", None);

    fx.store.write(
        "B1",
        "S1",
        Document(json!({"yield": 99.0})),
        &operator,
        None,
        SectionStatus::Completed,
    )?;
    let first = approvals.create_request(section_approval("S1"), &operator)?;
    let approved = approvals.approve(&first.id, &reviewer, None)?.section;
    assert_eq!(approved.status, SectionStatus::Approved);

    let correction = NewApprovalRequest {
        request_type: RequestType::parse("DATA_CORRECTION")?,
        proposed_data: Some(Document(json!({"yield": 97.0}))),
        ..section_approval("S1")
    };
    let second = approvals.create_request(correction, &operator)?;
    let outcome = approvals.reject(&second.id, &reviewer, Some("keep as is"))?;

    assert_eq!(outcome.request.status_before_request, SectionStatus::Approved);
    let restored = fx.store.active(&path)?.context("active section")?;
    assert_eq!(restored.id, approved.id);
    assert_eq!(restored.version, approved.version);
    assert_eq!(restored.status, SectionStatus::Approved);
    assert_eq!(restored.locked_by, approved.locked_by);
    assert_eq!(restored.section_data, approved.section_data);
    assert_eq!(fx.store.history(&path)?.len(), 1);
    Ok(())
}

// AUDIT

#[test]
fn audit_entries_keep_actor_metadata() -> anyhow::Result<()> {
    let fx = fixture()?;
    let trail = AuditTrail::new(fx.storage.clone());
    let actor = Actor::new("U7")
        .with_ip("10.1.2.3")
        .with_user_agent("scale-gateway/2");

    let entry = trail.append(
        AuditLogEntry::new("EXPORT_BATCH_RECORD", "BatchRecord", "B1", &actor)
            .values(None, Some(Document(json!({"format": "pdf"}))))
            .batch("B1"),
    )?;
    assert!(entry.id.starts_with("aud1"));

    let entries = trail.entries_for_batch("B1")?;
    let last = entries.last().context("audit entry")?;
    assert_eq!(last.id, entry.id);
    assert_eq!(last.ip.as_deref(), Some("10.1.2.3"));
    assert_eq!(last.user_agent.as_deref(), Some("scale-gateway/2"));

    // registration was audited first
    assert_eq!(entries[0].action, "REGISTER_BATCH");
    assert!(trail.entries_for_batch("B2")?.is_empty());
    Ok(())
}

// SIGNATURES

fn signed(fx: &Fixture, user_id: &str) -> anyhow::Result<(SignatureService, String)> {
    let signatures = SignatureService::new(fx.storage.clone());
    let signature = signatures.create(SignatureRequest {
        user_id: user_id.into(),
        entity_type: "BatchRecordSection".into(),
        entity_id: "S1".into(),
        payload: json!({"action": "COMPLETE_SECTION", "sectionId": "S1", "batchRecordId": "B1"}),
        batch_record_id: Some("B1".into()),
        ..SignatureRequest::default()
    })?;
    Ok((signatures, signature.id))
}

#[test]
fn signature_verification_outcomes() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (signatures, id) = signed(&fx, "U1")?;
    // same payload, different key order
    let payload = json!({"batchRecordId": "B1", "sectionId": "S1", "action": "COMPLETE_SECTION"});
    let max_age = Some(Duration::from_secs(300));

    assert_eq!(signatures.verify(&id, "U1", &payload, max_age)?, Verification::Valid);
    assert_eq!(signatures.verify(&id, "U1", &payload, max_age)?, Verification::Valid);
    assert_eq!(
        signatures.verify(&id, "U2", &payload, max_age)?.reason(),
        Some(SignatureFailure::UserMismatch)
    );

    let tampered = json!({"batchRecordId": "B1", "sectionId": "S2", "action": "COMPLETE_SECTION"});
    assert_eq!(
        signatures.verify(&id, "U1", &tampered, max_age)?.reason(),
        Some(SignatureFailure::HashMismatch)
    );

    let created_at = signatures.get(&id)?.context("signature")?.created_at;
    let later = created_at.plus_seconds(301);
    assert_eq!(
        signatures.verify_at(&id, "U1", &payload, max_age, &later)?.reason(),
        Some(SignatureFailure::Expired)
    );
    // age is only checked when a limit is supplied
    assert!(signatures.verify_at(&id, "U1", &payload, None, &later)?.is_ok());

    assert_eq!(
        signatures.verify("sig1nothing", "U1", &payload, None)?.reason(),
        Some(SignatureFailure::NotFound)
    );
    Ok(())
}

#[test]
fn signatures_are_consumed_once() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (signatures, id) = signed(&fx, "U1")?;
    let payload = json!({"action": "COMPLETE_SECTION", "sectionId": "S1", "batchRecordId": "B1"});

    signatures.consume(&id, "U1", &payload, None, "COMPLETE_SECTION")?;
    let consumption = signatures.consumption(&id)?.context("consumption")?;
    assert_eq!(consumption.action, "COMPLETE_SECTION");

    let err = signatures
        .consume(&id, "U1", &payload, None, "COMPLETE_SECTION")
        .unwrap_err();
    assert!(matches!(
        err,
        RecordError::SignatureInvalid(SignatureFailure::AlreadyConsumed)
    ));

    // verification stays read-only
    assert!(signatures.verify(&id, "U1", &payload, None)?.is_ok());
    Ok(())
}
