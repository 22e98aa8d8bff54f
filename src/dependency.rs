//! Cross-section preconditions declared by the template
use super::error::RecordError;
use super::section::SectionPath;
use super::storage::{SectionReader, Storage};
use super::template::{DependencyRule, SectionTree, TemplateProvider};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyCheck {
    Satisfied,
    Unmet {
        source_section_id: String,
        message: String,
    },
}

impl DependencyCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, DependencyCheck::Satisfied)
    }

    pub fn into_result(self, section_id: &str) -> Result<(), RecordError> {
        match self {
            DependencyCheck::Satisfied => Ok(()),
            DependencyCheck::Unmet {
                source_section_id,
                message,
            } => Err(RecordError::DependencyUnmet {
                section_id: section_id.into(),
                source_section_id,
                message,
            }),
        }
    }
}

#[derive(Clone)]
pub struct DependencyEvaluator {
    storage: Storage,
    templates: Arc<dyn TemplateProvider>,
}

impl DependencyEvaluator {
    pub fn new(storage: Storage, templates: Arc<dyn TemplateProvider>) -> Self {
        Self { storage, templates }
    }

    /// `SECTION_DEPENDENCY` rules targeting `section_id`.
    pub fn rules_for(
        &self,
        template_id: &str,
        section_id: &str,
    ) -> Result<Vec<DependencyRule>, RecordError> {
        let rules = self.templates.section_rules(template_id, section_id)?;
        let mut parsed = vec![];
        for rule in &rules {
            if let Some(rule) = DependencyRule::from_rule(rule)? {
                parsed.push(rule);
            }
        }
        Ok(parsed)
    }

    /// Checks the dependencies of `section_id` against the batch's current state.
    pub fn check(&self, section_id: &str, batch_record_id: &str) -> Result<DependencyCheck, RecordError> {
        let batch = self
            .storage
            .batch(batch_record_id)?
            .ok_or_else(|| RecordError::not_found("BatchRecord", batch_record_id))?;
        let tree = SectionTree::build(&self.templates.section_tree(&batch.template_id)?)?;
        let rules = self.rules_for(&batch.template_id, section_id)?;

        Self::evaluate(&self.storage, &tree, batch_record_id, section_id, &rules)
    }

    /// Evaluates `rules` in order; the first unmet rule wins.
    pub fn evaluate<R: SectionReader>(
        reader: &R,
        tree: &SectionTree,
        batch_record_id: &str,
        section_id: &str,
        rules: &[DependencyRule],
    ) -> Result<DependencyCheck, R::Error> {
        for rule in rules {
            let source = &rule.source_section_id;
            let parent = tree.parent_of(source).flatten();
            let path = SectionPath::new(batch_record_id, source, parent);
            let status = reader.active_section(&path)?.map(|record| record.status);

            let satisfied = status.is_some_and(|status| rule.condition.is_satisfied_by(status));
            if satisfied {
                continue;
            }

            let current = status.map_or("not started", |status| status.as_str());
            let detail = format!(
                "Section '{}' must be {} before section '{}' can be changed (currently {})",
                source,
                rule.condition.label(),
                section_id,
                current
            );
            // template wording leads, but the blocking section is always named
            let message = match rule.message.as_deref().map(str::trim) {
                Some(custom) if !custom.is_empty() => format!("{custom}: {detail}"),
                _ => detail,
            };
            tracing::debug!(
                batch_record_id,
                section_id,
                source_section_id = %source,
                current,
                "dependency not satisfied"
            );
            return Ok(DependencyCheck::Unmet {
                source_section_id: source.clone(),
                message,
            });
        }
        Ok(DependencyCheck::Satisfied)
    }
}
