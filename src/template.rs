//! Template collaborator: section structure and cross-section rules
use super::error::RecordError;
use super::types::SectionStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SECTION_DEPENDENCY: &str = "SECTION_DEPENDENCY";
/// Deepest nesting a template may declare.
pub const MAX_TREE_DEPTH: usize = 8;

/// Template definitions are owned elsewhere; this crate only reads them.
pub trait TemplateProvider: Send + Sync {
    fn section_rules(&self, template_id: &str, section_id: &str)
    -> anyhow::Result<Vec<SectionRule>>;
    fn section_tree(&self, template_id: &str) -> anyhow::Result<Vec<TemplateSection>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionRule {
    pub rule_type: String,
    pub rule_data: RuleData,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleData {
    #[serde(default)]
    pub source_section_id: Option<String>,
    // older templates name the source `dependsOn`
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SectionRule {
    pub fn dependency(source_section_id: &str, condition: &str) -> Self {
        Self {
            rule_type: SECTION_DEPENDENCY.into(),
            rule_data: RuleData {
                source_section_id: Some(source_section_id.into()),
                condition: Some(condition.into()),
                ..RuleData::default()
            },
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.rule_data.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Completed,
    Approved,
    Status(SectionStatus),
}

impl Condition {
    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        match raw.trim() {
            "completed" => Ok(Condition::Completed),
            "approved" => Ok(Condition::Approved),
            literal => literal.parse().map(Condition::Status).map_err(|_| {
                RecordError::validation(format!("unknown dependency condition '{literal}'"))
            }),
        }
    }

    pub fn is_satisfied_by(&self, status: SectionStatus) -> bool {
        match self {
            Condition::Completed => status.is_completed_equivalent(),
            Condition::Approved => status.is_approved_equivalent(),
            Condition::Status(required) => *required == status,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Condition::Completed => "completed",
            Condition::Approved => "approved",
            Condition::Status(status) => status.as_str(),
        }
    }
}

/// A parsed `SECTION_DEPENDENCY` rule.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyRule {
    pub source_section_id: String,
    pub condition: Condition,
    pub message: Option<String>,
}

impl DependencyRule {
    /// `Ok(None)` for rules of any other type.
    pub fn from_rule(rule: &SectionRule) -> Result<Option<Self>, RecordError> {
        if rule.rule_type != SECTION_DEPENDENCY {
            return Ok(None);
        }
        let data = &rule.rule_data;
        let source = data
            .source_section_id
            .as_ref()
            .or(data.depends_on.as_ref())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                RecordError::validation("SECTION_DEPENDENCY rule is missing its source section")
            })?;
        let condition = Condition::parse(data.condition.as_deref().unwrap_or("completed"))?;

        Ok(Some(Self {
            source_section_id: source.clone(),
            condition,
            message: data.message.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSection {
    pub id: String,
    #[serde(default)]
    pub subsections: Vec<TemplateSection>,
}

impl TemplateSection {
    pub fn leaf(id: &str) -> Self {
        Self {
            id: id.into(),
            subsections: vec![],
        }
    }

    pub fn with_children(id: &str, children: Vec<TemplateSection>) -> Self {
        Self {
            id: id.into(),
            subsections: children,
        }
    }
}

#[derive(Debug)]
struct TreeNode {
    id: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Flattened, validated section tree. Nodes live in an arena and refer to
/// their parent by index, so the structure is acyclic by construction.
#[derive(Debug, Default)]
pub struct SectionTree {
    nodes: Vec<TreeNode>,
    index: HashMap<String, usize>,
}

impl SectionTree {
    pub fn build(roots: &[TemplateSection]) -> Result<Self, RecordError> {
        let mut tree = SectionTree::default();
        for root in roots {
            tree.insert(root, None, 1)?;
        }
        Ok(tree)
    }

    fn insert(
        &mut self,
        section: &TemplateSection,
        parent: Option<usize>,
        depth: usize,
    ) -> Result<(), RecordError> {
        if depth > MAX_TREE_DEPTH {
            return Err(RecordError::validation(format!(
                "template nests section '{}' deeper than {MAX_TREE_DEPTH} levels",
                section.id
            )));
        }
        if section.id.is_empty() {
            return Err(RecordError::validation("template section with empty id"));
        }
        if self.index.contains_key(&section.id) {
            return Err(RecordError::validation(format!(
                "template declares section '{}' more than once",
                section.id
            )));
        }

        let slot = self.nodes.len();
        self.nodes.push(TreeNode {
            id: section.id.clone(),
            parent,
            children: vec![],
        });
        self.index.insert(section.id.clone(), slot);
        if let Some(parent) = parent {
            self.nodes[parent].children.push(slot);
        }

        for child in &section.subsections {
            self.insert(child, Some(slot), depth + 1)?;
        }
        Ok(())
    }

    pub fn contains(&self, section_id: &str) -> bool {
        self.index.contains_key(section_id)
    }

    /// `None` when the section is unknown, `Some(None)` for a top-level section.
    pub fn parent_of(&self, section_id: &str) -> Option<Option<&str>> {
        let slot = *self.index.get(section_id)?;
        Some(self.nodes[slot].parent.map(|p| self.nodes[p].id.as_str()))
    }

    pub fn children_of(&self, section_id: &str) -> Vec<&str> {
        match self.index.get(section_id) {
            Some(slot) => self.nodes[*slot]
                .children
                .iter()
                .map(|c| self.nodes[*c].id.as_str())
                .collect(),
            None => vec![],
        }
    }

    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.parent.is_none())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Every `(section, parent)` pair, parents before their children.
    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.nodes.iter().map(|n| {
            (
                n.id.as_str(),
                n.parent.map(|p| self.nodes[p].id.as_str()),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Default)]
struct StaticTemplate {
    sections: Vec<TemplateSection>,
    rules: HashMap<String, Vec<SectionRule>>,
}

/// In-memory [`TemplateProvider`] for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticTemplates {
    templates: HashMap<String, StaticTemplate>,
}

impl StaticTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template_id: &str, sections: Vec<TemplateSection>) -> Self {
        self.templates.entry(template_id.into()).or_default().sections = sections;
        self
    }

    pub fn with_rule(mut self, template_id: &str, section_id: &str, rule: SectionRule) -> Self {
        self.templates
            .entry(template_id.into())
            .or_default()
            .rules
            .entry(section_id.into())
            .or_default()
            .push(rule);
        self
    }

    fn template(&self, template_id: &str) -> anyhow::Result<&StaticTemplate> {
        self.templates
            .get(template_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown template '{}'", template_id))
    }
}

impl TemplateProvider for StaticTemplates {
    fn section_rules(
        &self,
        template_id: &str,
        section_id: &str,
    ) -> anyhow::Result<Vec<SectionRule>> {
        let template = self.template(template_id)?;
        Ok(template.rules.get(section_id).cloned().unwrap_or_default())
    }

    fn section_tree(&self, template_id: &str) -> anyhow::Result<Vec<TemplateSection>> {
        Ok(self.template(template_id)?.sections.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<TemplateSection> {
        vec![
            TemplateSection::leaf("dispensing"),
            TemplateSection::with_children(
                "granulation",
                vec![
                    TemplateSection::leaf("mixing"),
                    TemplateSection::leaf("drying"),
                ],
            ),
        ]
    }

    #[test]
    fn tree_resolves_parents_and_children() {
        let tree = SectionTree::build(&sample()).unwrap();

        assert_eq!(tree.roots(), vec!["dispensing", "granulation"]);
        assert_eq!(tree.children_of("granulation"), vec!["mixing", "drying"]);
        assert_eq!(tree.parent_of("drying"), Some(Some("granulation")));
        assert_eq!(tree.parent_of("dispensing"), Some(None));
        assert_eq!(tree.parent_of("coating"), None);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let sections = vec![
            TemplateSection::with_children("a", vec![TemplateSection::leaf("b")]),
            TemplateSection::leaf("b"),
        ];
        assert!(SectionTree::build(&sections).is_err());
    }

    #[test]
    fn depth_is_bounded() {
        let mut section = TemplateSection::leaf("s9");
        for i in (0..9).rev() {
            section = TemplateSection::with_children(&format!("s{i}"), vec![section]);
        }
        let err = SectionTree::build(&[section]).unwrap_err();
        assert!(err.to_string().contains("deeper than"));
    }

    #[test]
    fn conditions() {
        let completed = Condition::parse("completed").unwrap();
        assert!(completed.is_satisfied_by(SectionStatus::PendingApproval));
        assert!(!completed.is_satisfied_by(SectionStatus::Draft));

        let approved = Condition::parse("approved").unwrap();
        assert!(approved.is_satisfied_by(SectionStatus::ApprovedForChange));
        assert!(!approved.is_satisfied_by(SectionStatus::Completed));

        let literal = Condition::parse("COMPLETED").unwrap();
        assert!(literal.is_satisfied_by(SectionStatus::Completed));
        assert!(!literal.is_satisfied_by(SectionStatus::Approved));

        assert!(Condition::parse("finished").is_err());
    }

    #[test]
    fn dependency_rules_accept_legacy_source_field() {
        let rule = SectionRule {
            rule_type: SECTION_DEPENDENCY.into(),
            rule_data: RuleData {
                depends_on: Some("A".into()),
                ..RuleData::default()
            },
        };
        let parsed = DependencyRule::from_rule(&rule).unwrap().unwrap();
        assert_eq!(parsed.source_section_id, "A");
        assert_eq!(parsed.condition, Condition::Completed);

        let other = SectionRule {
            rule_type: "FIELD_RANGE".into(),
            rule_data: RuleData::default(),
        };
        assert!(DependencyRule::from_rule(&other).unwrap().is_none());
    }

    #[test]
    fn rules_deserialize_from_template_json() {
        let raw = r#"{"ruleType":"SECTION_DEPENDENCY","ruleData":{"sourceSectionId":"A","condition":"approved","message":"A first"}}"#;
        let rule: SectionRule = serde_json::from_str(raw).unwrap();
        let parsed = DependencyRule::from_rule(&rule).unwrap().unwrap();
        assert_eq!(parsed.condition, Condition::Approved);
        assert_eq!(parsed.message.as_deref(), Some("A first"));
    }
}
