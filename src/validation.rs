//! Domain checks run on section data before it is written
use super::error::RecordError;
use super::types::Document;
use serde_json::Value;

pub trait SectionValidator: Send + Sync {
    /// `Err` carries a human-readable reason.
    fn validate(&self, section_id: &str, data: &Document) -> Result<(), String>;
}

/// Runs every validator in order, stopping at the first failure.
pub fn run_all(
    validators: &[Box<dyn SectionValidator>],
    section_id: &str,
    data: &Document,
) -> Result<(), RecordError> {
    for validator in validators {
        validator
            .validate(section_id, data)
            .map_err(RecordError::Validation)?;
    }
    Ok(())
}

/// Material composition must add up to 100%.
///
/// Applies to sections whose data carries a `materials` array of objects with
/// a numeric `percentage`. Entries without a percentage are ignored.
#[derive(Debug, Clone, Copy)]
pub struct MaterialBalance {
    pub tolerance: f64,
}

impl Default for MaterialBalance {
    fn default() -> Self {
        Self { tolerance: 0.01 }
    }
}

impl SectionValidator for MaterialBalance {
    fn validate(&self, section_id: &str, data: &Document) -> Result<(), String> {
        let Some(Value::Array(materials)) = data.as_value().get("materials") else {
            return Ok(());
        };

        let mut total = 0.0;
        let mut seen = 0;
        for (index, material) in materials.iter().enumerate() {
            let Some(percentage) = material.get("percentage") else {
                continue;
            };
            let Some(percentage) = percentage.as_f64() else {
                return Err(format!(
                    "Section '{section_id}': material {index} has a non-numeric percentage"
                ));
            };
            if !(0.0..=100.0).contains(&percentage) {
                return Err(format!(
                    "Section '{section_id}': material {index} percentage {percentage} is outside 0-100"
                ));
            }
            total += percentage;
            seen += 1;
        }

        if seen > 0 && (total - 100.0).abs() > self.tolerance {
            return Err(format!(
                "Section '{section_id}': material percentages sum to {total:.2}, expected 100"
            ));
        }
        Ok(())
    }
}
