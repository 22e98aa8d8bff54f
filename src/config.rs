//! Runtime configuration
use super::error::RecordError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SIGNATURE_MAX_AGE_SECONDS: u64 = 300;
pub const DEFAULT_DB_PATH: &str = "batch_records.db";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Oldest signature accepted for a protected action.
    pub signature_max_age_seconds: u64,
    /// Spend a signature on the action it authorizes.
    pub single_use_signatures: bool,
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signature_max_age_seconds: DEFAULT_SIGNATURE_MAX_AGE_SECONDS,
            single_use_signatures: true,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, RecordError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `SIGNATURE_MAX_AGE_SECONDS`, `SINGLE_USE_SIGNATURES`
    /// and `BATCH_RECORD_DB_PATH`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RecordError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SIGNATURE_MAX_AGE_SECONDS") {
            config.signature_max_age_seconds = raw.trim().parse().map_err(|_| {
                RecordError::validation(format!(
                    "SIGNATURE_MAX_AGE_SECONDS must be a whole number of seconds, got '{raw}'"
                ))
            })?;
        }
        if let Some(raw) = lookup("SINGLE_USE_SIGNATURES") {
            config.single_use_signatures = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(RecordError::validation(format!(
                        "SINGLE_USE_SIGNATURES must be true or false, got '{raw}'"
                    )));
                }
            };
        }
        if let Some(raw) = lookup("BATCH_RECORD_DB_PATH") {
            config.db_path = PathBuf::from(raw);
        }

        Ok(config)
    }

    pub fn signature_max_age(&self) -> Duration {
        Duration::from_secs(self.signature_max_age_seconds)
    }
}
