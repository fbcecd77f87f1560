//! Pipeline configuration.
//!
//! Thresholds, timeouts, the retry model rotation and per-model confidence
//! adjustment factors. Loaded from defaults, a JSON file, or `DOCSCHEMA_*`
//! environment variables.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::confidence::DEFAULT_REFERENCE_PAGE_HEIGHT;
use crate::pipeline::retry::{ModelRotation, DEFAULT_LOW_CONFIDENCE_THRESHOLD};

pub const ENV_CONFIG_FILE: &str = "DOCSCHEMA_CONFIG";
pub const ENV_CONFIDENCE_THRESHOLD: &str = "DOCSCHEMA_CONFIDENCE_THRESHOLD";
pub const ENV_INCLUDE_LOW_CONFIDENCE: &str = "DOCSCHEMA_INCLUDE_LOW_CONFIDENCE";
pub const ENV_DEFAULT_MODEL: &str = "DOCSCHEMA_DEFAULT_MODEL";
pub const ENV_PREPARATION_TIMEOUT: &str = "DOCSCHEMA_PREPARATION_TIMEOUT_SECS";
pub const ENV_ANALYSIS_TIMEOUT: &str = "DOCSCHEMA_ANALYSIS_TIMEOUT_SECS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fields below this overall confidence are left out of the schema
    /// unless `include_low_confidence` is set.
    pub confidence_threshold: f64,
    pub include_low_confidence: bool,
    pub default_model: String,
    pub preparation_timeout_secs: u64,
    pub analysis_timeout_secs: u64,
    /// Runs scoring below this are reported as retry candidates.
    pub low_confidence_threshold: f64,
    pub model_rotation: ModelRotation,
    /// Multiplier applied to the aggregated score per model. Missing models
    /// use 1.0.
    pub model_adjustments: BTreeMap<String, f64>,
    /// Page height used by the layout heuristic when the document reports none.
    pub reference_page_height: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut model_adjustments = BTreeMap::new();
        model_adjustments.insert("gpt-4o".to_string(), 1.0);
        model_adjustments.insert("gpt-4o-mini".to_string(), 0.95);
        model_adjustments.insert("gemini-1.5-pro".to_string(), 0.98);

        Self {
            confidence_threshold: 0.6,
            include_low_confidence: false,
            default_model: "gpt-4o".to_string(),
            preparation_timeout_secs: 60,
            analysis_timeout_secs: 300,
            low_confidence_threshold: DEFAULT_LOW_CONFIDENCE_THRESHOLD,
            model_rotation: ModelRotation::new(vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "gemini-1.5-pro".to_string(),
            ]),
            model_adjustments,
            reference_page_height: DEFAULT_REFERENCE_PAGE_HEIGHT,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

impl PipelineConfig {
    pub fn preparation_timeout(&self) -> Duration {
        Duration::from_secs(self.preparation_timeout_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    /// Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// `$DOCSCHEMA_CONFIG` file (if set) overlaid with individual
    /// `DOCSCHEMA_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(ENV_CONFIG_FILE) {
            Some(path) => Self::from_json_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(v) = lookup(ENV_CONFIDENCE_THRESHOLD) {
            config.confidence_threshold = parse(ENV_CONFIDENCE_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_INCLUDE_LOW_CONFIDENCE) {
            config.include_low_confidence = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => return Err(invalid(ENV_INCLUDE_LOW_CONFIDENCE, &v)),
            };
        }
        if let Some(v) = lookup(ENV_DEFAULT_MODEL).filter(|v| !v.trim().is_empty()) {
            config.default_model = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_PREPARATION_TIMEOUT) {
            config.preparation_timeout_secs = parse(ENV_PREPARATION_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_ANALYSIS_TIMEOUT) {
            config.analysis_timeout_secs = parse(ENV_ANALYSIS_TIMEOUT, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("low_confidence_threshold", self.low_confidence_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, &value.to_string()));
            }
        }
        if !(self.reference_page_height.is_finite() && self.reference_page_height > 0.0) {
            return Err(invalid(
                "reference_page_height",
                &self.reference_page_height.to_string(),
            ));
        }
        if let Some((model, factor)) = self
            .model_adjustments
            .iter()
            .find(|(_, f)| !f.is_finite() || **f < 0.0)
        {
            return Err(invalid(&format!("model_adjustments.{model}"), &factor.to_string()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
