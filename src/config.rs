//! Layered runtime configuration.
//!
//! Defaults, then an optional TOML file, then `WEAVE_*` environment
//! overrides (double-underscore path separator, e.g.
//! `WEAVE__PIPELINE__QUALITY_THRESHOLD=85`). Loaded once at process start and
//! passed by reference; nothing here is global.

use crate::backend::BackendConfig;
use crate::error::PipelineError;
use crate::logging::LoggingConfig;
use crate::recovery::RetryPolicy;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs for the pipeline engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bounded worker pool size for the AI Generation phase.
    #[serde(default = "default_max_concurrent_sections")]
    pub max_concurrent_sections: usize,

    /// Refinement iterations allowed per section beyond the initial candidate.
    #[serde(default = "default_max_refinement_iterations")]
    pub max_refinement_iterations: usize,

    /// Quality gate a section must meet (0-100).
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Minimum score movement over two iterations before the loop is
    /// considered plateaued.
    #[serde(default = "default_plateau_epsilon")]
    pub plateau_epsilon: f64,

    /// Retry behavior for transient backend failures.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Content types the assembled module declares.
    #[serde(default = "default_content_types")]
    pub content_types: Vec<String>,

    /// Label stamped on the assembled module.
    #[serde(default = "default_module_label")]
    pub module_label: String,
}

fn default_max_concurrent_sections() -> usize {
    4
}

fn default_max_refinement_iterations() -> usize {
    3
}

fn default_quality_threshold() -> f64 {
    80.0
}

fn default_plateau_epsilon() -> f64 {
    0.75
}

fn default_content_types() -> Vec<String> {
    vec!["LANDING_PAGE".to_string()]
}

fn default_module_label() -> String {
    "Generated Module".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sections: default_max_concurrent_sections(),
            max_refinement_iterations: default_max_refinement_iterations(),
            quality_threshold: default_quality_threshold(),
            plateau_epsilon: default_plateau_epsilon(),
            retry: RetryPolicy::default(),
            content_types: default_content_types(),
            module_label: default_module_label(),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeaveConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WeaveConfig {
    /// Load configuration: defaults <- optional file <- environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = Config::builder().add_source(Config::try_from(&WeaveConfig::default())?);

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("WEAVE")
                .prefix_separator("__")
                .separator("__"),
        );

        let loaded: WeaveConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let pipeline = &self.pipeline;
        if pipeline.max_concurrent_sections == 0 {
            return Err(PipelineError::Config(
                "pipeline.max_concurrent_sections must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&pipeline.quality_threshold) {
            return Err(PipelineError::Config(format!(
                "pipeline.quality_threshold must be within 0-100, got {}",
                pipeline.quality_threshold
            )));
        }
        if pipeline.plateau_epsilon < 0.0 {
            return Err(PipelineError::Config(
                "pipeline.plateau_epsilon must not be negative".to_string(),
            ));
        }
        if pipeline.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "pipeline.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if pipeline.retry.backoff_multiplier < 1.0 {
            return Err(PipelineError::Config(
                "pipeline.retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.backend.endpoint.trim().is_empty() {
            return Err(PipelineError::Config(
                "backend.endpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = WeaveConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.max_concurrent_sections, 4);
        assert_eq!(config.pipeline.quality_threshold, 80.0);
        assert_eq!(config.pipeline.retry.max_attempts, 3);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[pipeline]\nquality_threshold = 92.5\nmax_concurrent_sections = 2\n\
             \n[backend]\nmodel = \"custom-model\"\n"
        )
        .unwrap();

        let config = WeaveConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.quality_threshold, 92.5);
        assert_eq!(config.pipeline.max_concurrent_sections, 2);
        assert_eq!(config.backend.model, "custom-model");
        // Untouched values keep their defaults.
        assert_eq!(config.pipeline.max_refinement_iterations, 3);
    }

    #[test]
    fn zero_worker_pool_is_rejected() {
        let mut config = WeaveConfig::default();
        config.pipeline.max_concurrent_sections = 0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = WeaveConfig::default();
        config.pipeline.quality_threshold = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sub_unit_backoff_is_rejected() {
        let mut config = WeaveConfig::default();
        config.pipeline.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }
}
