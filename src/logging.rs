//! Structured logging setup on the `tracing` stack.
//!
//! Filter resolution order, highest first: `WEAVE_LOG` environment variable,
//! configured level plus per-module directives, defaults.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error, off
    #[serde(default = "default_level")]
    pub level: String,

    /// json or text
    #[serde(default = "default_format")]
    pub format: String,

    /// Colored output (text format only)
    #[serde(default = "default_color")]
    pub color: bool,

    /// Per-module level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            color: default_color(),
            modules: HashMap::new(),
        }
    }
}

/// Install the global subscriber. Call once at process start.
pub fn init_logging(config: &LoggingConfig) -> Result<(), PipelineError> {
    let filter = build_env_filter(config)?;
    let format = resolve_format(config)?;
    let base = Registry::default().with(filter);

    if format == "json" {
        base.with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339()),
        )
        .init();
    } else {
        base.with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(config.color),
        )
        .init();
    }

    Ok(())
}

fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter, PipelineError> {
    if let Ok(filter) = EnvFilter::try_from_env("WEAVE_LOG") {
        return Ok(filter);
    }

    if config.level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(&config.level);
    for (module, level) in &config.modules {
        let directive = format!("{module}={level}");
        filter = filter.add_directive(directive.parse().map_err(|e| {
            PipelineError::Config(format!("invalid log directive '{directive}': {e}"))
        })?);
    }

    if let Ok(modules_str) = std::env::var("WEAVE_LOG_MODULES") {
        for entry in modules_str.split(',') {
            let directive = entry.trim().to_string();
            if directive.is_empty() {
                continue;
            }
            filter = filter.add_directive(directive.parse().map_err(|e| {
                PipelineError::Config(format!("invalid log directive from env '{directive}': {e}"))
            })?);
        }
    }

    Ok(filter)
}

fn resolve_format(config: &LoggingConfig) -> Result<String, PipelineError> {
    let format = std::env::var("WEAVE_LOG_FORMAT").unwrap_or_else(|_| config.format.clone());
    if format != "json" && format != "text" {
        return Err(PipelineError::Config(format!(
            "invalid log format '{format}' (must be 'json' or 'text')"
        )));
    }
    Ok(format)
}
