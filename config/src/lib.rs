//! `~/.annotator/config.toml`.
//!
//! ```toml
//! [agent]
//! url = "http://localhost:8080"
//! timeout_secs = 120
//!
//! [context]
//! budget = 98304
//! emergency_ratio = 0.90
//!
//! [run]
//! annotator_db = "annotator.db"
//! checkpoint_interval = 10
//! ```
//!
//! Every field is optional; a missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::Invalid { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnnotatorConfig {
    pub agent: AgentConfig,
    pub context: ContextConfig,
    pub run: RunConfig,
}

/// The OpenAI-compatible agent server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Supports `${ENV_VAR}` expansion.
    pub url: String,
    pub timeout_secs: u64,
    /// Total attempts for 5xx and timeouts.
    pub max_retries: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            timeout_secs: 120,
            max_retries: 3,
            temperature: 0.4,
            max_tokens: 1024,
            model: None,
        }
    }
}

/// Token budget and compaction thresholds, as fractions of `budget`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub budget: u64,
    pub soft_ratio: f64,
    pub thread_compact_ratio: f64,
    pub emergency_ratio: f64,
    pub target_ratio: f64,
    pub scenes_per_chunk: u32,
    pub preserve_recent_chunks: u32,
    pub chars_per_token: f64,
    pub summary_max_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget: 98_304,
            soft_ratio: 0.60,
            thread_compact_ratio: 0.80,
            emergency_ratio: 0.90,
            target_ratio: 0.70,
            scenes_per_chunk: 7,
            preserve_recent_chunks: 2,
            chars_per_token: 4.0,
            summary_max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub annotator_db: PathBuf,
    /// Scenes between checkpoints.
    pub checkpoint_interval: u32,
    pub log_file: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            annotator_db: PathBuf::from("annotator.db"),
            checkpoint_interval: 10,
            log_file: None,
        }
    }
}

/// Replace `${VAR}` with the variable's value (empty when unset).
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if var.is_empty() {
            out.push_str("${}");
        } else {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".annotator").join("config.toml"))
}

impl AnnotatorConfig {
    /// Load from `path`, or from [`config_path`] when `None`. A missing
    /// default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read { path, source: err });
            }
        };
        let mut config = Self::parse(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.clone(),
                source: err,
            }
        })?;
        config.agent.url = expand_env_vars(&config.agent.url);
        config.agent.model = config.agent.model.as_deref().map(expand_env_vars);
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Ratios in (0, 1] and `soft <= target <= thread_compact <= emergency`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ctx = &self.context;
        let ratios = [
            ("context.soft_ratio", ctx.soft_ratio),
            ("context.target_ratio", ctx.target_ratio),
            ("context.thread_compact_ratio", ctx.thread_compact_ratio),
            ("context.emergency_ratio", ctx.emergency_ratio),
        ];
        for (field, value) in ratios {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is outside (0, 1]"),
                });
            }
        }
        for pair in ratios.windows(2) {
            let ((lower_field, lower), (field, value)) = (pair[0], pair[1]);
            if value < lower {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is below {lower_field} ({lower})"),
                });
            }
        }
        if ctx.budget == 0 {
            return Err(ConfigError::Invalid {
                field: "context.budget",
                reason: "must be positive".to_string(),
            });
        }
        if ctx.scenes_per_chunk == 0 {
            return Err(ConfigError::Invalid {
                field: "context.scenes_per_chunk",
                reason: "must be positive".to_string(),
            });
        }
        if ctx.chars_per_token <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "context.chars_per_token",
                reason: format!("{} is not positive", ctx.chars_per_token),
            });
        }
        if self.run.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "run.checkpoint_interval",
                reason: "must be positive".to_string(),
            });
        }
        if self.agent.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "agent.max_retries",
                reason: "must allow at least one attempt".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{AnnotatorConfig, ConfigError, expand_env_vars};

    #[test]
    fn parse_empty_config() {
        let config = AnnotatorConfig::parse("").unwrap();
        assert_eq!(config, AnnotatorConfig::default());
        assert_eq!(config.context.budget, 98_304);
        assert!((config.context.emergency_ratio - 0.90).abs() < f64::EPSILON);
        assert_eq!(config.run.checkpoint_interval, 10);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections() {
        let config = AnnotatorConfig::parse(
            r#"
[agent]
url = "http://gpu-box:9000"
model = "local-70b"

[context]
budget = 32768
emergency_ratio = 0.85

[run]
log_file = "logs/run.log"
"#,
        )
        .unwrap();
        assert_eq!(config.agent.url, "http://gpu-box:9000");
        assert_eq!(config.agent.model.as_deref(), Some("local-70b"));
        assert_eq!(config.agent.timeout_secs, 120);
        assert_eq!(config.context.budget, 32768);
        assert!((config.context.emergency_ratio - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.context.scenes_per_chunk, 7);
        assert_eq!(config.run.log_file.as_deref(), Some(Path::new("logs/run.log")));
    }

    #[test]
    fn validate_rejects_out_of_range_ratio() {
        let mut config = AnnotatorConfig::default();
        config.context.emergency_ratio = 1.2;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "context.emergency_ratio",
                ..
            }
        ));

        config.context.emergency_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_misordered_ratios() {
        let mut config = AnnotatorConfig::default();
        config.context.target_ratio = 0.50;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "context.target_ratio",
                ..
            }
        ));
    }

    #[test]
    fn load_missing_explicit_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let err = AnnotatorConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn load_reports_parse_error_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[context\nbudget = ").unwrap();
        let err = AnnotatorConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_validates_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[context]\nsoft_ratio = 0.95\n").unwrap();
        assert!(matches!(
            AnnotatorConfig::load(Some(&path)),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("http://localhost:8080"), "http://localhost:8080");
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        assert_eq!(
            expand_env_vars("http://${ANNOTATOR_TEST_SURELY_UNSET_VAR}:8080"),
            "http://:8080"
        );
    }

    #[test]
    fn expand_env_vars_path_var() {
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(expand_env_vars("${PATH}!"), format!("{path}!"));
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("http://${HOST"), "http://${HOST");
    }

    #[test]
    fn expand_env_vars_empty_var_name_preserved() {
        assert_eq!(expand_env_vars("a${}b"), "a${}b");
    }
}
