//! Runtime settings for the agents, loadable from TOML.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::utils::chart::ChartStyle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlWorkflowKind {
    Simple,
    #[default]
    Reflection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Sampled values shown in full up to this count, truncated beyond it.
    pub max_values: usize,
    /// Distinct values fetched per column before it is marked as too many.
    pub cardinality_limit: usize,
    pub max_inspected_columns: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_values: 15,
            cardinality_limit: 25,
            max_inspected_columns: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlSettings {
    pub workflow: SqlWorkflowKind,
    pub max_attempts: usize,
    pub max_reflection_attempts: usize,
}

impl Default for SqlSettings {
    fn default() -> Self {
        Self {
            workflow: SqlWorkflowKind::Reflection,
            max_attempts: 3,
            max_reflection_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationSettings {
    pub max_steps: usize,
    pub style: ChartStyle,
}

impl Default for VisualizationSettings {
    fn default() -> Self {
        Self {
            max_steps: 3,
            style: ChartStyle::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiSettings {
    pub max_steps: usize,
    /// Final answers shorter than this that end in `?` are reported as
    /// clarification requests.
    pub clarification_max_len: usize,
}

impl Default for BiSettings {
    fn default() -> Self {
        Self {
            max_steps: 12,
            clarification_max_len: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderSettings {
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl LlmProviderSettings {
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .map_err(|_| Error::Config(format!("environment variable {} is not set", self.api_key_env)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub context: ContextSettings,
    pub sql: SqlSettings,
    pub visualization: VisualizationSettings,
    pub bi: BiSettings,
    pub cache_dir: PathBuf,
    pub llm_providers: BTreeMap<String, LlmProviderSettings>,
    pub default_provider: Option<String>,
    pub context_provider: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            context: ContextSettings::default(),
            sql: SqlSettings::default(),
            visualization: VisualizationSettings::default(),
            bi: BiSettings::default(),
            cache_dir: PathBuf::from("cache/context_cache"),
            llm_providers: BTreeMap::new(),
            default_provider: None,
            context_provider: None,
        }
    }
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Every loop cap must be finite and non-zero.
    pub fn validate(&self) -> Result<()> {
        let caps = [
            ("sql.max_attempts", self.sql.max_attempts),
            ("visualization.max_steps", self.visualization.max_steps),
            ("bi.max_steps", self.bi.max_steps),
            ("context.cardinality_limit", self.context.cardinality_limit),
        ];
        for (name, value) in caps {
            if value == 0 {
                return Err(Error::Config(format!("{} must be at least 1", name)));
            }
        }
        if let Some(default) = &self.default_provider {
            if !self.llm_providers.contains_key(default) {
                return Err(Error::Config(format!(
                    "default_provider '{}' is not among llm_providers",
                    default
                )));
            }
        }
        Ok(())
    }
}
