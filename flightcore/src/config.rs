//! Configuration for the FLY phase.
//!
//! A `fly.toml` in the project root provides defaults; `FLY_*` environment
//! variables override it, so CI runs can tighten budgets without touching
//! the file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlightError, FlightResult};
use crate::evidence::ValidationCategory;

/// Default iteration budget per waypoint
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Waypoint checklist: free-text items plus per-category command overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checklist {
    /// Checklist items shown to the agent
    #[serde(default)]
    pub items: Vec<String>,

    /// Per-category validation command overrides
    #[serde(default)]
    pub validation_overrides: BTreeMap<ValidationCategory, String>,
}

impl Checklist {
    /// Checklist with items only
    pub fn with_items(items: Vec<String>) -> Self {
        Self {
            items,
            validation_overrides: BTreeMap::new(),
        }
    }
}

/// Git behavior during the FLY phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Prefix for waypoint commit messages
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,

    /// Prefix for waypoint tags
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Tag each committed waypoint for rollback targets
    #[serde(default = "default_true")]
    pub auto_tag: bool,
}

fn default_commit_prefix() -> String {
    "[fly]".to_string()
}

fn default_tag_prefix() -> String {
    "wp-".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_prefix: default_commit_prefix(),
            tag_prefix: default_tag_prefix(),
            auto_tag: true,
        }
    }
}

/// Top-level FLY configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlyConfig {
    /// Iteration budget per waypoint
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Run validation commands on the host during finalize
    #[serde(default = "default_true")]
    pub host_validations: bool,

    /// Hard spend ceiling in USD (None = unlimited)
    #[serde(default)]
    pub budget_usd: Option<f64>,

    /// Agent CLI the provider adapter spawns
    #[serde(default = "default_provider_command")]
    pub provider_command: String,

    /// Default checklist applied to every waypoint
    #[serde(default)]
    pub checklist: Checklist,

    /// Git behavior
    #[serde(default)]
    pub git: GitConfig,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_provider_command() -> String {
    "claude".to_string()
}

impl Default for FlyConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            host_validations: true,
            budget_usd: None,
            provider_command: default_provider_command(),
            checklist: Checklist::default(),
            git: GitConfig::default(),
        }
    }
}

impl FlyConfig {
    /// Load `fly.toml` from the project root, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(project_root: &Path) -> FlightResult<Self> {
        let path = project_root.join("fly.toml");
        let mut config = if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            toml::from_str(&text).map_err(|e| FlightError::config(e.to_string()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `FLY_*` environment variable overrides
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u32>("FLY_MAX_ITERATIONS") {
            if v > 0 {
                self.max_iterations = v;
            }
        }
        if let Ok(v) = std::env::var("FLY_HOST_VALIDATIONS") {
            self.host_validations = !matches!(v.as_str(), "0" | "false" | "no");
        }
        if let Some(v) = env_parse::<f64>("FLY_BUDGET_USD") {
            self.budget_usd = Some(v);
        }
        if let Ok(v) = std::env::var("FLY_PROVIDER_CMD") {
            if !v.is_empty() {
                self.provider_command = v;
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
