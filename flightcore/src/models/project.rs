//! Project model — filesystem layout for a single orchestrated project.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FlightResult;

/// Relative path of the canonical product spec inside a project
pub const SPEC_POINTER: &str = "docs/product-spec.md";

/// Turn a free-form name into a filesystem-safe slug
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// A project under orchestration: a name, a slug, and a root directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Display name
    pub name: String,
    /// Filesystem-safe identifier
    pub slug: String,
    /// Project root (the agent's working directory)
    pub root: PathBuf,
}

impl Project {
    /// Create a project rooted at `root`, deriving the slug from `name`
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Self {
        let name = name.into();
        Self {
            slug: slugify(&name),
            name,
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Project root path
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Sessions directory (`sessions/`)
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Execution-log directory (`sessions/fly/`)
    pub fn fly_sessions_dir(&self) -> PathBuf {
        self.sessions_dir().join("fly")
    }

    /// Receipts directory (`receipts/`)
    pub fn receipts_dir(&self) -> PathBuf {
        self.root.join("receipts")
    }

    /// Waypoint memory directory (`.waypoints/memory/`)
    pub fn memory_dir(&self) -> PathBuf {
        self.root.join(".waypoints").join("memory")
    }

    /// Flight-plan file path
    pub fn flight_plan_path(&self) -> PathBuf {
        self.root.join("flight-plan.jsonl")
    }

    /// Waypoint-history journal path
    pub fn waypoint_history_path(&self) -> PathBuf {
        self.root.join("waypoint-history.jsonl")
    }

    /// Canonical product-spec path
    pub fn spec_path(&self) -> PathBuf {
        self.root.join(SPEC_POINTER)
    }

    /// Create the directories the core writes into
    pub fn ensure_dirs(&self) -> FlightResult<()> {
        std::fs::create_dir_all(self.fly_sessions_dir())?;
        std::fs::create_dir_all(self.receipts_dir())?;
        std::fs::create_dir_all(self.memory_dir())?;
        if let Some(parent) = self.spec_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Load the product spec, empty string if absent
    pub fn load_product_spec(&self) -> String {
        std::fs::read_to_string(self.spec_path()).unwrap_or_default()
    }
}
