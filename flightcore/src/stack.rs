//! Technology-stack detection and validation-command resolution.
//!
//! Scans the project root and its visible depth-1 children for language
//! manifests, then maps each detected stack to a canonical command list
//! per category. When no manifests exist yet (fresh project), language
//! keywords in the product spec serve as a fallback.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::evidence::ValidationCategory;

/// Supported technology stacks (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackType {
    Python,
    Typescript,
    Javascript,
    Go,
    Rust,
    Swift,
}

/// Detection order; also the deterministic ordering of resolved commands
const STACK_ORDER: &[StackType] = &[
    StackType::Python,
    StackType::Typescript,
    StackType::Javascript,
    StackType::Go,
    StackType::Rust,
    StackType::Swift,
];

impl std::fmt::Display for StackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Python => write!(f, "Python"),
            Self::Typescript => write!(f, "Typescript"),
            Self::Javascript => write!(f, "Javascript"),
            Self::Go => write!(f, "Go"),
            Self::Rust => write!(f, "Rust"),
            Self::Swift => write!(f, "Swift"),
        }
    }
}

/// One resolved validation command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCommand {
    /// Human label ("linting", "tests", ...)
    pub name: String,
    /// Shell command to run
    pub command: String,
    /// Category the command covers
    pub category: ValidationCategory,
    /// Optional commands may fail without blocking
    #[serde(default)]
    pub optional: bool,
    /// Directory the command must run in (manifest directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ValidationCommand {
    /// A required command with no pinned cwd
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        category: ValidationCategory,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            category,
            optional: false,
            cwd: None,
        }
    }

    /// Mark optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A detected stack with its command list and manifest location
#[derive(Debug, Clone, PartialEq)]
pub struct StackConfig {
    /// Which stack was detected
    pub stack: StackType,
    /// Canonical commands for the stack
    pub commands: Vec<ValidationCommand>,
    /// Directory containing the manifest (None for spec-derived configs)
    pub root_path: Option<PathBuf>,
}

impl StackConfig {
    /// Config with the canonical command list for `stack`
    pub fn canonical(stack: StackType, root_path: Option<PathBuf>) -> Self {
        Self {
            stack,
            commands: canonical_commands(stack),
            root_path,
        }
    }
}

/// Canonical command list per stack
pub fn canonical_commands(stack: StackType) -> Vec<ValidationCommand> {
    match stack {
        StackType::Python => vec![
            ValidationCommand::new("linting", "ruff check .", ValidationCategory::Lint),
            ValidationCommand::new("type-check", "mypy .", ValidationCategory::Type),
            ValidationCommand::new("tests", "pytest", ValidationCategory::Test),
        ],
        StackType::Typescript => vec![
            ValidationCommand::new("linting", "npm run lint", ValidationCategory::Lint).optional(),
            ValidationCommand::new("type-check", "npx tsc --noEmit", ValidationCategory::Type),
            ValidationCommand::new("tests", "npm test", ValidationCategory::Test),
        ],
        StackType::Javascript => vec![
            ValidationCommand::new("linting", "npm run lint", ValidationCategory::Lint).optional(),
            ValidationCommand::new(
                "formatting",
                "npx prettier --check .",
                ValidationCategory::Format,
            )
            .optional(),
            ValidationCommand::new("tests", "npm test", ValidationCategory::Test),
        ],
        StackType::Go => vec![
            ValidationCommand::new("build", "go build ./...", ValidationCategory::Build),
            ValidationCommand::new("linting", "go vet ./...", ValidationCategory::Lint),
            ValidationCommand::new("tests", "go test ./...", ValidationCategory::Test),
        ],
        StackType::Rust => vec![
            ValidationCommand::new(
                "linting",
                "cargo clippy -- -D warnings",
                ValidationCategory::Lint,
            ),
            ValidationCommand::new("formatting", "cargo fmt --check", ValidationCategory::Format)
                .optional(),
            ValidationCommand::new("tests", "cargo test", ValidationCategory::Test),
        ],
        StackType::Swift => vec![
            ValidationCommand::new("build", "swift build", ValidationCategory::Build),
            ValidationCommand::new("tests", "swift test", ValidationCategory::Test),
        ],
    }
}

fn manifest_present(dir: &Path, stack: StackType) -> bool {
    let has = |name: &str| dir.join(name).is_file();
    match stack {
        StackType::Python => {
            has("pyproject.toml") || has("setup.py") || has("requirements.txt")
        }
        StackType::Typescript => has("package.json") && has("tsconfig.json"),
        StackType::Javascript => has("package.json") && !has("tsconfig.json"),
        StackType::Go => has("go.mod"),
        StackType::Rust => has("Cargo.toml"),
        StackType::Swift => has("Package.swift"),
    }
}

/// Detect stacks from manifests at the root, then in visible depth-1
/// children. A stack found at the root suppresses child scans for that
/// same stack. Children are visited in name order for determinism.
pub fn detect_stack(project_root: &Path) -> Vec<StackConfig> {
    let mut configs = Vec::new();
    let mut found_at_root = BTreeSet::new();

    for &stack in STACK_ORDER {
        if manifest_present(project_root, stack) {
            found_at_root.insert(stack);
            configs.push(StackConfig::canonical(
                stack,
                Some(project_root.to_path_buf()),
            ));
        }
    }

    let mut children: Vec<PathBuf> = std::fs::read_dir(project_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();
    children.sort();

    for child in children {
        for &stack in STACK_ORDER {
            if found_at_root.contains(&stack) {
                continue;
            }
            if manifest_present(&child, stack) {
                configs.push(StackConfig::canonical(stack, Some(child.clone())));
            }
        }
    }

    configs
}

/// Keyword fallback used when no manifests exist yet
pub fn detect_stack_from_spec(spec: &str) -> Vec<StackType> {
    let lower = spec.to_lowercase();
    let mut stacks = Vec::new();
    let keyword_sets: &[(StackType, &[&str])] = &[
        (StackType::Python, &["python", "pytest", "django", "flask"]),
        (StackType::Typescript, &["typescript"]),
        (StackType::Javascript, &["javascript", "node.js", "nodejs"]),
        (StackType::Go, &["golang", "go.mod", " go "]),
        (StackType::Rust, &["rust", "cargo"]),
        (StackType::Swift, &["swift"]),
    ];
    for (stack, keywords) in keyword_sets {
        if keywords.iter().any(|k| lower.contains(k)) {
            stacks.push(*stack);
        }
    }
    stacks
}

/// Resolve the ordered validation-command list for a project.
///
/// Per-category overrides replace the canonical command text; duplicates
/// by `(name, command)` collapse to the first occurrence; each command
/// carries the cwd of the manifest that contributed it.
pub fn resolve_validation_commands(
    project_root: &Path,
    spec: &str,
    overrides: &BTreeMap<ValidationCategory, String>,
) -> Vec<ValidationCommand> {
    let mut configs = detect_stack(project_root);
    if configs.is_empty() {
        for stack in detect_stack_from_spec(spec) {
            configs.push(StackConfig::canonical(stack, None));
        }
    }

    let mut resolved = Vec::new();
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    for config in &configs {
        for cmd in &config.commands {
            let command = overrides
                .get(&cmd.category)
                .cloned()
                .unwrap_or_else(|| cmd.command.clone());
            let key = (cmd.name.clone(), command.clone());
            if !seen.insert(key) {
                continue;
            }
            resolved.push(ValidationCommand {
                name: cmd.name.clone(),
                command,
                category: cmd.category,
                optional: cmd.optional,
                cwd: config.root_path.clone(),
            });
        }
    }
    resolved
}

/// Render the stack-aware validation section of the execution prompt
pub fn build_validation_section(
    configs: &[StackConfig],
    overrides: &BTreeMap<ValidationCategory, String>,
) -> String {
    if configs.is_empty() {
        return "Interpret checklist items as validation requirements and run the \
                project's own test and lint tooling before claiming completion."
            .to_string();
    }

    let mut section = String::new();
    for config in configs {
        section.push_str(&format!("### {} validation\n", config.stack));
        for cmd in &config.commands {
            let command = overrides
                .get(&cmd.category)
                .cloned()
                .unwrap_or_else(|| cmd.command.clone());
            let optional = if cmd.optional { " (optional)" } else { "" };
            section.push_str(&format!(
                "- {}: `{}`{}\n",
                cmd.category, command, optional
            ));
        }
        section.push('\n');
    }
    section.trim_end().to_string()
}
