//! Loads microagents from markdown files.
//!
//! A microagent file is markdown with optional frontmatter:
//!
//! ```text
//! ---
//! name: python_tips
//! type: knowledge
//! triggers: [python, pip]
//! ---
//! Prefer virtual environments.
//! ```
//!
//! Without a `type`, files declaring triggers are knowledge microagents and
//! files without triggers are repository microagents.

use super::{Microagent, MicroagentScope};
use crate::errors::MicroagentError;
use glob::glob;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Maximum accepted size of a microagent file (100 KB).
pub const MAX_MICROAGENT_FILE_SIZE: u64 = 100 * 1024;

/// Directory, relative to a repository root, holding its microagents.
pub const REPO_MICROAGENTS_DIR: &str = ".openhands/microagents";

static FRONTMATTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\A\s*---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n(.*))?\z")
        .expect("frontmatter regex is valid")
});

/// Recursively loads every `*.md` file under `dir`, except READMEs.
///
/// A missing directory yields no microagents.
pub fn load_microagents_from_dir(dir: &Path) -> Result<Vec<Microagent>, MicroagentError> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "Microagent directory not found");
        return Ok(Vec::new());
    }

    let pattern = format!("{}/**/*.md", dir.display());
    let mut microagents = Vec::new();
    for entry in glob(&pattern)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable microagent path");
                continue;
            }
        };
        let is_readme = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.eq_ignore_ascii_case("README.md"));
        if is_readme {
            continue;
        }

        let size = fs::metadata(&path)?.len();
        if size > MAX_MICROAGENT_FILE_SIZE {
            return Err(MicroagentError::FileTooLarge {
                path: path.display().to_string(),
                size,
                max: MAX_MICROAGENT_FILE_SIZE,
            });
        }

        let raw = fs::read_to_string(&path)?;
        let default_name = path
            .strip_prefix(dir)
            .unwrap_or(&path)
            .with_extension("")
            .to_string_lossy()
            .replace('\\', "/");
        microagents.push(parse_microagent(&default_name, &path.display().to_string(), &raw)?);
    }

    debug!(dir = %dir.display(), count = microagents.len(), "Loaded microagents");
    Ok(microagents)
}

/// Frontmatter keys a microagent file may carry. Unknown keys (`agent`,
/// `version`, ...) are ignored.
#[derive(Debug, Default, Deserialize)]
struct MicroagentFrontmatter {
    name: Option<String>,
    r#type: Option<String>,
    triggers: Option<Vec<String>>,
}

/// Parses one microagent file. `default_name` is used when the frontmatter
/// has no `name`.
pub fn parse_microagent(
    default_name: &str,
    path: &str,
    raw: &str,
) -> Result<Microagent, MicroagentError> {
    let parse_error = |message: String| MicroagentError::Parse {
        path: path.to_string(),
        message,
    };

    let (frontmatter, body) = match FRONTMATTER_RE.captures(raw) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str()).unwrap_or(""),
            caps.get(2).map(|m| m.as_str()).unwrap_or(""),
        ),
        None => ("", raw),
    };
    let frontmatter: MicroagentFrontmatter = if frontmatter.trim().is_empty() {
        MicroagentFrontmatter::default()
    } else {
        serde_yaml::from_str(frontmatter)
            .map_err(|e| parse_error(format!("invalid frontmatter: {}", e)))?
    };

    let name = frontmatter
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_name.to_string());
    let triggers: Vec<String> = frontmatter
        .triggers
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let scope = match frontmatter.r#type.as_deref().map(str::to_lowercase) {
        Some(kind) => match kind.as_str() {
            "repo" | "repository" => MicroagentScope::Repository,
            "knowledge" => MicroagentScope::Knowledge,
            other => return Err(parse_error(format!("unknown microagent type '{}'", other))),
        },
        None if triggers.is_empty() => MicroagentScope::Repository,
        None => MicroagentScope::Knowledge,
    };

    match scope {
        MicroagentScope::Knowledge if triggers.is_empty() => Err(parse_error(
            "knowledge microagent declares no triggers".to_string(),
        )),
        MicroagentScope::Knowledge => Ok(Microagent::knowledge(name, triggers, body.trim())),
        MicroagentScope::Repository => Ok(Microagent::repository(name, body.trim())),
    }
}
