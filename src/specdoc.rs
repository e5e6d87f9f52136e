//! Project specification document parsing.
//!
//! A project spec is a markdown document with distinguishable GOALS,
//! SCOPE (in/out), and CONSTRAINTS sections. The parser extracts bullet
//! items from each section:
//!
//! ```markdown
//! # Goals
//! - Fast, resumable pipeline runs
//!
//! # Scope
//! ## In
//! - Orchestration engine
//! ## Out
//! - UI theming
//!
//! # Constraints
//! - No network access during tests
//! ```
//!
//! Heading matching is case-insensitive and tolerant of wording like
//! "In Scope" / "Out of Scope". Anything else in the document is ignored.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

static HEADING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.+?)\s*$").unwrap());

static BULLET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*+]\s+(.+?)\s*$").unwrap());

/// Parsed project specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectSpec {
    pub goals: Vec<String>,
    pub scope_in: Vec<String>,
    pub scope_out: Vec<String>,
    pub constraints: Vec<String>,
}

impl ProjectSpec {
    /// True if no section yielded any item.
    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
            && self.scope_in.is_empty()
            && self.scope_out.is_empty()
            && self.constraints.is_empty()
    }
}

/// Structured failure parsing a project specification document.
#[derive(Debug, Error)]
pub enum SpecParseError {
    #[error("specification document not found at {path}")]
    Missing { path: PathBuf },

    #[error("failed to read specification at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("specification at {path} has no recognizable GOALS/SCOPE/CONSTRAINTS sections")]
    NoSections { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Goals,
    Scope,
    ScopeIn,
    ScopeOut,
    Constraints,
}

/// Classify a heading line into the section it opens.
///
/// `current` matters for bare "In"/"Out" sub-headings, which only count
/// inside a SCOPE section.
fn classify_heading(text: &str, current: Section) -> Section {
    let lower = text.to_lowercase();
    let in_scope = matches!(
        current,
        Section::Scope | Section::ScopeIn | Section::ScopeOut
    );

    if lower.contains("goal") {
        Section::Goals
    } else if lower.contains("constraint") {
        Section::Constraints
    } else if lower.contains("scope") && lower.contains("out") {
        Section::ScopeOut
    } else if lower.contains("scope") && lower.contains("in") {
        Section::ScopeIn
    } else if lower.contains("scope") {
        Section::Scope
    } else if in_scope && lower.trim() == "out" {
        Section::ScopeOut
    } else if in_scope && lower.trim() == "in" {
        Section::ScopeIn
    } else {
        Section::None
    }
}

/// Parse a project specification document from disk.
pub fn parse(path: &Path) -> Result<ProjectSpec, SpecParseError> {
    if !path.exists() {
        return Err(SpecParseError::Missing {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| SpecParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let spec = parse_content(&content);
    if spec.is_empty() {
        return Err(SpecParseError::NoSections {
            path: path.to_path_buf(),
        });
    }
    Ok(spec)
}

/// Parse spec content already in memory. Exposed for the validator's tests.
pub fn parse_content(content: &str) -> ProjectSpec {
    let mut spec = ProjectSpec::default();
    let mut section = Section::None;

    for line in content.lines() {
        if let Some(cap) = HEADING_REGEX.captures(line) {
            section = classify_heading(&cap[1], section);
            continue;
        }
        let Some(cap) = BULLET_REGEX.captures(line) else {
            continue;
        };
        let item = cap[1].to_string();
        match section {
            Section::Goals => spec.goals.push(item),
            // Bullets directly under "Scope" count as in-scope.
            Section::Scope | Section::ScopeIn => spec.scope_in.push(item),
            Section::ScopeOut => spec.scope_out.push(item),
            Section::Constraints => spec.constraints.push(item),
            Section::None => {}
        }
    }

    spec
}
