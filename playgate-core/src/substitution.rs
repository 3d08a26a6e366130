//! Parameter substitution over a fixed, enumerated key set.
//!
//! Supports `${subject_id}`, `${playbook_id}`, `${playbook_version}` and
//! `${executed_by}`. Nothing else is a placeholder: there are no expressions,
//! no lookups, and no evaluation. Validation only scans; resolution happens at
//! execution time through [`resolve`], a pure and total function.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The allow-listed substitution keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionKey {
    SubjectId,
    PlaybookId,
    PlaybookVersion,
    ExecutedBy,
}

impl SubstitutionKey {
    pub const ALL: [SubstitutionKey; 4] = [
        SubstitutionKey::SubjectId,
        SubstitutionKey::PlaybookId,
        SubstitutionKey::PlaybookVersion,
        SubstitutionKey::ExecutedBy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SubstitutionKey::SubjectId => "subject_id",
            SubstitutionKey::PlaybookId => "playbook_id",
            SubstitutionKey::PlaybookVersion => "playbook_version",
            SubstitutionKey::ExecutedBy => "executed_by",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for SubstitutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}}}", self.name())
    }
}

/// Values available for substitution during one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionContext {
    pub subject_id: String,
    pub playbook_id: String,
    pub playbook_version: String,
    pub executed_by: String,
}

impl SubstitutionContext {
    pub fn value(&self, key: SubstitutionKey) -> &str {
        match key {
            SubstitutionKey::SubjectId => &self.subject_id,
            SubstitutionKey::PlaybookId => &self.playbook_id,
            SubstitutionKey::PlaybookVersion => &self.playbook_version,
            SubstitutionKey::ExecutedBy => &self.executed_by,
        }
    }
}

/// Why a string failed the placeholder scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderIssue {
    /// `${` with no closing brace.
    Unterminated,
    /// `${name}` where `name` is not allow-listed.
    UnknownKey(String),
}

impl fmt::Display for PlaceholderIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderIssue::Unterminated => write!(f, "unterminated substitution expression"),
            PlaceholderIssue::UnknownKey(key) => {
                write!(f, "substitution '${{{}}}' is not in the allow-list", key)
            }
        }
    }
}

/// Scan `text` for placeholders without resolving them.
///
/// Returns the allow-listed keys found, in order, or the first issue.
pub fn scan(text: &str) -> Result<Vec<SubstitutionKey>, PlaceholderIssue> {
    let mut keys = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let after_open = &rest[start + 2..];
        let end = after_open.find('}').ok_or(PlaceholderIssue::Unterminated)?;
        let name = &after_open[..end];
        let key = SubstitutionKey::from_name(name)
            .ok_or_else(|| PlaceholderIssue::UnknownKey(name.to_string()))?;
        keys.push(key);
        rest = &after_open[end + 1..];
    }

    Ok(keys)
}

/// Replace allow-listed placeholders with their values.
///
/// Total: anything that is not an allow-listed placeholder (including an
/// unterminated `${`) is copied through verbatim.
pub fn resolve(template: &str, ctx: &SubstitutionContext) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        match SubstitutionKey::from_name(&after_open[..end]) {
            Some(key) => result.push_str(ctx.value(key)),
            None => result.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after_open[end + 1..];
    }
    result.push_str(rest);

    result
}
