//! Pre-scoring content screen.
//!
//! Runs before the toxicity provider to short-circuit comments that carry
//! injection payloads (template expressions, script tags, data URIs). A
//! matching comment is skipped: it is never scored, never billed and never
//! routed to Shield.

use regex::Regex;
use tracing::{debug, warn};

use crate::triage::types::Comment;

/// Reasoning attached to decisions produced by the screen.
pub const SECURITY_PATTERN_REASON: &str = "security_pattern_detected";

/// Built-in screening patterns: (pattern, description).
const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    (r"\{\{.*\}\}", "template expression"),
    (r"\$\{.*\}", "interpolation expression"),
    (r"(?i)<script.*>", "script tag"),
    (r"(?i)javascript:", "javascript URI"),
    (r"(?i)data:.*base64", "base64 data URI"),
];

/// Which comment field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Text,
    AuthorUsername,
}

/// A single screening rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct ScreenRule {
    /// Source pattern, kept for logging.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    /// Why this rule triggers.
    pub description: String,
}

/// What the screen found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenMatch {
    pub pattern: String,
    pub description: String,
}

/// Regex screen evaluated before scoring.
#[derive(Debug, Clone, Default)]
pub struct ContentRules {
    rules: Vec<ScreenRule>,
}

impl ContentRules {
    /// Screen with the built-in injection patterns.
    pub fn default_rules() -> Self {
        let mut rules = Self::empty();
        for (pattern, description) in DEFAULT_PATTERNS {
            if let Err(e) = rules.add_rule(pattern, RuleField::Text, description) {
                warn!(pattern, error = %e, "Skipping invalid screening pattern");
            }
        }
        rules
    }

    /// Screen that passes everything.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        description: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(ScreenRule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            description: description.into(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a comment. Returns the first matching rule, if any.
    pub fn evaluate(&self, comment: &Comment) -> Option<ScreenMatch> {
        for rule in &self.rules {
            let value = match rule.field {
                RuleField::Text => comment.text.as_str(),
                RuleField::AuthorUsername => match comment.author_username.as_deref() {
                    Some(name) => name,
                    None => continue,
                },
            };

            if rule.regex.is_match(value) {
                debug!(
                    comment_id = %comment.id,
                    organization_id = %comment.organization_id,
                    rule = %rule.description,
                    "Comment matched screening rule"
                );
                return Some(ScreenMatch {
                    pattern: rule.pattern.clone(),
                    description: rule.description.clone(),
                });
            }
        }
        None
    }
}
