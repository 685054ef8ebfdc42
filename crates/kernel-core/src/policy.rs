// SPDX-License-Identifier: MIT

//! Capability traits for the external collaborators named in spec.md §1 and
//! §9 ("Polymorphism: prefer interface/trait abstractions"): the
//! action-policy allow/deny bundle, and the redaction pattern set. Their
//! concrete implementations (secret redaction, policy source) stay outside
//! this crate's scope; only the seam is specified here.

use serde::{Deserialize, Serialize};

/// One caller-supplied redaction rule (spec.md §6, `extraRedactionPatterns`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionPattern {
    pub name: String,
    pub pattern: String,
    #[serde(default = "default_replacement")]
    pub replacement: String,
}

fn default_replacement() -> String {
    "[REDACTED]".to_string()
}

/// Single-method capability that redacts a payload before it is durably
/// recorded. The concrete secret-matching implementation is an external
/// collaborator (spec.md §1); this crate only depends on the seam.
pub trait Redactor: Send + Sync {
    fn redact(&self, payload: serde_json::Value) -> serde_json::Value;
}

/// A redactor that performs no redaction, used when none is configured and
/// by tests.
pub struct NoopRedactor;

impl Redactor for NoopRedactor {
    fn redact(&self, payload: serde_json::Value) -> serde_json::Value {
        payload
    }
}

/// Wraps an inner redactor with a literal-substring pass over every string
/// leaf of the payload, applying `extraRedactionPatterns` (spec.md §6) on
/// top of whatever secret-matching the inner redactor already does.
pub struct PatternRedactor {
    pub patterns: Vec<RedactionPattern>,
    pub inner: std::sync::Arc<dyn Redactor>,
}

impl Redactor for PatternRedactor {
    fn redact(&self, payload: serde_json::Value) -> serde_json::Value {
        let payload = self.inner.redact(payload);
        if self.patterns.is_empty() {
            return payload;
        }
        redact_value(&self.patterns, payload)
    }
}

fn redact_value(patterns: &[RedactionPattern], value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            let redacted = patterns.iter().fold(s, |acc, p| acc.replace(&p.pattern, &p.replacement));
            serde_json::Value::String(redacted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(|v| redact_value(patterns, v)).collect())
        }
        serde_json::Value::Object(map) => {
            serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, redact_value(patterns, v))).collect())
        }
        other => other,
    }
}

/// Allow/deny/constraints bundle cross-checked against the tool registry at
/// boot (spec.md §4.7 step 4).
pub trait ActionPolicy: Send + Sync {
    /// Returns `true` if `action` is permitted to run against `scope`.
    fn is_allowed(&self, action: &str, scope: &str) -> bool;
}

/// An action policy that allows everything, used when none is configured.
pub struct AllowAllPolicy;

impl ActionPolicy for AllowAllPolicy {
    fn is_allowed(&self, _action: &str, _scope: &str) -> bool {
        true
    }
}

/// Identifier restriction shared by every external CLI invocation (spec.md
/// §6: `[A-Za-z0-9_-]{1..128}`).
pub fn is_valid_external_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_charset() {
        assert!(is_valid_external_id("issue-123_v2"));
        assert!(!is_valid_external_id(""));
        assert!(!is_valid_external_id("has space"));
        assert!(!is_valid_external_id("semi;colon"));
        assert!(!is_valid_external_id(&"a".repeat(129)));
    }

    #[test]
    fn pattern_redactor_replaces_string_leaves_only() {
        let redactor = PatternRedactor {
            patterns: vec![RedactionPattern { name: "token".into(), pattern: "sk-live-1".into(), replacement: "[REDACTED]".into() }],
            inner: std::sync::Arc::new(NoopRedactor),
        };
        let payload = serde_json::json!({"apiKey": "sk-live-1", "count": 1, "nested": ["sk-live-1"]});
        let redacted = redactor.redact(payload);
        assert_eq!(redacted, serde_json::json!({"apiKey": "[REDACTED]", "count": 1, "nested": ["[REDACTED]"]}));
    }

    #[test]
    fn pattern_redactor_with_no_patterns_is_identity() {
        let redactor = PatternRedactor { patterns: Vec::new(), inner: std::sync::Arc::new(NoopRedactor) };
        let payload = serde_json::json!({"a": "b"});
        assert_eq!(redactor.redact(payload.clone()), payload);
    }
}
