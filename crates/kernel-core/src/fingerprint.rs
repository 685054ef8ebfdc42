// SPDX-License-Identifier: MIT

//! Deterministic dedup-key fingerprinting (spec.md §4.8, glossary "Dedup
//! key"): a sha256 fingerprint over `(skill, scope, resource, input)` so
//! identical semantic operations produce identical keys regardless of call
//! site.

use sha2::{Digest, Sha256};

/// Compute the idempotency-index key for one step invocation.
pub fn dedup_key(skill: &str, scope: &str, resource: &str, input: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(skill.as_bytes());
    hasher.update([0u8]);
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(resource.as_bytes());
    hasher.update([0u8]);
    // serde_json's default `Map` is a `BTreeMap` (no `preserve_order`
    // feature enabled anywhere in this workspace), so re-serializing
    // through `to_value` yields a canonical, key-sorted byte sequence
    // regardless of how the caller constructed the input.
    let canonical = serde_json::to_value(input).unwrap_or(serde_json::Value::Null);
    hasher.update(serde_json::to_vec(&canonical).unwrap_or_default());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_deterministic_regardless_of_field_order() {
        let a = dedup_key(
            "create_pull_request",
            "r/main",
            "pr/2",
            &serde_json::json!({"a": 1, "b": 2}),
        );
        let b = dedup_key(
            "create_pull_request",
            "r/main",
            "pr/2",
            &serde_json::json!({"b": 2, "a": 1}),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn differs_on_any_component() {
        let base = dedup_key("skill", "scope", "resource", &serde_json::json!({}));
        let diff_skill = dedup_key("other", "scope", "resource", &serde_json::json!({}));
        let diff_scope = dedup_key("skill", "other", "resource", &serde_json::json!({}));
        let diff_resource = dedup_key("skill", "scope", "other", &serde_json::json!({}));
        assert_ne!(base, diff_skill);
        assert_ne!(base, diff_scope);
        assert_ne!(base, diff_resource);
    }
}
