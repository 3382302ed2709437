//! Storage-key construction: user-key sanitization and endpoint-path
//! normalization, per SPEC_FULL.md §3.

use std::sync::LazyLock;

use config::Identity;
use regex::Regex;
use sha2::{Digest, Sha256};

static SAFE_USER_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
static NUMERIC_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").unwrap());
static UUID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").unwrap()
});
static OBJECT_ID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{24}$").unwrap());
static KEBAB_CASE_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)+$").unwrap());

/// Reduce a raw caller-supplied user key to a value safe for storage-key
/// construction. Keys already matching the allowlisted shape pass through
/// unchanged; anything else is deterministically hashed so malformed input
/// can't collide different callers onto the same bucket.
pub fn sanitize_user_key(raw: &str) -> String {
    if SAFE_USER_KEY.is_match(raw) {
        return raw.to_string();
    }

    let digest = Sha256::digest(raw.as_bytes());
    let hex = format!("{digest:x}");
    format!("hashed_{}", &hex[..32])
}

/// Build the normalized endpoint key `METHOD|/normalized/path`, replacing
/// dynamic path segments (numeric IDs, UUIDs, ObjectIds, opaque long tokens)
/// with `:id` while preserving kebab-case words.
pub fn normalize_endpoint(method: &str, path: &str) -> String {
    let normalized_path = path.split('/').map(normalize_segment).collect::<Vec<_>>().join("/");

    format!("{}|{}", method.to_uppercase(), normalized_path)
}

fn normalize_segment(segment: &str) -> String {
    if segment.is_empty() {
        return String::new();
    }

    if NUMERIC_SEGMENT.is_match(segment) || UUID_SEGMENT.is_match(segment) || OBJECT_ID_SEGMENT.is_match(segment) {
        return ":id".to_string();
    }

    if segment.len() >= 16 && !KEBAB_CASE_SEGMENT.is_match(segment) {
        return ":id".to_string();
    }

    segment.to_string()
}

/// Build the counter-store key for one `(namespace, identity, endpoint)`
/// triple: `{namespace}:{user_key}:{endpoint}`, scoped so the in-memory
/// store's per-identity eviction (keyed on the first two `:`-segments) groups
/// correctly.
pub fn counter_key(namespace: &str, identity: &Identity, endpoint: &str) -> String {
    format!("{namespace}:{}:{endpoint}", sanitize_user_key(&identity.user_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_keys_pass_through() {
        assert_eq!(sanitize_user_key("user-123_ABC"), "user-123_ABC");
    }

    #[test]
    fn unsafe_keys_are_hashed() {
        let hashed = sanitize_user_key("weird key with spaces/слеш");
        assert!(hashed.starts_with("hashed_"));
        assert_eq!(hashed.len(), "hashed_".len() + 32);
    }

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(sanitize_user_key("a b"), sanitize_user_key("a b"));
    }

    #[test]
    fn numeric_and_uuid_segments_normalize() {
        assert_eq!(normalize_endpoint("GET", "/users/1234"), "GET|/users/:id");
        assert_eq!(
            normalize_endpoint("GET", "/users/550e8400-e29b-41d4-a716-446655440000"),
            "GET|/users/:id"
        );
        assert_eq!(normalize_endpoint("GET", "/users/507f1f77bcf86cd799439011"), "GET|/users/:id");
    }

    #[test]
    fn kebab_case_segments_are_preserved() {
        assert_eq!(normalize_endpoint("GET", "/plans/free-strict-extended"), "GET|/plans/free-strict-extended");
    }

    #[test]
    fn opaque_long_tokens_normalize() {
        assert_eq!(normalize_endpoint("GET", "/sessions/ab3F9kZ0pQweRtYu1"), "GET|/sessions/:id");
    }

    #[test]
    fn short_opaque_segments_are_preserved() {
        assert_eq!(normalize_endpoint("GET", "/api/ask"), "GET|/api/ask");
    }
}
