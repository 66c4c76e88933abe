// src/keys.rs
//! Canonical storage key layout.

/// `{prefix}:{key}:{window}`, used by the window engines
pub fn window_key(prefix: &str, key: &str, window: u64) -> String {
    format!("{}:{}:{}", prefix, key, window)
}

/// `{prefix}:{key}`, a single record per caller key for the bucket engines
pub fn bucket_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Legacy per-bucket record. The identifier is a hash tag so the record and
/// the identifier's index set always share a cluster slot.
pub fn legacy_record_key(prefix: &str, id: &str, bucket: u64) -> String {
    format!("{}{{{}}}:{}", prefix, id, bucket)
}

/// Set of every record key registered for `id`
pub fn legacy_index_key(prefix: &str, id: &str) -> String {
    format!("{}buckets:{{{}}}", prefix, id)
}

/// SCAN MATCH pattern selecting every record key of `id`
pub fn legacy_scan_pattern(prefix: &str, id: &str) -> String {
    format!("{}{{{}}}:*", escape_glob(prefix), escape_glob(id))
}

/// Bucket index of `key` when it is a record key of exactly `id`.
///
/// The scan pattern also matches records of identifiers that merely start
/// with `id}:`, so scanned keys are filtered through this before deletion.
pub fn legacy_record_bucket(prefix: &str, id: &str, key: &str) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('{')?;
    let rest = rest.strip_prefix(id)?.strip_prefix("}:")?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// Escape glob metacharacters so caller input only matches literally
pub fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
