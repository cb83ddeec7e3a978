use regex::Regex;
use tagstore_core::{StoreError, StoreResult};

/// Compile a Redis-style glob (`*`, `?`) into an anchored regex.
pub(crate) fn compile(pattern: &str) -> StoreResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| StoreError::backend(format!("invalid pattern '{pattern}': {e}")))
}
