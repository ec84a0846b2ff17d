// SPDX-License-Identifier: MIT OR Apache-2.0
//! Image digest normalization.
//!
//! Digests are compared in exactly one canonical form: lowercase
//! `sha256:<64 hex>`. Image references carrying a digest
//! (`repo/name@sha256:…`) are stripped down to the digest part.
//! Placeholder digests (`sha256:pending`) normalize to `None` and never
//! match anything.

/// Placeholder digest value used in registry specs before an image is
/// published.
pub const PLACEHOLDER_DIGEST: &str = "sha256:pending";

/// Normalize an image digest or digest-bearing image reference.
///
/// Accepts `sha256:<hex>`, `SHA256:<HEX>`, or `repo/name@sha256:<hex>`.
/// Returns `None` for empty input, the placeholder, or anything that is
/// not a well-formed 64-hex sha256 digest.
///
/// # Examples
///
/// ```
/// use theory_core::digest::normalize_digest;
///
/// let d = "A".repeat(64);
/// assert_eq!(
///     normalize_digest(&format!("ghcr.io/t/llm@sha256:{d}")).as_deref(),
///     Some(format!("sha256:{}", d.to_lowercase()).as_str()),
/// );
/// assert_eq!(normalize_digest("sha256:pending"), None);
/// assert_eq!(normalize_digest(""), None);
/// ```
#[must_use]
pub fn normalize_digest(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    // Strip a registry prefix: "repo@sha256:…" → "sha256:…".
    let tail = match raw.rsplit_once('@') {
        Some((_, t)) => t,
        None => raw,
    };
    let lower = tail.to_lowercase();
    if lower == PLACEHOLDER_DIGEST {
        return None;
    }
    let hex = lower.strip_prefix("sha256:")?;
    if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(format!("sha256:{hex}"))
    } else {
        None
    }
}

/// Compare two digests after normalization.
///
/// Two digests match only when both normalize to the same canonical form.
/// A placeholder or malformed digest on either side never matches.
#[must_use]
pub fn digests_match(a: &str, b: &str) -> bool {
    match (normalize_digest(a), normalize_digest(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Returns `true` if `raw` is either the placeholder or a well-formed
/// digest, the two shapes a registry spec may legally carry.
#[must_use]
pub fn is_valid_spec_digest(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case(PLACEHOLDER_DIGEST) || normalize_digest(raw).is_some()
}
