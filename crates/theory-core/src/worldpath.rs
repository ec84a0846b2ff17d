// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical world paths and write-prefix expansion.
//!
//! A world path is the address of an artifact or stream in object storage.
//! Canonical form: NFC-normalized, percent-decoded exactly once (an encoded
//! slash is forbidden), lowercased, `.`/`..` segments rejected, double
//! slashes collapsed, rooted at one of the facet roots.

use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Facet root for durable artifacts.
pub const ARTIFACTS_ROOT: &str = "/artifacts/";
/// Facet root for append-only streams.
pub const STREAMS_ROOT: &str = "/streams/";

/// Placeholder substituted with the execution id in write prefixes.
pub const EXECUTION_ID_PLACEHOLDER: &str = "{execution_id}";

/// Errors from world-path canonicalization and prefix expansion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The path does not start with a facet root.
    #[error("path must start with /artifacts/ or /streams/: {0:?}")]
    BadRoot(String),
    /// The path contains a `.` or `..` segment.
    #[error("path must not contain '.' or '..' segments: {0:?}")]
    Traversal(String),
    /// Percent-encoding is malformed or hides a slash.
    #[error("bad percent-encoding in path: {0:?}")]
    BadEncoding(String),
    /// A write prefix is missing its trailing or leading slash.
    #[error("write prefix must start and end with '/': {0:?}")]
    BadPrefix(String),
    /// A write prefix resolves outside `/artifacts/`.
    #[error("write prefix must be under /artifacts/: {0:?}")]
    OutsideArtifacts(String),
}

/// A canonicalized world path.
///
/// # Examples
///
/// ```
/// use theory_core::worldpath::WorldPath;
///
/// let p = WorldPath::parse("/Artifacts//T/%41bc/file.txt").unwrap();
/// assert_eq!(p.as_str(), "/artifacts/t/abc/file.txt");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorldPath(String);

impl WorldPath {
    /// Canonicalize `raw` into a world path.
    ///
    /// # Errors
    ///
    /// See [`PathError`] for each rejection.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let canon = canonicalize(raw)?;
        Ok(Self(canon))
    }

    /// The canonical path string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this path ends with `/` (a prefix).
    #[must_use]
    pub fn is_prefix(&self) -> bool {
        self.0.ends_with('/')
    }
}

impl fmt::Display for WorldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Percent-decode exactly once. `%2F`/`%2f` is rejected: an encoded slash
/// must never create a new segment boundary.
fn percent_decode_once(s: &str) -> Result<String, PathError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .ok_or_else(|| PathError::BadEncoding(s.into()))?;
            let v = u8::from_str_radix(hex, 16).map_err(|_| PathError::BadEncoding(s.into()))?;
            if v == b'/' {
                return Err(PathError::BadEncoding(s.into()));
            }
            out.push(v);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| PathError::BadEncoding(s.into()))
}

fn canonicalize(raw: &str) -> Result<String, PathError> {
    let decoded = percent_decode_once(raw)?;
    let nfc: String = decoded.nfc().collect();
    let lower = nfc.to_lowercase();

    if !lower.starts_with('/') {
        return Err(PathError::BadRoot(raw.into()));
    }

    let trailing = lower.ends_with('/');
    let mut segments = Vec::new();
    for seg in lower.split('/') {
        if seg.is_empty() {
            continue; // collapse double slashes
        }
        if seg == "." || seg == ".." {
            return Err(PathError::Traversal(raw.into()));
        }
        segments.push(seg);
    }

    let mut canon = format!("/{}", segments.join("/"));
    if trailing && !canon.ends_with('/') {
        canon.push('/');
    }

    let rooted = canon.starts_with(ARTIFACTS_ROOT)
        || canon.starts_with(STREAMS_ROOT)
        || canon == ARTIFACTS_ROOT.trim_end_matches('/')
        || canon == STREAMS_ROOT.trim_end_matches('/');
    if !rooted {
        return Err(PathError::BadRoot(raw.into()));
    }
    Ok(canon)
}

/// Expand `{execution_id}` in a write prefix and validate the result.
///
/// The placeholder is substituted exactly once; expanding an already
/// expanded prefix is a no-op (idempotent). The result must start and end
/// with `/`, resolve to a canonical path under `/artifacts/`, and contain
/// no traversal segments.
///
/// # Examples
///
/// ```
/// use theory_core::worldpath::expand_write_prefix;
///
/// let p = expand_write_prefix("/artifacts/t/{execution_id}/", "e-1").unwrap();
/// assert_eq!(p, "/artifacts/t/e-1/");
/// // Idempotent: expanding again changes nothing.
/// assert_eq!(expand_write_prefix(&p, "e-1").unwrap(), p);
/// ```
///
/// # Errors
///
/// Returns [`PathError`] when the expanded prefix is malformed; callers
/// surface it as `ERR_PREFIX_TEMPLATE`.
pub fn expand_write_prefix(prefix: &str, execution_id: &str) -> Result<String, PathError> {
    let expanded = prefix.replacen(EXECUTION_ID_PLACEHOLDER, execution_id, 1);
    if expanded.contains(EXECUTION_ID_PLACEHOLDER) {
        return Err(PathError::BadPrefix(prefix.into()));
    }
    if !expanded.starts_with('/') || !expanded.ends_with('/') {
        return Err(PathError::BadPrefix(prefix.into()));
    }
    let canon = canonicalize(&expanded)?;
    if !canon.starts_with(ARTIFACTS_ROOT) {
        return Err(PathError::OutsideArtifacts(prefix.into()));
    }
    if !canon.ends_with('/') {
        return Err(PathError::BadPrefix(prefix.into()));
    }
    Ok(canon)
}

/// Returns `true` if the prefix ends in a reserved `/outputs` segment.
///
/// The `outputs/` subtree is owned by the worker; a caller-supplied prefix
/// must not collide with it.
#[must_use]
pub fn ends_in_reserved_outputs(prefix: &str) -> bool {
    prefix.trim_end_matches('/').ends_with("/outputs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn canonical_lowercases_and_collapses() {
        let p = WorldPath::parse("/Artifacts//A//B/c.txt").unwrap();
        assert_eq!(p.as_str(), "/artifacts/a/b/c.txt");
    }

    #[test]
    fn rejects_traversal() {
        assert_eq!(
            WorldPath::parse("/artifacts/../etc/"),
            Err(PathError::Traversal("/artifacts/../etc/".into()))
        );
        assert!(WorldPath::parse("/artifacts/./x").is_err());
    }

    #[test]
    fn rejects_foreign_roots() {
        assert!(WorldPath::parse("/etc/passwd").is_err());
        assert!(WorldPath::parse("artifacts/x").is_err());
    }

    #[test]
    fn streams_root_accepted() {
        let p = WorldPath::parse("/streams/run-1/stdout").unwrap();
        assert_eq!(p.as_str(), "/streams/run-1/stdout");
    }

    #[test]
    fn decodes_percent_once() {
        let p = WorldPath::parse("/artifacts/%41%42/file").unwrap();
        assert_eq!(p.as_str(), "/artifacts/ab/file");
        // %252F decodes once to %2F, which stays literal text, not a slash.
        let q = WorldPath::parse("/artifacts/a%252fb").unwrap();
        assert_eq!(q.as_str(), "/artifacts/a%2fb");
    }

    #[test]
    fn rejects_encoded_slash() {
        assert!(WorldPath::parse("/artifacts/a%2Fb").is_err());
        assert!(WorldPath::parse("/artifacts/a%2fb").is_err());
    }

    #[test]
    fn prefix_expansion_happy_path() {
        let p = expand_write_prefix("/artifacts/llm/litellm/1/{execution_id}/", "e-42").unwrap();
        assert_eq!(p, "/artifacts/llm/litellm/1/e-42/");
    }

    #[test]
    fn prefix_expansion_is_idempotent() {
        let once = expand_write_prefix("/artifacts/t/{execution_id}/", "abc").unwrap();
        let twice = expand_write_prefix(&once, "abc").unwrap();
        assert_eq!(once, twice);
        assert!(!twice.contains(EXECUTION_ID_PLACEHOLDER));
    }

    #[test]
    fn prefix_requires_trailing_slash() {
        assert!(expand_write_prefix("/artifacts/t/{execution_id}", "e").is_err());
    }

    #[test]
    fn prefix_rejects_traversal_and_foreign_root() {
        assert!(matches!(
            expand_write_prefix("/artifacts/../etc/", "e"),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            expand_write_prefix("/streams/t/", "e"),
            Err(PathError::OutsideArtifacts(_))
        ));
    }

    #[test]
    fn reserved_outputs_detected() {
        assert!(ends_in_reserved_outputs("/artifacts/t/outputs/"));
        assert!(ends_in_reserved_outputs("/artifacts/t/outputs"));
        assert!(!ends_in_reserved_outputs("/artifacts/t/outputs-x/"));
    }

    proptest! {
        // Expansion is idempotent for any id made of url-safe characters.
        #[test]
        fn expansion_idempotent(id in "[a-z0-9-]{1,32}") {
            let once = expand_write_prefix("/artifacts/ns/n/1/{execution_id}/", &id).unwrap();
            let twice = expand_write_prefix(&once, &id).unwrap();
            prop_assert_eq!(once, twice);
        }

        // Canonicalization is a fixpoint: parsing a canonical path returns it.
        #[test]
        fn canonical_fixpoint(tail in "[a-z0-9/._-]{0,40}") {
            if let Ok(p) = WorldPath::parse(&format!("/artifacts/{tail}")) {
                let again = WorldPath::parse(p.as_str()).unwrap();
                prop_assert_eq!(p, again);
            }
        }
    }
}
