// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error-code catalog for the execution plane.
//!
//! Every failure that reaches a client travels inside an error envelope
//! whose `code` is one of these `ERR_*` strings. Codes are stable: they are
//! matched by callers and never change across releases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable, stable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No registry entry for the requested ref.
    ErrUnknownRef,
    /// The registry spec is malformed.
    ErrRegistry,
    /// Write-prefix placeholder, root, or traversal violation.
    ErrPrefixTemplate,
    /// A required secret is absent in real mode.
    ErrMissingSecret,
    /// `IMAGE_DIGEST` is not set inside the container.
    ErrImageDigestMissing,
    /// Reported image digest does not match the pinned digest.
    ErrRegistryMismatch,
    /// The local health gate timed out.
    ErrHealth,
    /// Transport failure connecting or reading.
    ErrNetwork,
    /// Envelope shape invalid.
    ErrBadResponse,
    /// A planned PUT URL is absent for a required output.
    ErrUploadPlan,
    /// PUT to object storage failed after retries.
    ErrUpload,
    /// Tool's downstream provider failed.
    ErrProvider,
    /// Cancel flag observed; clean cooperative exit.
    ErrPreempted,
    /// Uncaught failure inside tool code.
    ErrRuntime,
    /// Missing execution id, bad frame, or unsupported content.
    ErrInputs,
}

impl ErrorCode {
    /// Stable wire string, e.g. `"ERR_UNKNOWN_REF"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrUnknownRef => "ERR_UNKNOWN_REF",
            Self::ErrRegistry => "ERR_REGISTRY",
            Self::ErrPrefixTemplate => "ERR_PREFIX_TEMPLATE",
            Self::ErrMissingSecret => "ERR_MISSING_SECRET",
            Self::ErrImageDigestMissing => "ERR_IMAGE_DIGEST_MISSING",
            Self::ErrRegistryMismatch => "ERR_REGISTRY_MISMATCH",
            Self::ErrHealth => "ERR_HEALTH",
            Self::ErrNetwork => "ERR_NETWORK",
            Self::ErrBadResponse => "ERR_BAD_RESPONSE",
            Self::ErrUploadPlan => "ERR_UPLOAD_PLAN",
            Self::ErrUpload => "ERR_UPLOAD",
            Self::ErrProvider => "ERR_PROVIDER",
            Self::ErrPreempted => "ERR_PREEMPTED",
            Self::ErrRuntime => "ERR_RUNTIME",
            Self::ErrInputs => "ERR_INPUTS",
        }
    }

    /// Parse a wire string back into a code. Unknown codes return `None`;
    /// tools may surface provider-specific `ERR_*` strings we do not model.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ERR_UNKNOWN_REF" => Self::ErrUnknownRef,
            "ERR_REGISTRY" => Self::ErrRegistry,
            "ERR_PREFIX_TEMPLATE" => Self::ErrPrefixTemplate,
            "ERR_MISSING_SECRET" => Self::ErrMissingSecret,
            "ERR_IMAGE_DIGEST_MISSING" => Self::ErrImageDigestMissing,
            "ERR_REGISTRY_MISMATCH" => Self::ErrRegistryMismatch,
            "ERR_HEALTH" => Self::ErrHealth,
            "ERR_NETWORK" => Self::ErrNetwork,
            "ERR_BAD_RESPONSE" => Self::ErrBadResponse,
            "ERR_UPLOAD_PLAN" => Self::ErrUploadPlan,
            "ERR_UPLOAD" => Self::ErrUpload,
            "ERR_PROVIDER" => Self::ErrProvider,
            "ERR_PREEMPTED" => Self::ErrPreempted,
            "ERR_RUNTIME" => Self::ErrRuntime,
            "ERR_INPUTS" => Self::ErrInputs,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns `true` if `code` is syntactically a valid error code string.
///
/// Tool code may emit codes outside the catalog, but every code must carry
/// the `ERR_` prefix.
#[must_use]
pub fn is_error_code(code: &str) -> bool {
    code.starts_with("ERR_") && code.len() > 4
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[ErrorCode] = &[
        ErrorCode::ErrUnknownRef,
        ErrorCode::ErrRegistry,
        ErrorCode::ErrPrefixTemplate,
        ErrorCode::ErrMissingSecret,
        ErrorCode::ErrImageDigestMissing,
        ErrorCode::ErrRegistryMismatch,
        ErrorCode::ErrHealth,
        ErrorCode::ErrNetwork,
        ErrorCode::ErrBadResponse,
        ErrorCode::ErrUploadPlan,
        ErrorCode::ErrUpload,
        ErrorCode::ErrProvider,
        ErrorCode::ErrPreempted,
        ErrorCode::ErrRuntime,
        ErrorCode::ErrInputs,
    ];

    #[test]
    fn as_str_parse_roundtrip() {
        for code in ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(*code));
            assert!(is_error_code(code.as_str()));
        }
    }

    #[test]
    fn serde_matches_as_str() {
        for code in ALL {
            let json = serde_json::to_string(code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn unknown_codes_tolerated() {
        assert_eq!(ErrorCode::parse("ERR_SOMETHING_CUSTOM"), None);
        assert!(is_error_code("ERR_SOMETHING_CUSTOM"));
        assert!(!is_error_code("NOT_AN_ERROR"));
        assert!(!is_error_code("ERR_"));
    }
}
