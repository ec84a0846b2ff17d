// SPDX-License-Identifier: MIT OR Apache-2.0
//! Presigned PUT with bounded retry.

use std::time::Duration;
use tracing::warn;

/// Base delay of the retry backoff.
const RETRY_BASE: Duration = Duration::from_millis(200);
/// Backoff multiplier between attempts.
const RETRY_FACTOR: u32 = 2;
/// Total attempts for authorization failures.
const MAX_ATTEMPTS: u32 = 3;

/// Upload failures, split by who can fix them.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Authorization kept failing after every retry (`ERR_UPLOAD`).
    #[error("upload unauthorized after {attempts} attempts: HTTP {status}")]
    Unauthorized {
        /// Attempts made.
        attempts: u32,
        /// Final status code.
        status: u16,
    },
    /// Any other non-2xx status (`ERR_UPLOAD`, no retry).
    #[error("upload failed: HTTP {status}")]
    Status {
        /// The status code.
        status: u16,
    },
    /// Transport failure (`ERR_UPLOAD`).
    #[error("upload transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

/// PUT `bytes` to a presigned `url` with the given content type.
///
/// 401/403 responses are retried with exponential backoff (presigned URLs
/// can race clock skew); any other non-2xx is fatal on first sight.
///
/// # Errors
///
/// Returns [`UploadError`] when every attempt fails.
pub async fn put_bytes(
    client: &reqwest::Client,
    url: &str,
    bytes: Vec<u8>,
    content_type: &str,
) -> Result<(), UploadError> {
    let mut delay = RETRY_BASE;
    let mut last_status = 0u16;
    for attempt in 1..=MAX_ATTEMPTS {
        let resp = client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.clone())
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        last_status = status.as_u16();
        if !matches!(last_status, 401 | 403) {
            return Err(UploadError::Status {
                status: last_status,
            });
        }
        if attempt < MAX_ATTEMPTS {
            warn!(status = last_status, attempt, "presigned PUT unauthorized, retrying");
            tokio::time::sleep(delay).await;
            delay *= RETRY_FACTOR;
        }
    }
    Err(UploadError::Unauthorized {
        attempts: MAX_ATTEMPTS,
        status: last_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn success_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("content-type", "text/plain"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        put_bytes(&client, &server.uri(), b"hello".to_vec(), "text/plain")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retries_on_403_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .expect(3)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = put_bytes(&client, &server.uri(), b"x".to_vec(), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Unauthorized {
                attempts: 3,
                status: 403
            }
        ));
    }

    #[tokio::test]
    async fn non_auth_failure_is_fatal_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = put_bytes(&client, &server.uri(), b"x".to_vec(), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Status { status: 500 }));
    }
}
