// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dual determinism receipts.
//!
//! One copy rides next to the outputs in object storage
//! (`<write_prefix>receipt.json`); a byte-identical copy lands on the
//! global execution-indexed filesystem path
//! (`<base>/execution/<execution_id>/determinism.json`). Receipts are
//! best-effort: a failed write is logged, never fatal to the run.

use std::path::{Path, PathBuf};
use std::time::Duration;
use theory_core::receipt::Receipt;
use theory_presign::Presigner;
use tracing::{debug, warn};

/// File name of the local (co-located) receipt copy.
pub const LOCAL_RECEIPT_NAME: &str = "receipt.json";

/// Resolve the global receipt base: `ARTIFACTS_BASE_DIR`, else
/// `$TMPDIR/artifacts`, else `/tmp/artifacts`.
#[must_use]
pub fn global_receipt_base() -> PathBuf {
    if let Ok(base) = std::env::var("ARTIFACTS_BASE_DIR")
        && !base.is_empty()
    {
        return PathBuf::from(base);
    }
    std::env::temp_dir().join("artifacts")
}

/// Where both copies went, and whether each write succeeded.
#[derive(Debug, Clone)]
pub struct ReceiptPaths {
    /// World path of the co-located copy.
    pub local_path: String,
    /// Filesystem path of the global copy.
    pub global_path: PathBuf,
    /// Whether the co-located upload succeeded.
    pub local_ok: bool,
    /// Whether the global write succeeded.
    pub global_ok: bool,
}

/// Write both receipt copies.
///
/// The local copy goes to object storage through a presigned PUT; the
/// global copy is a plain filesystem write. Neither failure propagates.
pub async fn write_dual_receipts(
    receipt: &Receipt,
    write_prefix: &str,
    bucket: &str,
    presigner: &Presigner,
    global_base: &Path,
) -> ReceiptPaths {
    let bytes = receipt.to_bytes().unwrap_or_default();
    let local_key = format!("{}{LOCAL_RECEIPT_NAME}", write_prefix.trim_start_matches('/'));
    let local_path = format!("{write_prefix}{LOCAL_RECEIPT_NAME}");
    let global_path = global_base
        .join("execution")
        .join(&receipt.execution_id)
        .join("determinism.json");

    let local_ok = match presigner.put_url(
        bucket,
        &local_key,
        Duration::from_secs(120),
        Some("application/json"),
    ) {
        Ok(url) => {
            put_json(&url, bytes.clone()).await.is_ok()
        }
        Err(err) => {
            warn!(error = %err, "could not presign local receipt");
            false
        }
    };
    if !local_ok {
        warn!(path = %local_path, "local receipt write failed");
    }

    let global_ok = write_global(&global_path, &bytes);
    if !global_ok {
        warn!(path = %global_path.display(), "global receipt write failed");
    }
    debug!(local = %local_path, global = %global_path.display(), local_ok, global_ok, "receipts written");

    ReceiptPaths {
        local_path,
        global_path,
        local_ok,
        global_ok,
    }
}

async fn put_json(url: &str, bytes: Vec<u8>) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .put(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(bytes)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", resp.status()))
    }
}

fn write_global(path: &Path, bytes: &[u8]) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    if std::fs::create_dir_all(parent).is_err() {
        return false;
    }
    std::fs::write(path, bytes).is_ok()
}
