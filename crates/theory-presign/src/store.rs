// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dev object store.
//!
//! A minimal S3-shaped store that honors the URLs minted by
//! [`Presigner`](crate::Presigner): `PUT /{bucket}/{key}` uploads,
//! `GET /{bucket}/{key}` downloads, both gated on the signature query
//! parameters. Objects live in memory. Tests and zero-config local runs
//! use it; production points at a real endpoint.

use crate::{SignedMethod, verify_signature};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One stored object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// Content type the object was uploaded with, when bound.
    pub content_type: Option<String>,
}

/// Shared in-memory object map keyed by `bucket/key`.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl ObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch an object by `bucket` and `key`.
    #[must_use]
    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let key = key.trim_start_matches('/');
        self.objects
            .lock()
            .expect("object store lock poisoned")
            .get(&format!("{bucket}/{key}"))
            .cloned()
    }

    /// Returns `true` if an object exists.
    #[must_use]
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.get(bucket, key).is_some()
    }

    /// All keys in `bucket`, sorted.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let prefix = format!("{bucket}/");
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .expect("object store lock poisoned")
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
            .collect();
        keys.sort();
        keys
    }

    fn insert(&self, bucket: &str, key: &str, object: StoredObject) {
        self.objects
            .lock()
            .expect("object store lock poisoned")
            .insert(format!("{bucket}/{key}"), object);
    }
}

#[derive(Clone)]
struct StoreState {
    secret: String,
    store: ObjectStore,
}

#[derive(Debug, Deserialize)]
struct SigQuery {
    #[serde(rename = "x-exp")]
    exp: u64,
    #[serde(rename = "x-sig")]
    sig: String,
    #[serde(rename = "x-ct", default)]
    ct: Option<String>,
}

/// Build the dev store router over `store`, verifying signatures with
/// `secret`.
pub fn build_router(secret: impl Into<String>, store: ObjectStore) -> Router {
    let state = StoreState {
        secret: secret.into(),
        store,
    };
    Router::new()
        .route("/{bucket}/{*key}", put(put_object).get(get_object))
        .with_state(state)
}

/// Serve the dev store on an ephemeral local port. Returns the bound
/// address; the server runs until the process exits.
///
/// # Errors
///
/// Returns the bind error when the listener cannot be created.
pub async fn serve_ephemeral(
    secret: impl Into<String>,
    store: ObjectStore,
) -> std::io::Result<SocketAddr> {
    let app = build_router(secret, store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

async fn put_object(
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<SigQuery>,
    State(state): State<StoreState>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> StatusCode {
    let bound_ct = q.ct.as_deref().map(|c| c.replace("%2F", "/"));
    if !verify_signature(
        &state.secret,
        SignedMethod::Put,
        &bucket,
        &key,
        q.exp,
        bound_ct.as_deref().unwrap_or(""),
        &q.sig,
    ) {
        return StatusCode::FORBIDDEN;
    }
    // A content-type bound into the signature must match the upload.
    if let Some(expected) = &bound_ct {
        let sent = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if sent != Some(expected.as_str()) {
            return StatusCode::FORBIDDEN;
        }
    }
    debug!(bucket = %bucket, key = %key, bytes = body.len(), "dev store put");
    state.store.insert(
        &bucket,
        &key,
        StoredObject {
            bytes: body.to_vec(),
            content_type: bound_ct,
        },
    );
    StatusCode::OK
}

async fn get_object(
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<SigQuery>,
    State(state): State<StoreState>,
) -> Result<Vec<u8>, (StatusCode, Json<serde_json::Value>)> {
    if !verify_signature(
        &state.secret,
        SignedMethod::Get,
        &bucket,
        &key,
        q.exp,
        "",
        &q.sig,
    ) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "bad signature"})),
        ));
    }
    match state.store.get(&bucket, &key) {
        Some(obj) => Ok(obj.bytes),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no such object"})),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Presigner;
    use std::time::Duration;

    async fn start() -> (Presigner, ObjectStore) {
        let store = ObjectStore::new();
        let addr = serve_ephemeral("test-secret", store.clone()).await.unwrap();
        (
            Presigner::new(format!("http://{addr}"), "test-secret"),
            store,
        )
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let (presigner, store) = start().await;
        let put = presigner
            .put_url(
                "outputs",
                "artifacts/t/a.txt",
                Duration::from_secs(60),
                Some("text/plain"),
            )
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .put(&put)
            .header("content-type", "text/plain")
            .body("hello")
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(store.get("outputs", "artifacts/t/a.txt").unwrap().bytes, b"hello");

        let get = presigner
            .get_url("outputs", "artifacts/t/a.txt", Duration::from_secs(60))
            .unwrap();
        let body = client.get(&get).send().await.unwrap().text().await.unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn tampered_signature_rejected() {
        let (presigner, _store) = start().await;
        let put = presigner
            .put_url("outputs", "artifacts/t/a.txt", Duration::from_secs(60), None)
            .unwrap();
        let tampered = put.replace("artifacts/t/a.txt", "artifacts/t/b.txt");

        let resp = reqwest::Client::new()
            .put(&tampered)
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn content_type_binding_enforced() {
        let (presigner, _store) = start().await;
        let put = presigner
            .put_url(
                "outputs",
                "artifacts/t/a.json",
                Duration::from_secs(60),
                Some("application/json"),
            )
            .unwrap();
        // Upload with the wrong content type.
        let resp = reqwest::Client::new()
            .put(&put)
            .header("content-type", "text/plain")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_object_is_404() {
        let (presigner, _store) = start().await;
        let get = presigner
            .get_url("outputs", "artifacts/none", Duration::from_secs(60))
            .unwrap();
        let resp = reqwest::Client::new().get(&get).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
