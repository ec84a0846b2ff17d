// SPDX-License-Identifier: MIT OR Apache-2.0
//! Input hydration: `world://` references become presigned GET URLs.
//!
//! Strings of the form `world://<world>/<run>/<path>` are rewritten so the
//! processor can download without touching the orchestrator. References
//! carrying `?data=` are scalar artifacts and pass through untouched; a
//! reference to a different world is rejected outright.

use serde_json::Value;
use std::time::Duration;
use theory_presign::Presigner;

/// Scheme prefix of world references.
pub const WORLD_SCHEME: &str = "world://";

/// Hydration failures. Surface as `ERR_INPUTS`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HydrateError {
    /// The reference does not split into world/run/path.
    #[error("invalid world reference: {0:?}")]
    Malformed(String),
    /// The reference points at a different world.
    #[error("inputs may only reference world {expected:?}, got {reference:?}")]
    ForeignWorld {
        /// The offending reference.
        reference: String,
        /// The world this run belongs to.
        expected: String,
    },
    /// Presigning the GET failed.
    #[error("could not presign {0:?}: {1}")]
    Presign(String, String),
}

/// Recursively rewrite `world://` strings inside `inputs`.
///
/// # Errors
///
/// Returns the first [`HydrateError`] encountered; inputs are otherwise
/// returned unchanged in structure.
pub fn hydrate_inputs(
    inputs: &Value,
    world: &str,
    bucket: &str,
    presigner: &Presigner,
    ttl: Duration,
) -> Result<Value, HydrateError> {
    match inputs {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(
                    key.clone(),
                    hydrate_inputs(value, world, bucket, presigner, ttl)?,
                );
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| hydrate_inputs(item, world, bucket, presigner, ttl))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::String(s) if s.starts_with(WORLD_SCHEME) => {
            // Scalar references are resolved by the protocol layer.
            if s.contains("?data=") {
                return Ok(inputs.clone());
            }
            let rest = &s[WORLD_SCHEME.len()..];
            let mut parts = rest.splitn(3, '/');
            let (uri_world, run, path) = match (parts.next(), parts.next(), parts.next()) {
                (Some(w), Some(r), Some(p)) if !w.is_empty() && !r.is_empty() && !p.is_empty() => {
                    (w, r, p)
                }
                _ => return Err(HydrateError::Malformed(s.clone())),
            };
            if uri_world != world {
                return Err(HydrateError::ForeignWorld {
                    reference: s.clone(),
                    expected: world.to_string(),
                });
            }
            let key = format!("{uri_world}/{run}/{path}");
            presigner
                .get_url(bucket, &key, ttl)
                .map(Value::String)
                .map_err(|e| HydrateError::Presign(s.clone(), e.to_string()))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn presigner() -> Presigner {
        Presigner::new("http://127.0.0.1:9000", "secret")
    }

    #[test]
    fn plain_values_pass_through() {
        let inputs = json!({"a": 1, "b": ["x", true], "c": {"d": null}});
        let out =
            hydrate_inputs(&inputs, "w1", "outputs", &presigner(), Duration::from_secs(60))
                .unwrap();
        assert_eq!(out, inputs);
    }

    #[test]
    fn world_refs_become_signed_urls() {
        let inputs = json!({"image": "world://w1/run-9/outputs/img/cat.png"});
        let out =
            hydrate_inputs(&inputs, "w1", "outputs", &presigner(), Duration::from_secs(60))
                .unwrap();
        let url = out["image"].as_str().unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/outputs/w1/run-9/outputs/img/cat.png?"));
        assert!(url.contains("x-sig="));
    }

    #[test]
    fn scalar_data_refs_pass_through() {
        let inputs = json!({"seed": "world://w1/run-9/seed?data=42"});
        let out =
            hydrate_inputs(&inputs, "w1", "outputs", &presigner(), Duration::from_secs(60))
                .unwrap();
        assert_eq!(out, inputs);
    }

    #[test]
    fn foreign_world_rejected() {
        let inputs = json!(["world://other/run-1/file"]);
        let err =
            hydrate_inputs(&inputs, "w1", "outputs", &presigner(), Duration::from_secs(60))
                .unwrap_err();
        assert!(matches!(err, HydrateError::ForeignWorld { .. }));
    }

    #[test]
    fn malformed_refs_rejected() {
        for bad in ["world://", "world://w1", "world://w1/run-only"] {
            let err = hydrate_inputs(
                &json!(bad),
                "w1",
                "outputs",
                &presigner(),
                Duration::from_secs(60),
            )
            .unwrap_err();
            assert!(matches!(err, HydrateError::Malformed(_)), "{bad}");
        }
    }

    #[test]
    fn nested_structures_are_walked() {
        let inputs = json!({"params": {"images": ["world://w1/r/outputs/a.png"]}});
        let out =
            hydrate_inputs(&inputs, "w1", "outputs", &presigner(), Duration::from_secs(60))
                .unwrap();
        assert!(out["params"]["images"][0].as_str().unwrap().contains("x-sig="));
    }
}
