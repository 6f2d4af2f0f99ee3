//! Cache keys.

use std::fmt;

use cinder_invocation::Inputs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Failed to compute a fingerprint.
#[derive(Debug, thiserror::Error)]
#[error("failed to fingerprint '{kind}' invocation: {source}")]
pub struct FingerprintError {
  pub kind: String,
  #[source]
  pub source: serde_json::Error,
}

/// Deterministic key for an invocation: `sha256:` + hex digest of the kind and
/// its canonicalized inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct FingerprintBasis<'a> {
  kind: &'a str,
  inputs: serde_json::Map<String, serde_json::Value>,
}

impl Fingerprint {
  /// Compute the fingerprint of `kind` applied to `inputs`.
  ///
  /// Fields listed in `exempt` are left out. Object keys are sorted at every
  /// depth, so structurally equal inputs always hash the same regardless of
  /// how they were built.
  pub fn compute(kind: &str, inputs: &Inputs, exempt: &[String]) -> Result<Self, FingerprintError> {
    let inputs = inputs
      .iter()
      .filter(|(field, _)| !exempt.iter().any(|e| e == *field))
      .map(|(field, value)| (field.clone(), canonicalize(value)))
      .collect();

    let bytes = serde_json::to_vec(&FingerprintBasis { kind, inputs }).map_err(|source| {
      FingerprintError {
        kind: kind.to_string(),
        source,
      }
    })?;

    let digest = Sha256::digest(&bytes);
    Ok(Self(format!("sha256:{:x}", digest)))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
  match value {
    serde_json::Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let sorted = keys
        .into_iter()
        .map(|k| (k.clone(), canonicalize(&map[k])))
        .collect();
      serde_json::Value::Object(sorted)
    }
    serde_json::Value::Array(items) => {
      serde_json::Value::Array(items.iter().map(canonicalize).collect())
    }
    other => other.clone(),
  }
}
