//! Identifier derivation: attempt keys, sub-run ids, namespace directories

use crate::error::{Error, Result};
use fnv::FnvHasher;
use sha2::{Digest, Sha256};
use std::hash::Hasher;
use std::path::{Path, PathBuf};

/// Globally unique attempt identifier.
///
/// `hex(FNV1a64(root_name ∥ \0 ∥ root_id ∥ \0 ∥ dag_name ∥ \0 ∥ dag_run_id)) ":" attempt_id`
/// — stable across restarts and used for cross-process cancellation tracking.
pub fn generate_attempt_key(
    root_name: &str,
    root_id: &str,
    dag_name: &str,
    dag_run_id: &str,
    attempt_id: &str,
) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(root_name.as_bytes());
    hasher.write(&[0]);
    hasher.write(root_id.as_bytes());
    hasher.write(&[0]);
    hasher.write(dag_name.as_bytes());
    hasher.write(&[0]);
    hasher.write(dag_run_id.as_bytes());
    format!("{:016x}:{}", hasher.finish(), attempt_id)
}

/// Deterministic child dag-run id for a sub-DAG spawn.
///
/// `base58(SHA256(parent_run_id ∥ step_name ∥ params ∥ nonce))`; the nonce is
/// empty for a first-time spawn and fresh random bytes for repeated spawns.
pub fn sub_run_id(parent_run_id: &str, step_name: &str, params: &str, nonce: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_run_id.as_bytes());
    hasher.update(step_name.as_bytes());
    hasher.update(params.as_bytes());
    hasher.update(nonce);
    bs58::encode(hasher.finalize()).into_string()
}

/// 4-char hex prefix of `SHA256(name)` identifying a namespace directory
pub fn namespace_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..2])
}

/// `base_dir/ns/{namespace_id}` for the given namespace name
pub fn namespace_dir(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join("ns").join(namespace_id(name))
}

/// Derive a canonical DAG name from a file path or raw name.
///
/// The name is the file stem; permitted characters are alphanumerics plus
/// `_`, `-` and `.`.
pub fn canonical_dag_name(path_or_name: &str) -> Result<String> {
    let stem = Path::new(path_or_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    if stem.is_empty() {
        return Err(Error::InvalidDagName(path_or_name.to_string()));
    }
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(Error::InvalidDagName(path_or_name.to_string()));
    }
    Ok(stem.to_string())
}

/// Replace filesystem-hostile characters so a ref can appear in a file name
pub fn sanitize_for_filename(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
