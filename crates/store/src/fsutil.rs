//! Atomic file primitives shared by the file-backed stores

use dagflow_common::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

/// Write JSON atomically: serialize, write a temp file in the same
/// directory, then rename over the target. Observers see either the pre- or
/// post-image, never a partial file.
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        Uuid::new_v4().simple()
    ));
    tokio::fs::write(&tmp, &data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read and parse a JSON file; a parse failure surfaces as
/// [`Error::CorruptedStatusFile`] so callers can decide to degrade or fail.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data).map_err(|e| Error::CorruptedStatusFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// True when the path exists
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Materialize a namespace directory, failing fatally when another
/// namespace name already claimed the same hash prefix.
pub async fn ensure_namespace_dir(
    base_dir: &Path,
    name: &str,
) -> Result<std::path::PathBuf> {
    let dir = dagflow_common::keys::namespace_dir(base_dir, name);
    let marker = dir.join(".name");

    if exists(&marker).await {
        let existing = tokio::fs::read_to_string(&marker).await?;
        if existing != name {
            return Err(Error::NamespaceHashCollision {
                name: name.to_string(),
                existing,
            });
        }
        return Ok(dir);
    }

    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(&marker, name).await?;
    Ok(dir)
}

/// Sorted names of subdirectories matching a prefix
pub async fn sorted_dirs_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(prefix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
