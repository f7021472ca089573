use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Writes `value` to `path` via temp-then-rename so readers never observe
/// a partially-written file. Readers that race a concurrent write should
/// tolerate a momentarily-missing target and retry (§5 shared-resource
/// policy).
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub async fn read_json_file<T: DeserializeOwned + Default>(path: &Path) -> T {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Serialize, Deserialize, Default, PartialEq, Debug)]
    struct Payload {
        value: u32,
    }

    #[tokio::test]
    async fn atomic_write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data.json");
        atomic_write_json(&path, &Payload { value: 7 }).await.unwrap();
        let read: Payload = read_json_file(&path).await;
        assert_eq!(read, Payload { value: 7 });
    }

    #[tokio::test]
    async fn missing_file_reads_as_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        let read: Payload = read_json_file(&path).await;
        assert_eq!(read, Payload::default());
    }
}
