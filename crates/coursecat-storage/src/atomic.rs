use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::StoreError;

/// Replace `path` with `bytes` via a sibling temp file and a rename.
///
/// Readers observe either the previous file or the complete new one. A failure at
/// any step removes the temp file and leaves the destination untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StoreError::io(&parent, e))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let result = write_then_rename(&temp_path, path, bytes).await;
    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|e| StoreError::io(temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io(temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(temp_path, e))?;
    drop(file);

    fs::rename(temp_path, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn replaces_content_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("Courses.csv");

        write_atomic(&path, b"code\n1\n").await.expect("first write");
        write_atomic(&path, b"code\n2\n").await.expect("second write");

        assert_eq!(std::fs::read(&path).expect("read"), b"code\n2\n");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn failed_rename_keeps_previous_version() {
        let dir = tempdir().expect("tempdir");
        // A directory at the destination makes the rename fail.
        let path = dir.path().join("Courses.csv");
        std::fs::create_dir(&path).expect("blocker dir");

        let err = write_atomic(&path, b"code\n1\n").await.expect_err("rename fails");
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(path.is_dir());
        let temp_count = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(temp_count, 0);
    }
}
