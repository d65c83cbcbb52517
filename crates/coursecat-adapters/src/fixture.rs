use std::path::PathBuf;

use async_trait::async_trait;
use coursecat_core::RecordEnvelope;
use tokio::fs;

use crate::{ExtractionError, PageExtractor, PageTarget};

/// Replays previously extracted envelopes stored as one JSON file per course page.
#[derive(Debug, Clone)]
pub struct FixtureExtractor {
    name: String,
    dir: PathBuf,
}

impl FixtureExtractor {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl PageExtractor for FixtureExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn targets(&self) -> Result<Vec<PageTarget>, ExtractionError> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            ExtractionError::Fatal(format!("reading {}: {e}", self.dir.display()))
        })?;

        let mut targets = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ExtractionError::Fatal(format!("listing {}: {e}", self.dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            targets.push(PageTarget {
                id,
                location: path.display().to_string(),
            });
        }
        targets.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(targets)
    }

    async fn extract(&self, target: &PageTarget) -> Result<RecordEnvelope, ExtractionError> {
        let data = match fs::read_to_string(&target.location).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExtractionError::NotFound(target.location.clone()))
            }
            Err(err) => {
                return Err(ExtractionError::Malformed {
                    target: target.location.clone(),
                    reason: err.to_string(),
                })
            }
        };
        serde_json::from_str(&data).map_err(|e| ExtractionError::Malformed {
            target: target.location.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn lists_json_files_in_name_order() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b.json"), r#"{"code":"200"}"#).expect("b");
        std::fs::write(dir.path().join("a.json"), r#"{"code":"100","name":"X"}"#).expect("a");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("txt");

        let extractor = FixtureExtractor::new("fixtures", dir.path());
        let targets = extractor.targets().await.expect("targets");
        let ids: Vec<_> = targets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let env = extractor.extract(&targets[0]).await.expect("extract");
        assert_eq!(env.code, "100");
        assert_eq!(env.credits, "");
    }

    #[tokio::test]
    async fn broken_json_is_malformed_and_missing_dir_is_fatal() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("bad.json"), "{not json").expect("bad");
        let extractor = FixtureExtractor::new("fixtures", dir.path());
        let targets = extractor.targets().await.expect("targets");
        let err = extractor.extract(&targets[0]).await.expect_err("malformed");
        assert!(matches!(err, ExtractionError::Malformed { .. }));

        let missing = FixtureExtractor::new("missing", dir.path().join("nope"));
        assert!(missing.targets().await.expect_err("fatal").is_fatal());
    }
}
