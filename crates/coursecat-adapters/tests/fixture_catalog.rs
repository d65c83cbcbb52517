use std::path::PathBuf;

use coursecat_adapters::{FixtureExtractor, PageExtractor};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn checked_in_fixtures_extract_cleanly() {
    for faculty in ["arquitectura", "minas"] {
        let extractor = FixtureExtractor::new(faculty, fixtures_root().join(faculty));
        let targets = extractor.targets().await.expect("targets");
        assert!(!targets.is_empty(), "{faculty} has no fixtures");
        for target in &targets {
            let envelope = extractor.extract(target).await.expect("envelope");
            assert!(!envelope.program.is_empty(), "{} has no program", target.id);
        }
    }
}

#[tokio::test]
async fn fixture_targets_are_sorted() {
    let extractor = FixtureExtractor::new("minas", fixtures_root().join("minas"));
    let ids: Vec<String> = extractor
        .targets()
        .await
        .expect("targets")
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec!["3515_001", "3515_002", "3516_001"]);
}
