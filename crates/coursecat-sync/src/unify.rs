//! Offline cross-partition unification.
//!
//! Runs with no producers active and takes no lock. Partition order is fixed by the
//! caller, which makes the output byte-identical across repeated runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use coursecat_core::EntityKind;
use coursecat_storage::{encode_rows, parse_table, sha256_hex, write_atomic, Table};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

pub const MANIFEST_FILE_NAME: &str = "unified_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupMode {
    /// Keep the first row per non-empty value of this column; raw values are written.
    ByKey(String),
    /// Keep the first row per trimmed tuple of all columns; trimmed values are written.
    ByFullRow,
}

impl DedupMode {
    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Course => DedupMode::ByKey("code".to_string()),
            _ => DedupMode::ByFullRow,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnifyOutcome {
    pub entity: String,
    pub output: PathBuf,
    pub partitions_read: usize,
    pub partitions_missing: usize,
    pub rows_written: usize,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnifyManifest {
    pub partitions: Vec<String>,
    pub files: Vec<UnifyOutcome>,
}

/// Partition directories under `root` whose names start with `prefix`, sorted by name.
pub async fn discover_partitions(root: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(root)
        .await
        .with_context(|| format!("reading {}", root.display()))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", root.display()))?
    {
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        // Follows symlinks, so a linked partition directory counts.
        let is_dir = fs::metadata(entry.path()).await.map(|m| m.is_dir()).unwrap_or(false);
        if is_dir {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Deduplicate already-parsed partition tables, in order.
pub fn dedup_tables(tables: &[Table], mode: &DedupMode) -> Table {
    let header: Option<Vec<String>> = tables
        .iter()
        .find(|t| !t.header.is_empty())
        .map(|t| t.header.clone());

    match mode {
        DedupMode::ByKey(column) => {
            let header = header.unwrap_or_else(|| vec![column.clone()]);
            let mut seen: HashSet<String> = HashSet::new();
            let mut rows = Vec::new();
            for table in tables {
                let Some(key_idx) = table.column(column) else {
                    continue;
                };
                let projected = table.project(&header);
                for (raw, row) in table.rows.iter().zip(projected) {
                    let key = raw.get(key_idx).map(|k| k.trim()).unwrap_or_default();
                    if key.is_empty() || seen.contains(key) {
                        continue;
                    }
                    seen.insert(key.to_string());
                    rows.push(row);
                }
            }
            Table { header, rows }
        }
        DedupMode::ByFullRow => {
            let header = header.unwrap_or_default();
            let mut seen: HashSet<Vec<String>> = HashSet::new();
            let mut rows = Vec::new();
            for table in tables {
                for row in table.project(&header) {
                    let normalized: Vec<String> =
                        row.iter().map(|c| c.trim().to_string()).collect();
                    if seen.insert(normalized.clone()) {
                        rows.push(normalized);
                    }
                }
            }
            Table { header, rows }
        }
    }
}

/// Unify one entity across `partitions` into `output`.
pub async fn unify(
    partitions: &[PathBuf],
    kind: EntityKind,
    mode: &DedupMode,
    output: &Path,
) -> Result<UnifyOutcome> {
    let mut tables = Vec::with_capacity(partitions.len());
    let mut missing = 0usize;

    for partition in partitions {
        let path = partition.join(kind.file_name());
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "partition file not found; contributing no rows");
                missing += 1;
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let table = parse_table(&path, &bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        tables.push(table);
    }

    let unified = dedup_tables(&tables, mode);
    let bytes = if unified.header.is_empty() {
        Vec::new()
    } else {
        encode_rows(&unified.header, unified.rows.iter().cloned())
            .with_context(|| format!("encoding {}", output.display()))?
    };
    write_atomic(output, &bytes)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    info!(
        entity = %kind,
        rows = unified.rows.len(),
        output = %output.display(),
        "unified dataset written"
    );
    Ok(UnifyOutcome {
        entity: kind.stem().to_string(),
        output: output.to_path_buf(),
        partitions_read: tables.len(),
        partitions_missing: missing,
        rows_written: unified.rows.len(),
        bytes: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
    })
}

/// Discover partitions under `root`, unify all four entities and write the manifest.
pub async fn unify_all(root: &Path, prefix: &str) -> Result<UnifyManifest> {
    let partitions = discover_partitions(root, prefix).await?;
    info!(
        root = %root.display(),
        count = partitions.len(),
        "unifying partitions"
    );

    let mut files = Vec::with_capacity(EntityKind::ALL.len());
    for kind in EntityKind::ALL {
        let output = root.join(kind.unified_file_name());
        files.push(unify(&partitions, kind, &DedupMode::for_kind(kind), &output).await?);
    }

    let manifest = UnifyManifest {
        partitions: partitions
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            })
            .collect(),
        files,
    };
    let manifest_path = root.join(MANIFEST_FILE_NAME);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing unify manifest")?;
    write_atomic(&manifest_path, &bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}
