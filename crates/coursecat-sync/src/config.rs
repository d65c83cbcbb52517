use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use coursecat_core::{PlaceholderFilter, DEFAULT_PLACEHOLDERS};
use serde::Deserialize;

use crate::service::ServiceConfig;

pub const DEFAULT_DATA_DIR: &str = "Data";
pub const DEFAULT_PARTITION_PREFIX: &str = "Facultad_";
pub const REGISTRY_FILE_NAME: &str = "faculties.yaml";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub idle_flush_secs: u64,
    pub lock_timeout_secs: u64,
    /// Records buffered per partition before a flush; 1 means write-through.
    pub flush_batch: usize,
    pub channel_capacity: usize,
    pub partition_prefix: String,
    pub placeholders: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            workspace_root: PathBuf::from("."),
            idle_flush_secs: 5,
            lock_timeout_secs: 30,
            flush_batch: 1,
            channel_capacity: 1024,
            partition_prefix: DEFAULT_PARTITION_PREFIX.to_string(),
            placeholders: DEFAULT_PLACEHOLDERS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("COURSECAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            workspace_root: std::env::var("COURSECAT_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            idle_flush_secs: env_parse("COURSECAT_IDLE_FLUSH_SECS")
                .unwrap_or(defaults.idle_flush_secs),
            lock_timeout_secs: env_parse("COURSECAT_LOCK_TIMEOUT_SECS")
                .unwrap_or(defaults.lock_timeout_secs),
            flush_batch: env_parse("COURSECAT_FLUSH_BATCH").unwrap_or(defaults.flush_batch),
            channel_capacity: env_parse("COURSECAT_CHANNEL_CAPACITY")
                .unwrap_or(defaults.channel_capacity),
            partition_prefix: std::env::var("COURSECAT_PARTITION_PREFIX")
                .unwrap_or(defaults.partition_prefix),
            placeholders: std::env::var("COURSECAT_PLACEHOLDERS")
                .map(|v| {
                    v.split('|')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.placeholders),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            data_dir: self.data_dir.clone(),
            idle_flush: Duration::from_secs(self.idle_flush_secs.max(1)),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            flush_batch: self.flush_batch.max(1),
            channel_capacity: self.channel_capacity.max(1),
            placeholders: PlaceholderFilter::new(&self.placeholders),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(REGISTRY_FILE_NAME)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacultyRegistry {
    pub faculties: Vec<FacultyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacultyConfig {
    pub faculty_id: String,
    pub display_name: String,
    /// Directory name of this faculty's partition under the data dir.
    pub partition: String,
    pub enabled: bool,
    /// Directory of extracted envelopes, relative to the workspace root.
    #[serde(default)]
    pub fixtures: Option<PathBuf>,
    #[serde(default)]
    pub programs: Vec<String>,
}

impl FacultyRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &FacultyConfig> {
        self.faculties.iter().filter(|f| f.enabled)
    }
}

pub fn load_faculty_registry(path: &Path) -> Result<FacultyRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
