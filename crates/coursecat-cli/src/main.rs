use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use coursecat_core::EntityKind;
use coursecat_storage::PartitionStore;
use coursecat_sync::{
    discover_partitions, load_faculty_registry, replay_messages, run_ingest, unify_all,
    ServiceReport, SyncConfig, WriteMode,
};
use tokio::io::BufReader;
use tracing::{error, warn};

#[derive(Debug, Parser)]
#[command(name = "coursecat")]
#[command(about = "Course catalog ingestion, dedup and unification")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one producer per enabled faculty and persist its partition.
    Ingest {
        /// Workspace holding faculties.yaml and the fixture directories.
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Records buffered per partition before a flush.
        #[arg(long)]
        flush_batch: Option<usize>,
        /// Let each producer write its own partition instead of routing through the service.
        #[arg(long)]
        direct: bool,
    },
    /// Feed a JSON-lines stream of service messages through the aggregation service.
    Replay {
        input: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Merge every partition into the unified datasets.
    Unify {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// List partitions and their row counts.
    Partitions {
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => concat!(
            "coursecat_cli=info,coursecat_sync=info,",
            "coursecat_storage=info,coursecat_adapters=info"
        ),
        1 => concat!(
            "coursecat_cli=debug,coursecat_sync=debug,",
            "coursecat_storage=debug,coursecat_adapters=debug"
        ),
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest {
        workspace: None,
        data_dir: None,
        flush_batch: None,
        direct: false,
    }) {
        Commands::Ingest {
            workspace,
            data_dir,
            flush_batch,
            direct,
        } => {
            if let Some(workspace) = workspace {
                config.workspace_root = workspace;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(flush_batch) = flush_batch {
                config.flush_batch = flush_batch;
            }
            let registry = load_faculty_registry(&config.registry_path())?;
            let mode = if direct { WriteMode::Direct } else { WriteMode::Service };
            let summary = run_ingest(&config, &registry, mode).await?;

            let aborted = summary.producers.iter().filter(|p| p.aborted).count();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if aborted > 0 {
                warn!(aborted, "some producers stopped early");
            }
            if summary
                .service
                .as_ref()
                .is_some_and(|report| !report.unflushed_partitions.is_empty())
            {
                anyhow::bail!("service stopped with unflushed partitions");
            }
            let unflushed: usize = summary.producers.iter().map(|p| p.unflushed_rows).sum();
            if unflushed > 0 {
                anyhow::bail!("{unflushed} rows could not be persisted by direct-write producers");
            }
        }
        Commands::Replay { input, data_dir } => {
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            let report = replay(&config, &input).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Unify { root, prefix } => {
            let root = root.unwrap_or(config.data_dir);
            let prefix = prefix.unwrap_or(config.partition_prefix);
            let manifest = unify_all(&root, &prefix).await?;
            for file in &manifest.files {
                println!(
                    "{}: {} rows from {} partitions -> {}",
                    file.entity,
                    file.rows_written,
                    file.partitions_read,
                    file.output.display()
                );
            }
        }
        Commands::Partitions { root } => {
            let root = root.unwrap_or(config.data_dir);
            for dir in discover_partitions(&root, &config.partition_prefix).await? {
                let store = PartitionStore::new(&dir);
                let counts = [
                    (EntityKind::Course, store.load_courses().await?.len()),
                    (EntityKind::CourseProgram, store.load_course_programs().await?.len()),
                    (EntityKind::Schedule, store.load_schedules().await?.len()),
                    (EntityKind::Prerequisite, store.load_prerequisites().await?.len()),
                ];
                let rendered: Vec<String> = counts
                    .iter()
                    .map(|(kind, n)| format!("{}={n}", kind.stem()))
                    .collect();
                println!("{} {}", dir.display(), rendered.join(" "));
            }
        }
    }

    Ok(())
}

async fn replay(config: &SyncConfig, input: &Path) -> Result<ServiceReport> {
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    replay_messages(config.service_config(), BufReader::new(file)).await
}
