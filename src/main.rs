//! # Docket CLI (`docket`)
//!
//! Runs the archive's background tasks by hand: consuming files, retrying
//! quarantined failures, training the classifier, checking consistency,
//! and maintaining the trash and search index.
//!
//! ## Usage
//!
//! ```bash
//! docket --config ./config/docket.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docket init` | Create directories, the database, and run migrations |
//! | `docket consume <path>` | Consume one file into the archive |
//! | `docket retry <task-id>` | Retry a failed consume from quarantine |
//! | `docket train` | Train the classifier if its inputs changed |
//! | `docket sanity` | Check stored documents against their originals |
//! | `docket trash <id>` / `docket restore <id>` | Soft delete or restore a document |
//! | `docket empty-trash` | Remove trashed documents past the grace period |
//! | `docket index reindex\|optimize` | Maintain the full-text index |
//! | `docket tasks` | List recent tasks |
//! | `docket search "<query>"` | Search live documents |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docket::config;
use docket::models::{ConsumableDocument, ConsumeOverrides, DocumentSource};
use docket::progress::ProgressMode;
use docket::store::View;
use docket::tasks::{self, TaskContext};

/// Docket: background tasks for a document archive.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "docket", version, about = "Docket: background tasks for a document archive")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docket.toml")]
    config: PathBuf,

    /// Consume progress: `off`, `human`, or `json` (stderr).
    ///
    /// Defaults to `human` when stderr is a terminal, otherwise `off`.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create directories and the database schema. Idempotent.
    Init,

    /// Consume one file into the archive.
    ///
    /// On failure the task is marked failed and the file is moved into the
    /// quarantine directory, from where `docket retry` can pick it up.
    Consume {
        path: PathBuf,

        /// Where the file came from: `consume-folder`, `api-upload`, `mail-fetch`.
        #[arg(long, default_value = "consume-folder")]
        source: DocumentSource,

        /// Title for the new document instead of the file stem.
        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        correspondent: Option<i64>,

        #[arg(long)]
        document_type: Option<i64>,

        /// Tag ids to assign; repeatable.
        #[arg(long = "tag")]
        tags: Vec<i64>,
    },

    /// Retry a failed consume task from its quarantined file.
    Retry {
        task_id: String,

        /// Run the repairer over a working copy before consuming it again.
        #[arg(long)]
        clean: bool,
    },

    /// Train the classifier when documents or auto-matching rules changed.
    Train,

    /// Check stored documents against their originals.
    Sanity,

    /// Move a document to the trash.
    Trash { id: i64 },

    /// Restore a document from the trash.
    Restore { id: i64 },

    /// Permanently remove trashed documents past the grace period.
    EmptyTrash {
        /// Only consider these document ids; repeatable.
        #[arg(long = "id")]
        ids: Vec<i64>,

        /// Override `[trash] delay_days`.
        #[arg(long)]
        delay_days: Option<u64>,
    },

    /// Maintain the full-text index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// List recent tasks, newest first.
    Tasks {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Search live documents.
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index from the live documents.
    Reindex,
    /// Merge index segments.
    Optimize,
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(s).ok_or_else(|| format!("invalid progress mode '{}': use off, human, or json", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let ctx = TaskContext::open(cfg)
        .await?
        .with_progress(Arc::from(progress.reporter()));

    match cli.command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Consume {
            path,
            source,
            title,
            correspondent,
            document_type,
            tags,
        } => {
            let overrides = ConsumeOverrides {
                title,
                correspondent_id: correspondent,
                document_type_id: document_type,
                tag_ids: tags,
            };
            let doc = tasks::consume_file(&ctx, ConsumableDocument::new(source, path), overrides).await?;
            println!("Consumed as document {} ({})", doc.id, doc.title);
        }
        Commands::Retry { task_id, clean } => {
            let doc = tasks::retry_failed_file(&ctx, &task_id, clean).await?;
            println!("Retry succeeded: document {} ({})", doc.id, doc.title);
        }
        Commands::Train => {
            let outcome = tasks::train_classifier(&ctx).await?;
            println!("{}", outcome);
        }
        Commands::Sanity => {
            let text = tasks::sanity_check(&ctx).await?;
            println!("{}", text);
        }
        Commands::Trash { id } => {
            ctx.reaper().trash(id).await?;
            println!("Document {} moved to trash.", id);
        }
        Commands::Restore { id } => {
            ctx.reaper().restore(id).await?;
            println!("Document {} restored.", id);
        }
        Commands::EmptyTrash { ids, delay_days } => {
            let ids = (!ids.is_empty()).then_some(ids);
            let delay = delay_days
                .map(|d| {
                    config::delay_from_days(d)
                        .with_context(|| format!("--delay-days {} is out of range", d))
                })
                .transpose()?;
            let removed = tasks::empty_trash(&ctx, ids, delay).await?;
            println!("Removed {} document(s) from trash.", removed);
        }
        Commands::Index { action } => match action {
            IndexAction::Reindex => {
                let indexed = tasks::index_reindex(&ctx).await?;
                println!("Indexed {} document(s).", indexed);
            }
            IndexAction::Optimize => {
                tasks::index_optimize(&ctx).await?;
                println!("Index optimized.");
            }
        },
        Commands::Tasks { limit } => {
            for task in ctx.registry().list(limit).await? {
                println!(
                    "{}  {:<22} {:<10} {}  {}",
                    task.task_id,
                    task.task_name,
                    task.status,
                    task.task_file_name.as_deref().unwrap_or("-"),
                    task.result.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Search { query, limit } => {
            let ids = ctx
                .index()
                .search(&query, limit)
                .await
                .context("search failed")?;
            if ids.is_empty() {
                println!("No results.");
            }
            for id in ids {
                if let Some(doc) = ctx.store().get(id, View::Live).await? {
                    println!("{:>7}  {}", doc.id, doc.title);
                }
            }
        }
    }

    Ok(())
}
