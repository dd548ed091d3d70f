//! # Intel Notebook CLI (`notebook`)
//!
//! ## Usage
//!
//! ```bash
//! notebook --config ./config/notebook.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `notebook init` | Create the SQLite database and run schema migrations |
//! | `notebook actor add <name>` | Create a tracked actor profile |
//! | `notebook actor list` | List actor profiles |
//! | `notebook ingest <actor> <url> --file <path>` | Upsert one source |
//! | `notebook evidence <actor>` | Print ranked evidence |
//! | `notebook sync <actor> <collection-url>` | Sync one TAXII collection window |
//! | `notebook runs <actor>` | Sync run history |
//! | `notebook jobs <actor>` | Active generation job and recent phases |
//! | `notebook recover` | One stale-generation recovery sweep |
//! | `notebook serve` | Start the HTTP server and auto-refresh loop |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use intel_notebook::evidence::EvidenceFilter;
use intel_notebook::ingest::IngestArgs;
use intel_notebook::{actors, collection_sync, config, evidence, ingest, journal, migrate, scheduler, server};

/// Intel Notebook: deduplicated, ranked evidence about tracked threat actors.
#[derive(Parser)]
#[command(name = "notebook", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/notebook.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent. The scoring tables are only created when
    /// `[ranking].provision_scoring_tables` is true.
    Init,

    /// Manage actor profiles.
    Actor {
        #[command(subcommand)]
        action: ActorAction,
    },

    /// Upsert one source for an actor, reading the body from a file.
    ///
    /// A source already stored under the same URL or with the same
    /// content fingerprint is merged instead of duplicated.
    Ingest {
        actor: String,
        url: String,
        /// File holding the source text.
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        source_name: Option<String>,
        /// Publication timestamp (RFC 3339, RFC 2822, or a date).
        #[arg(long)]
        published_at: Option<String>,
        /// Replace the stored body and metadata instead of filling blanks.
        #[arg(long)]
        refresh: bool,
    },

    /// Print an actor's ranked evidence.
    Evidence {
        actor: String,
        /// Only sources with at least one entity of this type.
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long)]
        tier: Option<String>,
        #[arg(long)]
        match_type: Option<String>,
        /// Drop sources with no corroborating sources.
        #[arg(long)]
        corroborated: bool,
        #[arg(long)]
        limit: Option<i64>,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Sync one TAXII 2.1 collection window into an actor.
    Sync {
        actor: String,
        collection_url: String,
        /// Bearer token; defaults to `[sync].bearer_token`.
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        lookback_hours: Option<i64>,
    },

    /// Show an actor's collection sync runs, newest first.
    Runs {
        actor: String,
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show an actor's generation jobs.
    Jobs {
        actor: String,
        /// Show one job with all of its phases.
        #[arg(long)]
        job: Option<String>,
    },

    /// Recover actors left `running` by a dead process.
    Recover,

    /// Start the HTTP server.
    ///
    /// Also runs the auto-refresh loop when `[scheduler].enabled` is true.
    Serve,
}

#[derive(Subcommand)]
enum ActorAction {
    Add {
        name: String,
        /// Exclude the actor from auto refresh.
        #[arg(long)]
        untracked: bool,
    },
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("intel_notebook=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Actor { action } => match action {
            ActorAction::Add { name, untracked } => {
                actors::run_add_actor(&cfg, &name, untracked).await?;
            }
            ActorAction::List => {
                actors::run_list_actors(&cfg).await?;
            }
        },
        Commands::Ingest {
            actor,
            url,
            file,
            title,
            source_name,
            published_at,
            refresh,
        } => {
            let args = IngestArgs {
                title,
                source_name,
                published_at,
                refresh,
            };
            ingest::run_ingest(&cfg, &actor, &url, &file, &args).await?;
        }
        Commands::Evidence {
            actor,
            entity_type,
            min_score,
            tier,
            match_type,
            corroborated,
            limit,
            json,
        } => {
            let filter = EvidenceFilter {
                entity_type,
                min_final_score: min_score,
                source_tier: tier,
                match_type,
                require_corroboration: corroborated,
                limit,
            };
            evidence::run_evidence(&cfg, &actor, &filter, json).await?;
        }
        Commands::Sync {
            actor,
            collection_url,
            token,
            lookback_hours,
        } => {
            collection_sync::run_sync(&cfg, &actor, &collection_url, token.as_deref(), lookback_hours)
                .await?;
        }
        Commands::Runs { actor, limit } => {
            collection_sync::run_list_runs(&cfg, &actor, limit).await?;
        }
        Commands::Jobs { actor, job } => {
            journal::run_jobs(&cfg, &actor, job.as_deref()).await?;
        }
        Commands::Recover => {
            scheduler::run_recover(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
