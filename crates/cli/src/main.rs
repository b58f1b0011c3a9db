// crates/cli/src/main.rs
//! `todo-progress`: start bulk jobs on the todo service and follow them.

mod follow;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use todo_progress_client::config::DEFAULT_API_BASE_URL;
use todo_progress_client::{ClientConfig, JobSubmitter, TodoApi};
use todo_progress_core::{JobId, ListId};
use todo_progress_observability::LogConfig;

#[derive(Parser)]
#[command(name = "todo-progress", version)]
#[command(about = "Start and follow bulk jobs on the todo service", long_about = None)]
struct Cli {
    /// REST API base URL
    #[arg(long, env = "TODO_API_BASE_URL", default_value = DEFAULT_API_BASE_URL, global = true)]
    api_url: String,

    /// Job hub URL (derived from the API URL when unset)
    #[arg(long, env = "TODO_HUB_URL", global = true)]
    hub_url: Option<String>,

    /// Log JSON lines instead of text
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write logs to a daily file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show all todo lists
    Lists,
    /// Show the items of a list
    Items { list_id: ListId },
    /// Mark every item of a list done and follow the job
    CompleteAll { list_id: ListId },
    /// Follow a job that is already running
    Watch {
        job_id: String,
        /// Reload this list when the job ends
        #[arg(long)]
        list: Option<ListId>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Quiet by default so the progress bar stays readable.
    let log_config = LogConfig {
        default_filter: "warn".to_string(),
        json: cli.log_json,
        log_dir: cli.log_dir.clone(),
        ..LogConfig::default()
    };
    let _log_guard = match todo_progress_observability::init(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("  ! logging disabled: {e:#}");
            None
        }
    };

    // reqwest and tokio-tungstenite both link rustls; pick the provider once.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("  \u{2717} {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = ClientConfig::new(cli.api_url.as_str()).context("invalid --api-url")?;
    if let Some(hub_url) = cli.hub_url {
        config = config.with_hub_url(hub_url).context("invalid --hub-url")?;
    }
    tracing::debug!(api = %config.api_base_url, hub = %config.hub_url, "configured");

    match cli.command {
        Command::Lists => {
            let lists = TodoApi::new(config.api_base_url.as_str())
                .lists()
                .await
                .context("loading todo lists")?;
            print!("{}", render::lists(&lists));
            Ok(ExitCode::SUCCESS)
        }
        Command::Items { list_id } => {
            let items = TodoApi::new(config.api_base_url.as_str())
                .items(list_id)
                .await
                .with_context(|| format!("loading items of list {list_id}"))?;
            print!("{}", render::items(&items));
            Ok(ExitCode::SUCCESS)
        }
        Command::CompleteAll { list_id } => {
            let job_id = JobSubmitter::new(config.api_base_url.as_str())
                .start_complete_all(list_id)
                .await
                .with_context(|| format!("starting bulk completion of list {list_id}"))?;
            eprintln!("  \u{2192} Job {job_id} started for list {list_id}");
            follow::follow(&config, job_id, Some(list_id)).await
        }
        Command::Watch { job_id, list } => follow::follow(&config, JobId::from(job_id), list).await,
    }
}
