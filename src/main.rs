use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kiln::config::{Credentials, EngineConfig};
use kiln::db::Database;
use kiln::engine::Engine;
use kiln::ticket::github::GitHubTicketClient;
use kiln::ticket::IssueRef;
use kiln::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Drives an issue-tracker kanban board through a Research/Plan/Implement pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the reconciliation daemon.
    Run {
        #[arg(long, default_value = ".kiln/config")]
        config: PathBuf,
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
    /// Print the path to (and tail) the latest run log for an issue.
    Logs {
        /// `owner/repo#number`
        issue: String,
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long)]
        follow: bool,
        #[arg(long, default_value = ".kiln/config")]
        config: PathBuf,
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
    /// Apply the `reset` label to an issue, handing it to the daemon's reset path.
    Reset {
        /// `owner/repo#number`
        issue: String,
        #[arg(long, default_value = ".kiln/config")]
        config: PathBuf,
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    kiln::logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config, project_dir } => cmd_run(config, project_dir).await,
        Commands::Logs {
            issue,
            workflow,
            follow,
            config,
            project_dir,
        } => cmd_logs(config, project_dir, &issue, workflow.as_deref(), follow).await,
        Commands::Reset {
            issue,
            config,
            project_dir,
        } => cmd_reset(config, project_dir, &issue).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "kiln exited with an error");
    }
    result
}

fn resolve_project_dir(project_dir: Option<PathBuf>) -> Result<PathBuf> {
    match project_dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("failed to determine current directory"),
    }
}

fn build_ticket_client(config: &EngineConfig) -> GitHubTicketClient {
    match &config.credentials {
        Credentials::GitHubCom { token } => GitHubTicketClient::new("https://api.github.com", token.clone()),
        Credentials::Enterprise { token, api_base, .. } => GitHubTicketClient::new(api_base.clone(), token.clone()),
    }
}

fn host_for_config(config: &EngineConfig) -> String {
    match &config.credentials {
        Credentials::GitHubCom { .. } => "github.com".to_string(),
        Credentials::Enterprise { host, .. } => host.clone(),
    }
}

/// Parse `owner/repo#number` into an [`IssueRef`] rooted at `host`.
fn parse_issue_arg(host: String, raw: &str) -> Result<IssueRef> {
    let (owner_repo, number) = raw
        .split_once('#')
        .ok_or_else(|| anyhow!("expected owner/repo#number, got {raw}"))?;
    let (owner, repo) = owner_repo
        .split_once('/')
        .ok_or_else(|| anyhow!("expected owner/repo#number, got {raw}"))?;
    let number: u64 = number.parse().context("issue number must be numeric")?;
    Ok(IssueRef {
        host,
        owner: owner.to_string(),
        repo: repo.to_string(),
        number,
    })
}

async fn cmd_run(config_path: PathBuf, project_dir: Option<PathBuf>) -> Result<()> {
    let project_dir = resolve_project_dir(project_dir)?;
    let config = EngineConfig::load(&config_path, &project_dir).context("failed to load configuration")?;

    let ticket = build_ticket_client(&config);
    let db = Database::open(&config.db_path()).context("failed to open database")?;
    let workspaces = WorkspaceManager::new(project_dir.clone(), config.workspaces_dir());

    let engine = Engine::new(config, ticket, db, workspaces);
    engine.check_credential_scopes().await?;

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        shutdown_for_signal.cancel();
    });

    engine.run(shutdown).await?;
    Ok(())
}

async fn cmd_logs(
    config_path: PathBuf,
    project_dir: Option<PathBuf>,
    issue: &str,
    workflow: Option<&str>,
    follow: bool,
) -> Result<()> {
    let project_dir = resolve_project_dir(project_dir)?;
    let config = EngineConfig::load(&config_path, &project_dir).context("failed to load configuration")?;
    let issue_ref = parse_issue_arg(host_for_config(&config), issue)?;

    let db = Database::open(&config.db_path()).context("failed to open database")?;
    let log_path = db
        .latest_run_log_path(&issue_ref, workflow)?
        .ok_or_else(|| anyhow!("no runs recorded for {issue_ref}"))?;

    if follow {
        let mut cmd = tokio::process::Command::new("tail");
        cmd.arg("-f").arg(&log_path);
        let status = cmd.status().await.context("failed to spawn tail -f")?;
        if !status.success() {
            anyhow::bail!("tail exited with {status}");
        }
    } else {
        let contents = tokio::fs::read_to_string(&log_path)
            .await
            .with_context(|| format!("failed to read log file {log_path}"))?;
        print!("{contents}");
    }
    Ok(())
}

async fn cmd_reset(config_path: PathBuf, project_dir: Option<PathBuf>, issue: &str) -> Result<()> {
    let project_dir = resolve_project_dir(project_dir)?;
    let config = EngineConfig::load(&config_path, &project_dir).context("failed to load configuration")?;
    let issue_ref = parse_issue_arg(host_for_config(&config), issue)?;

    let ticket = build_ticket_client(&config);
    use kiln::ticket::TicketClient;
    ticket.add_label(&issue_ref, "reset").await?;
    println!("applied reset label to {issue_ref}; the running daemon will pick it up on its next poll");
    Ok(())
}
