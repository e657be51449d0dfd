use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use livesync::agent::{from_commands, Agent};
use livesync::config::Config;
use livesync::session::Session;
use livesync::sync::Dispatcher;
use livesync::watch::{ChangeBatch, Classification, ReloadKind};

#[derive(Parser)]
#[command(name = "livesync", version, about = "Keep running targets in sync with local source edits")]
struct Cli {
    /// Path to livesync.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the project and push every change batch to all targets
    Watch,

    /// Push files once without watching
    Push {
        /// Force a full reload; without paths, resend every file instead of what changed
        #[arg(long)]
        full: bool,

        /// Print the dispatch report as JSON
        #[arg(long)]
        json: bool,

        /// Files to push; the tree files changed since the last push when omitted
        paths: Vec<PathBuf>,
    },

    /// Run the device agent that receives directives
    Agent {
        /// Directory directives are written into
        #[arg(long)]
        root: PathBuf,

        #[arg(long, default_value = "0.0.0.0:8050")]
        listen: String,

        /// Shell command run after a hot reload; changed paths are in LIVESYNC_CHANGED
        #[arg(long)]
        hot_swap_command: Option<String>,

        /// Shell command that (re)starts the application after a full reload
        #[arg(long)]
        restart_command: Option<String>,

        /// Seconds to wait for a sender before dropping the connection
        #[arg(long, default_value_t = 60)]
        read_timeout: u64,
    },

    /// Show how paths are classified by the configured rules
    Classify {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Watch => {
            let config = Config::load(cli.config.as_deref())?;
            let session = Session::from_config(&config)?.print_reports(true);
            for device in session.dispatcher().registry().list() {
                info!(device = %device.id, transport = %device.transport, address = %device.address, "Target");
            }
            let stats = session.run().await?;
            info!(batches = stats.batches, total_failures = stats.total_failures, "Session ended");
            Ok(ExitCode::SUCCESS)
        }

        Command::Push { full, json, paths } => {
            let config = Config::load(cli.config.as_deref())?;
            let rules = config.rule_set()?;
            let dispatcher = Dispatcher::from_config(&config)?;

            let report = if paths.is_empty() {
                match dispatcher.push_tree(full).await? {
                    Some(report) => report,
                    None => {
                        println!("{}", "Targets are up to date".green());
                        return Ok(ExitCode::SUCCESS);
                    }
                }
            } else {
                let cwd = std::env::current_dir().context("Failed to read working directory")?;
                let mut kind = if full { ReloadKind::FullReload } else { ReloadKind::HotReload };
                let mut files = Vec::new();
                for path in &paths {
                    let abs = cwd.join(path);
                    let rel = rules
                        .relativize(&abs)
                        .with_context(|| format!("{} is outside {}", path.display(), config.root.display()))?;
                    if rules.classify(&abs) == Classification::FullReload {
                        kind = ReloadKind::FullReload;
                    }
                    files.push(rel);
                }
                dispatcher.dispatch(&ChangeBatch::new(kind, files)).await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for line in report.render_lines() {
                    println!("{}", line);
                }
            }

            Ok(if report.is_total_failure() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }

        Command::Agent {
            root,
            listen,
            hot_swap_command,
            restart_command,
            read_timeout,
        } => {
            std::fs::create_dir_all(&root).with_context(|| format!("Failed to create {}", root.display()))?;
            let capability = from_commands(&root, hot_swap_command, restart_command);
            let agent = Agent::new(&root, capability).with_read_timeout(Duration::from_secs(read_timeout));
            let (agent, listener) = agent.bind(listen.as_str()).await?;

            tokio::select! {
                result = Arc::clone(&agent).serve(listener) => result?,
                _ = tokio::signal::ctrl_c() => info!("Agent stopped"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Classify { paths } => {
            let config = Config::load(cli.config.as_deref())?;
            let rules = config.rule_set()?;
            let cwd = std::env::current_dir().context("Failed to read working directory")?;

            for path in paths {
                let label = match rules.classify(&cwd.join(&path)) {
                    Classification::FullReload => "FULL_RELOAD".red().bold(),
                    Classification::HotReload => "HOT_RELOAD".green().bold(),
                    Classification::Ignore => "IGNORE".dimmed(),
                };
                println!("{:<12} {}", label, path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
