use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use canvascraft_lib::archive::{FileTreeNode, LoadEvent, LoadPhase, Locator};
use canvascraft_lib::config::{config_path, Config};
use canvascraft_lib::service::{BuildServiceClient, LogEvent, LogPoller};

#[derive(Parser, Debug)]
#[command(name = "canvascraft", version, about = "Archive loader, edit overlay and build-service proxy")]
struct Cli {
    /// Config file (defaults to ~/.canvascraft/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy in front of the build service.
    Serve {
        #[arg(long)]
        listen: Option<String>,
    },
    /// Load an archive and print its file tree.
    Load {
        locator: String,
        /// Print this file's content instead of the tree.
        #[arg(long)]
        cat: Option<String>,
    },
    /// Start a new project from a prompt.
    Generate { prompt: String },
    /// Build a generated project.
    Build { job_id: String },
    /// Apply a follow-up prompt to an existing project.
    Improve { job_id: String, prompt: String },
    /// Ask the service to fix a runtime error.
    Fix { job_id: String, message: String },
    /// Show build logs for a job.
    Logs {
        job_id: String,
        #[arg(long)]
        follow: bool,
    },
    /// Read a file through the edit overlay.
    Read { project: String, path: String },
    /// Save a local file as the edited version of `path`.
    Save {
        project: String,
        path: String,
        source: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => {
            let config = Config::read_file(p).with_context(|| format!("reading {}", p.display()))?;
            Ok(config.with_overrides(|key| std::env::var(key).ok()))
        }
        None => {
            tracing::debug!(path = ?config_path(), "loading default config");
            Ok(Config::load())
        }
    }
}

/// Service base for client commands: the proxy when configured, else the service itself.
fn service_client(config: &Config) -> anyhow::Result<BuildServiceClient> {
    let base = match &config.proxy_url {
        Some(url) => url.as_str(),
        None => config.require_build_service_url()?,
    };
    Ok(BuildServiceClient::new(base))
}

fn print_tree(nodes: &[FileTreeNode], depth: usize) {
    for node in nodes {
        let suffix = if node.is_directory { "/" } else { "" };
        println!("{}{}{suffix}", "  ".repeat(depth), node.name);
        print_tree(node.children(), depth + 1);
    }
}

async fn load(config: &Config, raw: &str, cat: Option<&str>) -> anyhow::Result<()> {
    let locator = Locator::parse(raw).context("locator is empty")?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let loader = canvascraft_lib::loader_from_config(config, Some(tx));

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                LoadEvent::AttemptFailed { attempt, message, .. } => eprintln!("attempt {attempt} failed: {message}"),
                LoadEvent::Retrying { attempt, delay_ms } => eprintln!("retrying (attempt {attempt}) in {delay_ms} ms"),
                LoadEvent::FallbackUsed { message } => eprintln!("{message}"),
                _ => {}
            }
        }
    });

    let state = loader.load(locator).await;
    drop(loader);
    let _ = printer.await;

    match state.phase {
        LoadPhase::Failed => anyhow::bail!(state.error.unwrap_or_else(|| "load failed".into())),
        _ => {
            if let Some(path) = cat {
                let text = state.files.get(path).with_context(|| format!("File not found: {path}"))?;
                println!("{text}");
            } else {
                print_tree(&state.tree, 0);
                for err in &state.entry_errors {
                    eprintln!("{err}");
                }
            }
            Ok(())
        }
    }
}

async fn follow_logs(client: BuildServiceClient, config: &Config, job_id: &str) -> anyhow::Result<()> {
    let poller = LogPoller::new(client, &config.log_poll);
    let (tx, mut rx) = mpsc::unbounded_channel();
    poller.start(job_id, tx).await;

    let mut printed = 0;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(LogEvent::Logs { lines, .. }) => {
                    // The service returns the full log every time.
                    if lines.len() < printed {
                        printed = 0;
                    }
                    for line in &lines[printed..] {
                        println!("{line}");
                    }
                    printed = lines.len();
                }
                Some(LogEvent::Error { message, .. }) => eprintln!("{message}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    poller.stop().await;
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            canvascraft_lib::run_proxy(&config).await?;
        }
        Command::Load { locator, cat } => load(&config, &locator, cat.as_deref()).await?,
        Command::Generate { prompt } => {
            let response = service_client(&config)?.run(&prompt).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Build { job_id } => {
            let response = service_client(&config)?.build(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Improve { job_id, prompt } => {
            let response = service_client(&config)?.improve(&job_id, &prompt).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Fix { job_id, message } => {
            let response = service_client(&config)?.fix_error(&job_id, &message).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Logs { job_id, follow } => {
            let client = service_client(&config)?;
            if follow {
                follow_logs(client, &config, &job_id).await?;
            } else {
                for line in client.logs(&job_id).await? {
                    println!("{line}");
                }
            }
        }
        Command::Read { project, path } => {
            let overlay = canvascraft_lib::overlay_from_config(&config).context("storage is not configured")?;
            println!("{}", overlay.load(&project, &path).await?);
        }
        Command::Save { project, path, source } => {
            let overlay = canvascraft_lib::overlay_from_config(&config).context("storage is not configured")?;
            let text = tokio::fs::read_to_string(&source)
                .await
                .with_context(|| format!("reading {}", source.display()))?;
            overlay.save(&project, &path, &text).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    canvascraft_lib::init_tracing();
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("canvascraft: {e:#}");
        std::process::exit(1);
    }
}
