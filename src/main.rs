//! plugin-engine CLI
//!
//! One-shot commands run a single bridge command and print its reply as
//! JSON. `serve` keeps the engine running and speaks newline-delimited JSON
//! over stdin/stdout. Logs always go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plugin_engine::bridge::{BridgeCommand, BridgeReply, HostBridge};
use plugin_engine::config::{self, EngineConfig};
use plugin_engine::events::{StatusEvent, StatusReporter};
use plugin_engine::manager::PluginManager;
use plugin_engine::strategy::{CdnConfig, DownloadConfig, LocalConfig, NpmConfig, PrivateRegistry};

#[derive(Parser)]
#[command(name = "plugin-engine")]
#[command(author, version, about = "Install and manage third-party plugins")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Plugins root directory (overrides config)
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,

    /// Metadata database path (overrides config)
    #[arg(long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a plugin from a .zip URL
    InstallCdn {
        url: String,

        /// Remote installation id to echo back
        #[arg(long)]
        installation_id: Option<String>,
    },

    /// Install a plugin from a local .zip
    InstallLocal { path: PathBuf },

    /// Install a plugin from an npm registry
    InstallNpm {
        name: String,

        /// Exact version or dist-tag (default: latest)
        #[arg(long)]
        version: Option<String>,

        /// Private registry URL
        #[arg(long)]
        registry: Option<String>,

        /// Bearer token for the private registry
        #[arg(long, requires = "registry")]
        token: Option<String>,
    },

    /// Activate an installed plugin
    Activate { name: String },

    /// Deactivate an installed plugin
    Deactivate { name: String },

    /// Remove a plugin and its files
    Uninstall { name: String },

    /// List installed plugins
    List,

    /// Show one installed plugin
    Show { name: String },

    /// Print menu contributions of active plugins
    Menu,

    /// Show current configuration
    Config,

    /// Read JSON commands from stdin, one per line
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "plugin_engine=debug"
    } else {
        "plugin_engine=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = config::load_config().context("Failed to load configuration")?;
    if let Some(dir) = cli.plugins_dir {
        config.plugins_dir = dir;
    }
    if let Some(db) = cli.database {
        config.database_path = db;
    }

    match cli.command {
        Commands::Config => cmd_config(&config),
        Commands::Serve => cmd_serve(&config).await,
        Commands::InstallCdn {
            url,
            installation_id,
        } => {
            let command = BridgeCommand::Download {
                config: DownloadConfig::Cdn(CdnConfig { url }),
                installation_id,
            };
            cmd_once(&config, command, true).await
        }
        Commands::InstallLocal { path } => {
            let command = BridgeCommand::Download {
                config: DownloadConfig::Local(LocalConfig { path: Some(path) }),
                installation_id: None,
            };
            cmd_once(&config, command, true).await
        }
        Commands::InstallNpm {
            name,
            version,
            registry,
            token,
        } => {
            let registry = registry.map(|private_url| PrivateRegistry {
                private_url,
                auth_token: token,
            });
            let command = BridgeCommand::Download {
                config: DownloadConfig::Npm(NpmConfig {
                    name,
                    version,
                    registry,
                }),
                installation_id: None,
            };
            cmd_once(&config, command, true).await
        }
        Commands::Activate { name } => cmd_once(&config, BridgeCommand::Activate { name }, true).await,
        Commands::Deactivate { name } => {
            cmd_once(&config, BridgeCommand::Deactivate { name }, true).await
        }
        Commands::Uninstall { name } => {
            cmd_once(&config, BridgeCommand::Uninstall { name }, true).await
        }
        Commands::Menu => cmd_once(&config, BridgeCommand::Menu, true).await,
        Commands::List => cmd_once(&config, BridgeCommand::GetAll, false).await,
        Commands::Show { name } => cmd_once(&config, BridgeCommand::GetOne { name }, false).await,
    }
}

fn build_bridge(config: &EngineConfig) -> anyhow::Result<(HostBridge, UnboundedReceiver<StatusEvent>)> {
    let (reporter, events) = StatusReporter::channel();
    let manager = PluginManager::from_config(config, None)
        .with_context(|| format!("Failed to open plugin store at {:?}", config.database_path))?
        .with_reporter(reporter.clone());
    Ok((HostBridge::new(Arc::new(manager), reporter), events))
}

/// Run one command. Commands that drive lifecycle hooks first load the
/// installed plugins, as on any process start.
async fn cmd_once(
    config: &EngineConfig,
    command: BridgeCommand,
    load_first: bool,
) -> anyhow::Result<()> {
    let (bridge, mut events) = build_bridge(config)?;

    if load_first {
        let loaded = bridge.dispatch(BridgeCommand::Load).await;
        if !loaded.is_success() {
            error!(message = ?loaded.message, "Loading installed plugins failed");
        }
    }
    let reply = bridge.dispatch(command).await;

    while let Ok(event) = events.try_recv() {
        info!(
            status = ?event.status,
            operation = %event.operation,
            plugin = ?event.plugin,
            message = ?event.message,
            "Status"
        );
    }

    println!("{}", serde_json::to_string_pretty(&reply)?);
    if reply.is_success() {
        Ok(())
    } else {
        anyhow::bail!(reply.message.unwrap_or_else(|| "command failed".to_string()))
    }
}

/// One line written in serve mode
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Outgoing<'a> {
    Event(&'a StatusEvent),
    Reply(&'a BridgeReply),
}

async fn write_line(
    stdout: &mut tokio::io::Stdout,
    message: &Outgoing<'_>,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn flush_events(
    stdout: &mut tokio::io::Stdout,
    events: &mut UnboundedReceiver<StatusEvent>,
) -> anyhow::Result<()> {
    while let Ok(event) = events.try_recv() {
        write_line(stdout, &Outgoing::Event(&event)).await?;
    }
    Ok(())
}

async fn cmd_serve(config: &EngineConfig) -> anyhow::Result<()> {
    let (bridge, mut events) = build_bridge(config)?;
    let mut stdout = tokio::io::stdout();
    info!(plugins_dir = ?config.plugins_dir, "Serving plugin commands on stdio");

    let reply = bridge.dispatch(BridgeCommand::Load).await;
    flush_events(&mut stdout, &mut events).await?;
    write_line(&mut stdout, &Outgoing::Reply(&reply)).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = bridge.dispatch_json(&line).await;
        flush_events(&mut stdout, &mut events).await?;
        write_line(&mut stdout, &Outgoing::Reply(&reply)).await?;
    }
    info!("Input closed, shutting down");
    Ok(())
}

fn cmd_config(config: &EngineConfig) -> anyhow::Result<()> {
    println!("plugin-engine Configuration\n");
    println!("Paths:");
    println!("  Plugins: {:?}", config.plugins_dir);
    println!("  Database: {:?}", config.database_path);
    println!();
    println!("Limits:");
    println!("  Max file size: {} bytes", config.limits.max_file_size);
    println!("  Max total size: {} bytes", config.limits.max_total_size);
    println!("  Manifest search depth: {}", config.limits.manifest_search_depth);
    println!();
    println!("Download:");
    println!("  Timeout: {}s", config.download.timeout_secs);
    println!(
        "  Attempts: {} (backoff {}ms..{}ms)",
        config.download.max_attempts, config.download.base_delay_ms, config.download.max_delay_ms
    );
    println!();
    println!("npm:");
    println!("  Registry: {}", config.npm.registry_url);
    println!("  Timeout: {}s", config.npm.timeout_secs);
    println!("  Max dependency depth: {}", config.npm.max_dependency_depth);
    println!(
        "  Integrity check: {}",
        if config.npm.verify_integrity { "on" } else { "off" }
    );
    println!();
    println!("Lifecycle:");
    println!("  Hook timeout: {}s", config.lifecycle.hook_timeout_secs);
    Ok(())
}
