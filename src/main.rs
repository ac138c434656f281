//! Hotforge - hot-swap compilation pipeline for script plugins.
//!
//! One-shot commands compile against a logging host and report the result;
//! `watch` keeps running and reloads plugins as their sources change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hotforge::resolve::parse_directives;
use hotforge::{ForgeConfig, LoadManager, LoadState, PluginHandle, PluginHost, SourceWatcher};

/// Hot-swap compilation pipeline for script plugins
#[derive(Parser)]
#[command(name = "hotforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile, verify, and load plugins by name
    Load {
        /// Plugin names to load
        names: Vec<String>,

        /// Load every plugin source in the plugin directory
        #[arg(short, long)]
        all: bool,
    },

    /// Force a recompile of a plugin even if its source is unchanged
    Reload {
        /// Plugin name
        name: String,
    },

    /// List plugin sources and their declared dependencies
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Watch the plugin directory and reload plugins as sources change
    Watch {
        /// Load every plugin before watching
        #[arg(short, long)]
        all: bool,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Host used by the CLI: prints swaps instead of running plugin instances.
struct LoggingHost;

#[async_trait]
impl PluginHost for LoggingHost {
    async fn unload(&self, name: &str) {
        println!("  - unloaded {name}");
    }

    async fn register(&self, handle: PluginHandle) -> std::result::Result<(), String> {
        println!("  + registered {} ({})", handle.name, &handle.binary.digest[..12]);
        Ok(())
    }

    async fn on_compile_finished(&self, name: &str, success: bool) {
        if !success {
            println!("  ! {name} failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let config_path = cli.config.clone().unwrap_or_else(ForgeConfig::default_path);
    let config = ForgeConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Load { names, all } => cmd_load(config, names, all).await,
        Commands::Reload { name } => cmd_reload(config, &name).await,
        Commands::List { format } => cmd_list(&config, &format),
        Commands::Watch { all } => cmd_watch(config, all).await,
        Commands::Config { path } => cmd_config(&config, &config_path, path),
    }
}

/// Load plugins and report the resulting states.
async fn cmd_load(config: ForgeConfig, names: Vec<String>, all: bool) -> Result<()> {
    let manager = LoadManager::new(config, Arc::new(LoggingHost));

    if all {
        let discovered = manager.load_all().await?;
        if discovered.is_empty() {
            println!("No plugin sources found.");
            return Ok(());
        }
    } else {
        if names.is_empty() {
            anyhow::bail!("specify plugin names or pass --all");
        }
        manager.load_many(names).await?;
    }

    report_states(&manager)
}

/// Force a recompile of one plugin.
async fn cmd_reload(config: ForgeConfig, name: &str) -> Result<()> {
    let manager = LoadManager::new(config, Arc::new(LoggingHost));
    manager.reload(name).await?;
    report_states(&manager)
}

fn report_states(manager: &LoadManager) -> Result<()> {
    let mut failed = 0usize;
    println!();
    for row in manager.registry().status() {
        let compiled = row
            .last_compiled
            .map(|t| DateTime::<Local>::from(t).format(" (compiled %H:%M:%S)").to_string())
            .unwrap_or_default();
        println!("  {} {}{compiled}", row.name, row.state);
        if matches!(row.state, LoadState::Failed | LoadState::RolledBack) {
            failed += 1;
            if let Some(error) = &row.last_error {
                for line in error.lines() {
                    println!("      {line}");
                }
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} plugin(s) failed to load");
    }
    Ok(())
}

#[derive(Serialize)]
struct ListRow {
    name: String,
    path: PathBuf,
    requires: Vec<String>,
    references: Vec<String>,
}

/// List plugin sources without compiling anything.
fn cmd_list(config: &ForgeConfig, format: &str) -> Result<()> {
    let dir = &config.paths.plugin_dir;
    let mut rows: Vec<ListRow> = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !has_extension(&path, &config.watch.extension) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        let text = std::fs::read_to_string(&path).unwrap_or_default();
        let directives = parse_directives(&text);
        rows.push(ListRow {
            name: name.to_string(),
            path: path.clone(),
            requires: directives.requires.into_iter().collect(),
            references: directives.references.into_iter().collect(),
        });
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&rows)?;
            println!("{json}");
        }
        _ => {
            for row in &rows {
                print!("  {}", row.name);
                if !row.requires.is_empty() {
                    print!(" (requires {})", row.requires.join(", "));
                }
                if !row.references.is_empty() {
                    print!(" [refs {}]", row.references.join(", "));
                }
                println!();
            }
            println!("\nTotal: {} plugin(s)", rows.len());
        }
    }

    Ok(())
}

/// Run the long-lived watch loop.
async fn cmd_watch(config: ForgeConfig, all: bool) -> Result<()> {
    let dir = config.paths.plugin_dir.clone();
    let watch_config = config.watch.clone();

    let manager = LoadManager::new(config, Arc::new(LoggingHost));
    if all {
        let discovered = manager.load_all().await?;
        println!("Loaded {} plugin(s).", discovered.len());
    }

    let mut watcher = SourceWatcher::start(&dir, &watch_config)?;
    println!("Watching {} (ctrl-c to stop)", dir.display());

    while let Some(event) = watcher.next().await {
        manager.handle_event(event).await;
    }

    Ok(())
}

/// Show configuration.
fn cmd_config(config: &ForgeConfig, config_path: &Path, show_path: bool) -> Result<()> {
    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }
    let toml = toml::to_string_pretty(config)?;
    println!("{toml}");
    Ok(())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}
