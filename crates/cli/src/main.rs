//! Vigil CLI - vigil command
//!
//! Watches files and directory trees from the command line and prints one
//! line per change event until interrupted.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;
use watcher::{
    BackendKind, ChangeEvent, ChannelHandler, EventKind, FsWatcher, WatcherConfig,
};

/// Watch paths and print file system change events
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Paths to watch
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Watch directories recursively (tree watch)
    #[arg(short, long)]
    recursive: bool,

    /// Glob mask restricting which file names generate events, e.g. '*.rs'
    /// (tree watches only; empty matches everything)
    #[arg(short = 'f', long, default_value = "")]
    filter: String,

    /// Event kinds to report (create, delete, rename, modify, access);
    /// default is all of them
    #[arg(short, long, value_delimiter = ',')]
    events: Vec<String>,

    /// Backend selection: auto, native, poll
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Snapshot interval for the polling backend, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Load watcher configuration from a TOML file (flags override it)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = load_config(&cli)?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.poll_interval_ms = interval;
    }

    let filter = parse_event_mask(&cli.events)?;

    let watcher = FsWatcher::with_config(config)?;
    let (handler, events) = ChannelHandler::new();
    watcher.set_handler(handler);

    for path in &cli.paths {
        let added = if cli.recursive {
            watcher.add_tree(path, filter, &cli.filter)
        } else {
            watcher.add(path, filter)
        };
        if !added {
            bail!("could not watch {}", path.display());
        }
    }

    eprintln!(
        "watching {} path(s); press Ctrl-C to stop",
        watcher.watched_path_count()
    );

    for event in events {
        print_event(&event);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<WatcherConfig> {
    match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))
        }
        None => Ok(WatcherConfig::default()),
    }
}

/// Build the per-watch event filter from `--events` names. Warnings and
/// errors are always requested so degraded delivery stays visible.
fn parse_event_mask(names: &[String]) -> Result<EventKind> {
    if names.is_empty() {
        return Ok(EventKind::ALL);
    }
    let mut mask = EventKind::WARNING | EventKind::ERROR;
    for name in names {
        mask |= match name.as_str() {
            "create" => EventKind::CREATE,
            "delete" => EventKind::DELETE,
            "rename" => EventKind::RENAME,
            "modify" => EventKind::MODIFY,
            "access" => EventKind::ACCESS,
            other => bail!("unknown event kind {other:?}"),
        };
    }
    Ok(mask)
}

fn print_event(event: &ChangeEvent) {
    let kind = event.kind;
    if kind == EventKind::CREATE {
        println!("{} {}", "create".green(), event.path.display());
    } else if kind == EventKind::DELETE {
        println!("{} {}", "delete".red(), event.path.display());
    } else if kind == EventKind::RENAME {
        println!(
            "{} {} -> {}",
            "rename".yellow(),
            event.path.display(),
            event.new_path.display()
        );
    } else if kind == EventKind::MODIFY {
        println!("{} {}", "modify".cyan(), event.path.display());
    } else if kind == EventKind::ACCESS {
        println!("{} {}", "access".blue(), event.path.display());
    } else if kind == EventKind::WARNING {
        eprintln!("{} {}", "warning".yellow().bold(), event.description());
    } else if kind == EventKind::ERROR {
        eprintln!("{} {}", "error".red().bold(), event.description());
    } else {
        println!("{event}");
    }
}
