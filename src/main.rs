//! memoclaw: operator tool for a memoclaw agent workspace
//!
//! Usage:
//!   memoclaw sessions                      → list sessions and watermarks
//!   memoclaw replay tg:42 --tail 20        → print a session log
//!   memoclaw memory [scope]                → show long-term memory
//!   memoclaw kaizen                        → show the Kaizen ledger
//!   memoclaw check                         → validate config and workspace
//!   memoclaw dump-config                   → print effective config as TOML
//!   memoclaw version                       → show version

use anyhow::Context;
use clap::{Parser, Subcommand};
use memoclaw_agent::kaizen::LEDGER_FILE;
use memoclaw_agent::{KaizenLedger, MemoryStore, SessionStore};
use memoclaw_core::{MemoclawConfig, SessionKey};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "memoclaw",
    about = "Inspect and maintain a memoclaw agent workspace",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace directory (or set MEMOCLAW_WORKSPACE)
    #[arg(short, long, global = true)]
    workspace: Option<String>,

    /// Config file (default: <workspace>/memoclaw.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions with message counts and consolidation watermarks
    Sessions,
    /// Print a session's message log
    Replay {
        /// Session key, e.g. tg:42
        session: String,
        /// Only the last N messages
        #[arg(short, long)]
        tail: Option<usize>,
        /// Print raw JSON records
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show long-term memory for a scope, or list scopes
    Memory {
        scope: Option<String>,
    },
    /// Show Kaizen candidates
    Kaizen,
    /// Validate the config file and open the workspace stores
    Check,
    /// Print the effective config as TOML
    DumpConfig,
    /// Show version
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref());

    let workspace = resolve_workspace(cli.workspace.as_deref());
    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(|| workspace.join("memoclaw.toml"));
    tracing::debug!(workspace = %workspace.display(), config = %config_path.display(), "Resolved paths");

    match cli.command {
        Commands::Version => println!("memoclaw v{}", env!("CARGO_PKG_VERSION")),
        Commands::DumpConfig => print!("{}", MemoclawConfig::load(&config_path).to_toml()),
        Commands::Check => check(&workspace, &config_path)?,
        Commands::Sessions => sessions(&workspace, &MemoclawConfig::load(&config_path))?,
        Commands::Replay { session, tail, json } => {
            replay(&workspace, &MemoclawConfig::load(&config_path), &session, tail, json)?
        }
        Commands::Memory { scope } => memory(&workspace, &MemoclawConfig::load(&config_path), scope)?,
        Commands::Kaizen => kaizen(&workspace, &MemoclawConfig::load(&config_path))?,
    }
    Ok(())
}

/// Stderr logging by default; `--log-file` sends logs to a file through a
/// non-blocking writer whose guard must live until exit.
fn init_tracing(log_file: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "memoclaw=info".into());

    match log_file.map(expand_tilde) {
        Some(path) => {
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
            let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "memoclaw.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}

fn resolve_workspace(flag: Option<&str>) -> PathBuf {
    flag.map(expand_tilde)
        .or_else(|| std::env::var("MEMOCLAW_WORKSPACE").ok().map(|p| expand_tilde(&p)))
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".memoclaw")
        })
}

fn check(workspace: &Path, config_path: &Path) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        MemoclawConfig::try_load(config_path)
            .with_context(|| format!("invalid config {}", config_path.display()))?
    } else {
        println!("no config at {}, using defaults", config_path.display());
        MemoclawConfig::default()
    };
    let store = SessionStore::open(workspace, config.session.max_message_chars)?;
    let memory = MemoryStore::open(workspace, config.consolidation.scope)?;
    println!("config:    ok");
    println!("sessions:  {} ({})", store.keys()?.len(), store.root().display());
    println!("memory:    {} scope(s) ({})", memory.scopes()?.len(), memory.root().display());
    Ok(())
}

fn sessions(workspace: &Path, config: &MemoclawConfig) -> anyhow::Result<()> {
    let store = SessionStore::open(workspace, config.session.max_message_chars)?;
    let keys = store.keys()?;
    if keys.is_empty() {
        println!("no sessions in {}", workspace.display());
        return Ok(());
    }
    println!("{:<32} {:>8} {:>10}  last activity", "session", "messages", "watermark");
    for key in keys {
        let snapshot = store.snapshot(&key)?;
        let last = snapshot
            .messages
            .last()
            .map(|m| m.timestamp.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<32} {:>8} {:>10}  {}", key, snapshot.end(), snapshot.watermark, last);
    }
    Ok(())
}

fn replay(
    workspace: &Path,
    config: &MemoclawConfig,
    session: &str,
    tail: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let store = SessionStore::open(workspace, config.session.max_message_chars)?;
    let key = SessionKey::new(session);
    if !store.exists(&key) {
        anyhow::bail!("no session '{}' in {}", session, workspace.display());
    }
    let messages = store.replay(&key)?;
    let start = tail.map(|n| messages.len().saturating_sub(n)).unwrap_or(0);
    for message in &messages[start..] {
        if json {
            println!("{}", serde_json::to_string(message)?);
        } else {
            println!("{}", message.render_line());
        }
    }
    Ok(())
}

fn memory(workspace: &Path, config: &MemoclawConfig, scope: Option<String>) -> anyhow::Result<()> {
    let memory = MemoryStore::open(workspace, config.consolidation.scope)?;
    let Some(scope) = scope else {
        for scope in memory.scopes()? {
            let entries = memory.read_history(&scope)?.len();
            println!("{:<32} {} history entries", scope, entries);
        }
        return Ok(());
    };

    // Accept either a scope directory name or a session key.
    let scope = if memory.scopes()?.contains(&scope) {
        scope
    } else {
        memory.scope_for(&SessionKey::new(scope))
    };
    let summary = memory.read_summary(&scope)?;
    if summary.trim().is_empty() {
        println!("(no long-term memory for {})", scope);
    } else {
        println!("{}", summary);
    }
    let history = memory.read_history(&scope)?;
    println!("\n{} consolidation pass(es)", history.len());
    for entry in history.iter().rev().take(5) {
        println!(
            "  [{}] {} {}..{}",
            entry.created_at.format("%Y-%m-%d %H:%M"),
            entry.session,
            entry.start,
            entry.end
        );
    }
    Ok(())
}

fn kaizen(workspace: &Path, config: &MemoclawConfig) -> anyhow::Result<()> {
    let memory = MemoryStore::open(workspace, config.consolidation.scope)?;
    let ledger = KaizenLedger::load(&memory.root().join(LEDGER_FILE))?;
    match ledger.last_run_at {
        Some(at) => println!("last run: {}", at.format("%Y-%m-%d %H:%M")),
        None => println!("last run: never"),
    }
    let mut candidates = ledger.candidates.clone();
    candidates.sort_by(|a, b| b.observations.cmp(&a.observations));
    for c in candidates {
        println!("{:>4}x  {:<22} {}", c.observations, format!("{:?}", c.status), c.description);
    }
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
