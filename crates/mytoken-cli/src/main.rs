//! mytoken-admin: maintenance CLI for a mytoken store
//!
//! Commands:
//!   config show|check          - display or validate the configuration
//!   gc                         - delete expired tokens and codes
//!   tree --subject S --issuer I - print the token trees of one identity
//!   revoke <id-hash>           - administrative revoke by stored id
//!   history <id-hash>          - event history of one token
//!   stats                      - record counts of the store
//!   capabilities               - list the known capabilities

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use mytoken::{collect_garbage, revoke_lineage, token_tree, TokenTree};
use mytoken_core::config::MytokenConfig;
use mytoken_core::{TokenHash, UnixTime};
use mytoken_policy::known_capabilities;
use mytoken_store::{transact, MemoryStore, Transaction};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "mytoken-admin",
    version,
    about = "mytoken store administration",
    long_about = "mytoken-admin: inspect configuration, collect garbage, list and revoke mytokens"
)]
struct Cli {
    /// Path to mytoken.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "MYTOKEN_CONFIG",
        default_value = "/etc/mytoken/mytoken.toml"
    )]
    config: PathBuf,

    /// Store snapshot (overrides store.snapshot_path)
    #[arg(long, env = "MYTOKEN_STORE")]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to service.log_level
    #[arg(long, env = "MYTOKEN_LOG")]
    log: Option<String>,

    /// Log format; defaults to service.log_format
    #[arg(long, env = "MYTOKEN_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Delete expired tokens, their orphaned refresh tokens and expired codes
    Gc {
        /// Evaluate expiry at this Unix time instead of now
        #[arg(long)]
        now: Option<i64>,
    },

    /// Print the token trees owned by one OIDC identity
    Tree {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        issuer: String,
        /// Emit JSON instead of an indented listing
        #[arg(long)]
        json: bool,
    },

    /// Revoke a token by its stored id hash
    Revoke {
        id: String,
        /// Also revoke every token derived from it
        #[arg(long)]
        cascade: bool,
    },

    /// Print the event history of a token by its stored id hash
    History {
        id: String,
        /// Emit JSON instead of one line per event
        #[arg(long)]
        json: bool,
    },

    /// Show record counts
    Stats,

    /// List known capabilities
    Capabilities,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration file
    Check,
}

// ── Entry point ────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, from_file) = load_config(&cli.config)?;

    let level = cli.log.as_deref().unwrap_or(&config.service.log_level);
    let format = cli.log_format.unwrap_or(match config.service.log_format.as_str() {
        "text" => LogFormat::Text,
        _ => LogFormat::Json,
    });
    init_logging(level, format);
    if !from_file {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config, from_file),
        Commands::Config {
            action: ConfigAction::Check,
        } => cmd_config_check(&config, &cli.config, from_file),
        Commands::Gc { now } => {
            let store = open_store(&config, cli.store.as_deref())?;
            cmd_gc(&store, now.map(UnixTime).unwrap_or_else(UnixTime::now))
        }
        Commands::Tree {
            subject,
            issuer,
            json,
        } => {
            let store = open_store(&config, cli.store.as_deref())?;
            cmd_tree(&store, &subject, &issuer, json)
        }
        Commands::Revoke { id, cascade } => {
            let store = open_store(&config, cli.store.as_deref())?;
            cmd_revoke(&store, &id, cascade)
        }
        Commands::History { id, json } => {
            let store = open_store(&config, cli.store.as_deref())?;
            cmd_history(&store, &id, json)
        }
        Commands::Stats => {
            let store = open_store(&config, cli.store.as_deref())?;
            cmd_stats(&store)
        }
        Commands::Capabilities => {
            cmd_capabilities();
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<(MytokenConfig, bool)> {
    if path.exists() {
        let config = MytokenConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((MytokenConfig::default(), false))
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn open_store(config: &MytokenConfig, override_path: Option<&Path>) -> Result<MemoryStore> {
    let path = override_path
        .or(config.store.snapshot_path.as_deref())
        .context("no store snapshot configured; set store.snapshot_path or pass --store")?;
    if !path.exists() {
        anyhow::bail!("store snapshot not found: {}", path.display());
    }
    MemoryStore::open(path).with_context(|| format!("opening store {}", path.display()))
}

// ── `mytoken-admin config` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &MytokenConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn cmd_config_check(config: &MytokenConfig, config_path: &Path, from_file: bool) -> Result<()> {
    config
        .validate()
        .with_context(|| format!("validating {}", config_path.display()))?;
    let source = if from_file {
        config_path.display().to_string()
    } else {
        "built-in defaults".to_string()
    };
    println!("config ok: {source}");
    println!("  issuer:    {}", config.service.issuer);
    println!("  providers: {}", config.providers.len());
    for p in &config.providers {
        let lifetime = match p.mytokens_max_lifetime {
            0 => "unlimited".to_string(),
            secs => format!("{secs}s"),
        };
        println!("    {} (max lifetime {lifetime})", p.issuer);
    }
    if config.service.signing_secret_file.is_none() {
        println!("  warning:   no signing_secret_file; issued tokens will not survive a restart");
    }
    Ok(())
}

// ── `mytoken-admin gc` ─────────────────────────────────────────────────────────

fn cmd_gc(store: &MemoryStore, now: UnixTime) -> Result<()> {
    let report = transact(store, |tx| -> Result<_> { Ok(collect_garbage(tx, now)?) })
        .context("garbage collection failed")?;
    info!(now = now.secs(), "gc finished");
    println!("expired tokens:   {}", report.expired_tokens);
    println!("released secrets: {}", report.released_secrets);
    println!("expired codes:    {}", report.expired_proxies);
    Ok(())
}

// ── `mytoken-admin tree` ───────────────────────────────────────────────────────

fn cmd_tree(store: &MemoryStore, subject: &str, issuer: &str, json: bool) -> Result<()> {
    let trees = transact(store, |tx| -> Result<_> { Ok(token_tree(tx, subject, issuer)?) })
        .context("listing tokens failed")?;
    if json {
        let rendered = serde_json::to_string_pretty(&trees).context("serializing trees")?;
        println!("{rendered}");
        return Ok(());
    }
    if trees.is_empty() {
        println!("no tokens for {subject} at {issuer}");
        return Ok(());
    }
    for tree in &trees {
        print_tree(tree, 0);
    }
    Ok(())
}

fn print_tree(tree: &TokenTree, depth: usize) {
    let t = &tree.token;
    let expires = if t.expires_at.is_unset() {
        "never".to_string()
    } else {
        t.expires_at.to_string()
    };
    println!(
        "{:indent$}{} {} seq={} expires={} caps={}",
        "",
        t.id.short(),
        t.name.as_deref().unwrap_or("-"),
        t.seq_no,
        expires,
        t.capabilities.join(","),
        indent = depth * 2
    );
    for child in &tree.children {
        print_tree(child, depth + 1);
    }
}

// ── `mytoken-admin revoke` ─────────────────────────────────────────────────────

fn cmd_revoke(store: &MemoryStore, id: &str, cascade: bool) -> Result<()> {
    let id = TokenHash::from_stored(id);
    let revoked = transact(store, |tx| -> Result<_> { Ok(revoke_lineage(tx, &id, cascade)?) })
        .with_context(|| format!("revoking {}", id.short()))?;
    if revoked.nodes.is_empty() {
        anyhow::bail!("no token with id {id}");
    }
    println!(
        "revoked {} token(s), released {} refresh token(s)",
        revoked.nodes.len(),
        revoked.released_secrets.len()
    );
    Ok(())
}

// ── `mytoken-admin history` ────────────────────────────────────────────────────

fn cmd_history(store: &MemoryStore, id: &str, json: bool) -> Result<()> {
    let id = TokenHash::from_stored(id);
    let events = transact(store, |tx| -> Result<_> { Ok(tx.list_events(&id)?) })
        .with_context(|| format!("reading history of {}", id.short()))?;
    if json {
        let rendered = serde_json::to_string_pretty(&events).context("serializing events")?;
        println!("{rendered}");
        return Ok(());
    }
    if events.is_empty() {
        println!("no events for {id}");
        return Ok(());
    }
    for e in &events {
        println!(
            "{} {:<22} {:<15} {}",
            e.time,
            e.event.to_string(),
            e.ip.as_deref().unwrap_or("-"),
            e.comment
        );
    }
    Ok(())
}

// ── `mytoken-admin stats` ──────────────────────────────────────────────────────

fn cmd_stats(store: &MemoryStore) -> Result<()> {
    let stats = store.stats().context("reading store stats")?;
    if let Some(path) = store.snapshot_path() {
        println!("store: {}", path.display());
    }
    println!("  tokens:         {}", stats.nodes);
    println!("  wrapped keys:   {}", stats.wrapped_keys);
    println!("  refresh tokens: {}", stats.secrets);
    println!("  proxy records:  {}", stats.proxies);
    println!("  usage counters: {}", stats.usage_counters);
    println!("  events:         {}", stats.events);
    Ok(())
}

// ── `mytoken-admin capabilities` ───────────────────────────────────────────────

fn cmd_capabilities() {
    for (capability, description) in known_capabilities() {
        println!("{:<22} {description}", capability.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_revoke() {
        let cli = Cli::try_parse_from(["mytoken-admin", "--store", "/tmp/s.json", "revoke", "abc", "--cascade"])
            .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s.json")));
        match cli.command {
            Commands::Revoke { id, cascade } => {
                assert_eq!(id, "abc");
                assert!(cascade);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_history() {
        let cli = Cli::try_parse_from(["mytoken-admin", "history", "abc", "--json"]).unwrap();
        match cli.command {
            Commands::History { id, json } => {
                assert_eq!(id, "abc");
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, from_file) = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(!from_file);
        assert_eq!(config.service.log_level, "info");
    }

    #[test]
    fn test_open_store_requires_a_path() {
        let config = MytokenConfig::default();
        assert!(open_store(&config, None).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(open_store(&config, Some(&dir.path().join("missing.json"))).is_err());
    }
}
