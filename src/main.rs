use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repowarden::config::LoggingConfig;
use repowarden::health::CheckResult;
use repowarden::{Config, Daemon, HealthCheck, RunContext, SyncEngine, UnitOutcome};

/// Exit status when the configuration cannot be loaded
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "repowarden")]
#[command(about = "Discover repositories and keep mirrors of them in sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Discover repositories and reconcile every destination
    Sync {
        /// Log what would happen without mutating any destination
        #[arg(long)]
        dry_run: bool,
    },

    /// List repositories that would be synced
    List {
        /// Show repository details
        #[arg(long)]
        details: bool,
    },

    /// Run `sync` on the configured schedule until interrupted
    Daemon,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        let _ = init_logging(&LoggingConfig::default(), cli.verbose, cli.quiet);
        return finish(cmd_init(cli.config, force));
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = init_logging(&config.logging, cli.verbose, cli.quiet) {
        eprintln!("⚠️  {:#}", e);
    }
    info!("Starting RepoWarden v{}", env!("CARGO_PKG_VERSION"));

    for problem in config.problems() {
        warn!("Configuration: {}", problem);
    }

    let result = match cli.command {
        Commands::Init { .. } => Ok(0),
        Commands::Sync { dry_run } => cmd_sync(dry_run, config).await,
        Commands::List { details } => cmd_list(details, config).await,
        Commands::Daemon => cmd_daemon(config).await,
        Commands::Doctor => cmd_doctor(&config).await,
    };

    finish(result)
}

fn finish(result: Result<u8>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Initialize logging; `RUST_LOG` overrides everything else
fn init_logging(logging: &LoggingConfig, verbose: bool, quiet: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    let initialized = match logging.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        "pretty" => registry
            .with(fmt::layer().pretty().with_ansi(logging.color).with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(fmt::layer().compact().with_ansi(logging.color).with_writer(std::io::stderr))
            .try_init(),
    };

    initialized.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn cmd_init(config_path: Option<PathBuf>, force: bool) -> Result<u8> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    if path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", path.display());
        println!("   Use --force to overwrite it");
        return Ok(0);
    }

    Config::example()
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✅ RepoWarden initialized successfully!");
    println!("   Config: {}", path.display());
    println!("   Next: add sources and destinations, then run 'repowarden sync --dry-run'");
    Ok(0)
}

/// Sync repositories according to configuration
async fn cmd_sync(dry_run: bool, config: Config) -> Result<u8> {
    if dry_run {
        println!("🔍 Dry run: destinations will not be modified");
    }

    let engine = SyncEngine::new(config, RunContext::new(dry_run));
    let summary = engine.run().await;
    let stats = engine.context().stats();

    println!("\n🎉 Synchronization Complete!");
    println!("   📊 Total repositories: {}", summary.total_repositories);
    println!("   🚫 Filtered out: {}", stats.filtered);
    println!("   ✅ Successful operations: {}", summary.successful_operations);
    println!("   ❌ Failed operations: {}", summary.failed_operations);
    println!("   ⏭️  Skipped operations: {}", summary.skipped_operations);
    if stats.uploaded + stats.pruned > 0 {
        println!("   ☁️  Objects uploaded/pruned: {}/{}", stats.uploaded, stats.pruned);
    }
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.has_failures() {
        println!("\n🔍 Failed Operations:");
        for result in &summary.results {
            if let UnitOutcome::Failed(error) = &result.outcome {
                println!("   ❌ {} → {}: {}", result.repo, result.destination, error);
            }
        }
    }

    Ok(summary.exit_code() as u8)
}

/// List repositories that would be synced
async fn cmd_list(details: bool, config: Config) -> Result<u8> {
    let engine = SyncEngine::new(config, RunContext::new(true));
    let repos = engine.discover().await;

    println!("Repositories ({}):", repos.len());

    for repo in repos {
        if details {
            println!("📁 {} ({})", repo.full_name(), repo.hoster);
            if !repo.description.is_empty() {
                println!("   📝 {}", repo.description);
            }
            if let Some(parent) = &repo.companion_of {
                println!("   📖 Companion of {}", parent);
            }
            if repo.private {
                println!("   🔒 Private");
            }
            println!("   🔗 {}", repo.clone_url());
            println!();
        } else {
            println!("  📁 {}", repo.full_name());
        }
    }

    Ok(0)
}

async fn cmd_daemon(config: Config) -> Result<u8> {
    let daemon = Daemon::new(config)?;
    println!("🚀 Starting RepoWarden daemon (Ctrl+C to stop)");
    daemon.run().await?;

    let status = daemon.status();
    println!(
        "🛑 Daemon stopped after {} runs ({} with failures)",
        status.total_syncs, status.failed_syncs
    );
    Ok(0)
}

/// System health check and diagnostics
async fn cmd_doctor(config: &Config) -> Result<u8> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);
    Ok(if health.all_passed() { 0 } else { 1 })
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 RepoWarden System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
