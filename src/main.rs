use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use syscom_import::{
    init_logging, CsvSanitizer, DownloadLedger, ImportConfig, ImportPipeline, LoggingConfig,
    RepairStrategy,
};

#[derive(Parser, Debug)]
#[command(name = "syscom-import", version, about = "Syscom product catalog import")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one import: ledger check, fetch, sanitize, reconcile
    Run {
        #[arg(long, default_value = "syscom_import.toml")]
        config: PathBuf,
    },

    /// Repair a CSV file in place (original kept as <FILE>_bak)
    Sanitize {
        file: PathBuf,

        #[arg(long, default_value = "excise")]
        strategy: RepairStrategy,
    },

    /// Show recent ledger entries
    Ledger {
        /// Read the database path from this config
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "syscom_catalog.db")]
        db: PathBuf,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run_import(&config),
        Command::Sanitize { file, strategy } => run_sanitize(&file, strategy),
        Command::Ledger {
            config,
            db,
            limit,
            json,
        } => show_ledger(config, db, limit, json),
    }
}

fn run_import(config_path: &PathBuf) -> Result<()> {
    let config = ImportConfig::from_toml_file(config_path)?;
    init_logging(&config.logging);

    println!("📦 Syscom Catalog Import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut pipeline = ImportPipeline::open(config)?;
    let outcome = pipeline.run_import();

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if outcome.success {
        println!("✅ {}", outcome.message);
        Ok(())
    } else {
        eprintln!("❌ {}", outcome.message);
        std::process::exit(1);
    }
}

fn run_sanitize(file: &PathBuf, strategy: RepairStrategy) -> Result<()> {
    init_logging(&LoggingConfig::default());

    println!("🧹 Sanitizing {}...", file.display());
    let report = CsvSanitizer::new(strategy).sanitize(file)?;

    println!("✓ {}", report.summary());
    println!("✓ Backup: {}", report.backup_path.display());
    Ok(())
}

fn show_ledger(config: Option<PathBuf>, db: PathBuf, limit: usize, json: bool) -> Result<()> {
    let db_path = match config {
        Some(path) => ImportConfig::from_toml_file(&path)?.database_path,
        None => db,
    };

    let ledger = DownloadLedger::open(&db_path)
        .with_context(|| format!("Failed to open ledger at {}", db_path.display()))?;
    let entries = ledger.recent(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("📒 Ledger ({} most recent)", entries.len());
    for entry in &entries {
        println!(
            "  {} | {:<5} | {:>10} | {} | {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.action.as_str(),
            entry.size_label,
            entry.categories,
            entry.file_path.display()
        );
    }
    Ok(())
}
