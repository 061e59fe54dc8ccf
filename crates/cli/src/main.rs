//! `sensorlake`: ingests sensor CSV exports into a partitioned store,
//! skipping files that were already ingested at their current mtime.

mod config;
mod csv;
mod discover;
mod engine;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use config::{ByteSize, IngestConfig};
use engine::{Attribution, FileOutcome, Ingestor};

#[derive(Debug, Parser)]
#[command(name = "sensorlake", version, about)]
struct Cli {
    /// TOML settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug). `RUST_LOG` takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest every matching CSV under a directory.
    Ingest(IngestArgs),
    /// Print the parameter master (id, name, unit) of one CSV.
    Params {
        csv: PathBuf,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Directory laid out as `<plant>/<machine>/<file>.csv`.
    source: PathBuf,

    #[arg(long)]
    storage_root: Option<PathBuf>,

    #[arg(long)]
    ledger: Option<PathBuf>,

    /// File-name substring to match; repeatable. Replaces the configured list.
    #[arg(long = "pattern")]
    patterns: Vec<String>,

    #[arg(long)]
    workers: Option<usize>,

    /// Plant id for every file, instead of the directory name.
    #[arg(long, requires = "machine")]
    plant: Option<String>,

    /// Machine id for every file, instead of the directory name.
    #[arg(long, requires = "plant")]
    machine: Option<String>,

    /// e.g. `2GB`, `512MiB`.
    #[arg(long)]
    memory_limit: Option<ByteSize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Ingest(args) => ingest(cli.config.as_deref(), args),
        Command::Params { csv } => params(&csv),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn ingest(config_path: Option<&Path>, args: IngestArgs) -> Result<()> {
    let mut config = IngestConfig::load(config_path)?;
    if let Some(root) = args.storage_root {
        config.storage_root = root;
    }
    if let Some(ledger) = args.ledger {
        config.ledger_path = ledger;
    }
    if !args.patterns.is_empty() {
        config.patterns = args.patterns;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(limit) = args.memory_limit {
        config.memory_limit = limit;
    }
    config.validate()?;

    let attribution = match (args.plant, args.machine) {
        (Some(plant_id), Some(machine_id)) => Attribution::Fixed {
            plant_id,
            machine_id,
        },
        _ => Attribution::FromPath,
    };

    let ingestor = Ingestor::new(config).context("failed to open ingestion ledger")?;
    let report = ingestor.run(&args.source, &attribution)?;

    if report.files.is_empty() {
        println!("No target CSV files found.");
        return Ok(());
    }
    let source = std::fs::canonicalize(&args.source).unwrap_or(args.source);
    for (path, outcome) in &report.files {
        let name = path.strip_prefix(&source).unwrap_or(path).display();
        match outcome {
            FileOutcome::Skipped => println!("SKIP (up-to-date): {name}"),
            FileOutcome::Ingested {
                records,
                dropped,
                partitions,
            } => println!(
                "INGESTED: {name} ({records} records, {dropped} dropped, {partitions} partitions)"
            ),
            FileOutcome::Failed(e) => println!("FAILED: {name}: {e}"),
        }
    }
    println!(
        "{} ingested, {} skipped, {} failed",
        report.ingested(),
        report.skipped(),
        report.failed()
    );

    if report.failed() > 0 {
        bail!("{} file(s) failed", report.failed());
    }
    Ok(())
}

fn params(path: &Path) -> Result<()> {
    let header = csv::read_header_file(path)
        .with_context(|| format!("failed to read header of {}", path.display()))?;
    println!("# timestamp column: {}", header.timestamp_label);
    println!("param_id\tparam_name\tunit");
    for p in &header.parameters {
        println!("{}\t{}\t{}", p.id, p.name, p.unit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_ingest_flags() {
        let cli = Cli::try_parse_from([
            "sensorlake",
            "-vv",
            "ingest",
            "data",
            "--pattern",
            "Vib",
            "--pattern",
            "Tmp",
            "--workers",
            "3",
            "--memory-limit",
            "1GiB",
            "--plant",
            "P1",
            "--machine",
            "M1",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Ingest(args) = cli.command else {
            panic!("expected ingest");
        };
        assert_eq!(args.source, PathBuf::from("data"));
        assert_eq!(args.patterns, vec!["Vib", "Tmp"]);
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.memory_limit, Some(ByteSize(1 << 30)));
        assert_eq!(args.plant.as_deref(), Some("P1"));
    }

    #[test]
    fn plant_requires_machine() {
        assert!(Cli::try_parse_from(["sensorlake", "ingest", "data", "--plant", "P1"]).is_err());
    }

    #[test]
    fn bad_memory_limit_flag_is_rejected() {
        assert!(
            Cli::try_parse_from(["sensorlake", "ingest", "data", "--memory-limit", "big"])
                .is_err()
        );
    }

    #[test]
    fn params_subcommand() {
        let cli = Cli::try_parse_from(["sensorlake", "params", "x.csv"]).unwrap();
        assert!(matches!(cli.command, Command::Params { .. }));
    }
}
