use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;

use cellview::cellview::QueryFilter;
use cellview::segment::DefaultModelLoader;
use cellview::source::{TiffDirSource, TimedSource};
use cellview::{CancelToken, CellViewStore, RunAggregator, RunConfig};

#[derive(Parser)]
#[command(name = "cellview", about = "cellview CLI: run, export, delete-plate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment and quantify every image of a plate.
    Run(RunArgs),
    /// Write a plate's feature rows to CSV.
    Export(ExportArgs),
    /// Remove a plate and all of its results.
    DeletePlate(DeletePlateArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Root of the exported plate folders.
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    plate: i64,
    #[arg(long)]
    db: PathBuf,
    /// JSON run configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Reprocess images that already succeeded.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    workers: Option<usize>,
    /// Only these wells, e.g. --wells A1,B03
    #[arg(long, value_delimiter = ',')]
    wells: Option<Vec<String>>,
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    plate: i64,
    #[arg(long)]
    output: PathBuf,
    /// Leave out rows flagged by the quality gate.
    #[arg(long)]
    exclude_flagged: bool,
}

#[derive(Args)]
struct DeletePlateArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    plate: i64,
}

fn progress(prog: f64, msg: &str) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{}", serde_json::json!({"progress": prog, "message": msg}));
    let _ = stderr.flush();
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    config.force |= args.force;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.wells.is_some() {
        config.wells = args.wells;
    }

    let source = TimedSource::new(TiffDirSource::open(&args.source)?, config.source.timeout());
    let store = CellViewStore::open(&args.db)?;
    let summary = RunAggregator::new(&source, &store, &DefaultModelLoader).run(
        args.plate,
        &config,
        &CancelToken::new(),
        progress,
    )?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn export(args: ExportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = CellViewStore::open(&args.db)?;
    let filter = QueryFilter {
        exclude_flagged: args.exclude_flagged,
        ..QueryFilter::plate(args.plate)
    };
    let rows = store.export_csv(&filter, &args.output)?;
    progress(1.0, &format!("Wrote {} rows to {}", rows, args.output.display()));
    Ok(())
}

fn delete_plate(args: DeletePlateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = CellViewStore::open(&args.db)?;
    if !store.delete_plate(args.plate)? {
        return Err(format!("plate {} not in store", args.plate).into());
    }
    progress(1.0, &format!("Deleted plate {}", args.plate));
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args)?,
        Commands::Export(args) => export(args)?,
        Commands::DeletePlate(args) => delete_plate(args)?,
    }
    Ok(())
}
