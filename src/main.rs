use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tensile::{mesher, post_processor, ExportFormat};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Csv => ExportFormat::Csv,
            Format::Json => ExportFormat::Json,
        }
    }
}

/// Plane-stress analysis of a rectangular plate pulled along its right edge
#[derive(Debug, Parser)]
#[command(name = "tensile", version)]
struct Cli {
    /// Path to the input JSON
    input: PathBuf,

    /// Directory that receives the results
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(short, long, value_enum, default_value = "csv")]
    format: Format,

    /// Overrides `geometry.elements_x`
    #[arg(long)]
    elements_x: Option<usize>,

    /// Overrides `geometry.elements_y`
    #[arg(long)]
    elements_y: Option<usize>,

    /// Hide progress bars
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        error!(stage = err.stage(), "{err}");
        std::process::exit(1)
    }
}

fn run(cli: &Cli) -> tensile::Result<()> {
    let input = cli.input.to_string_lossy();
    let mut config = mesher::load_problem(&input)?;

    if let Some(elements_x) = cli.elements_x {
        config.elements_x = elements_x;
    }
    if let Some(elements_y) = cli.elements_y {
        config.elements_y = elements_y;
    }
    config.solver.show_progress = !cli.quiet;

    info!(
        "solving {}x{} plate with {}x{} elements",
        config.length_x, config.length_y, config.elements_x, config.elements_y
    );
    let solution = tensile::run(&config)?;

    post_processor::export(&solution, &cli.output_dir, cli.format.into())?;

    Ok(())
}
