//! capture-sequence: rebuild sequences in an image description file.
//!
//! Reads the description file produced by the decomposition passes, splits
//! the images into sequences, drops duplicates and anomalies and writes the
//! file back with an updated `Information` summary.
//!
//! Configuration is loaded from `/etc/capture-kit/sequencer.*`,
//! `config/sequencer.*` and `SEQUENCER__*` environment variables; command
//! line flags override it.

use anyhow::{bail, Context, Result};
use capture_sequencer::config::LoggingConfig;
use capture_sequencer::{
    process_description_file, read_description_file, write_description_file, SequencerConfig,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DESCRIPTION_FILE: &str = "capture_description.json";

#[derive(Parser)]
#[command(name = "capture-sequence")]
#[command(about = "Split geotagged images into sequences and filter anomalies")]
#[command(version)]
struct Cli {
    /// Directory holding the images.
    import_path: PathBuf,

    /// Description file to read (`-` for stdin). Defaults to <import_path>/capture_description.json.
    #[arg(long)]
    desc_path: Option<PathBuf>,

    /// Where to write the result (`-` for stdout). Defaults to the input file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Distance in meters that starts a new sequence.
    #[arg(long)]
    cutoff_distance: Option<f64>,

    /// Time gap in seconds that starts a new sequence.
    #[arg(long)]
    cutoff_time: Option<f64>,

    /// Recompute every heading from the track.
    #[arg(long)]
    interpolate_directions: bool,

    /// Treat all images as one stream instead of one per directory.
    #[arg(long)]
    skip_subfolders: bool,

    /// Account email used for photo identifiers.
    #[arg(long)]
    email: Option<String>,

    /// Exit non-zero when any image failed.
    #[arg(long)]
    fail_on_errors: bool,
}

impl Cli {
    fn apply(&self, config: &mut SequencerConfig) {
        if let Some(distance) = self.cutoff_distance {
            config.sequence.cutoff_distance_m = distance;
        }
        if let Some(time) = self.cutoff_time {
            config.sequence.cutoff_time_secs = time;
        }
        if self.interpolate_directions {
            config.sequence.interpolate_directions = true;
        }
        if self.skip_subfolders {
            config.sequence.skip_subfolders = true;
        }
        if let Some(email) = &self.email {
            config.account.email = Some(email.clone());
        }
        if self.fail_on_errors {
            config.skip_process_errors = false;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SequencerConfig::load().context("Failed to load configuration")?;
    cli.apply(&mut config);

    init_logging(&config.logging)?;
    config.validate()?;

    if !cli.import_path.is_dir() {
        bail!("import directory {} does not exist", cli.import_path.display());
    }

    let desc_path = cli
        .desc_path
        .clone()
        .unwrap_or_else(|| cli.import_path.join(DEFAULT_DESCRIPTION_FILE));
    let output = cli.output.clone().unwrap_or_else(|| desc_path.clone());

    info!(
        service = "capture-sequence",
        version = env!("CARGO_PKG_VERSION"),
        desc_path = %desc_path.display(),
        "Sequencing images"
    );

    let input = read_description_file(&desc_path)
        .with_context(|| format!("Failed to read {}", desc_path.display()))?;
    let outcome = process_description_file(input, &config);

    write_description_file(&output, &outcome.file)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if let Some(summary) = outcome.summary() {
        info!(
            "Information\n{}",
            serde_json::to_string_pretty(summary).context("Failed to render summary")?
        );
    }

    if outcome.has_failures() {
        let failed = outcome.summary().map_or(0, |s| s.failed_images);
        if config.skip_process_errors {
            warn!(failed = failed, "Skipping failed images");
        } else {
            bail!(
                "failed to process {} images, check {} for details",
                failed,
                output.display()
            );
        }
    }

    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("capture_sequencer={}", level).parse()?)
        .add_directive(format!("capture_sequence={}", level).parse()?);

    // logs go to stderr so `--output -` stays clean JSON
    let subscriber = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
