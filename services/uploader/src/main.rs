//! capture-upload: archive and upload sequenced imagery.
//!
//! `upload` takes either an image directory (with its description file) or a
//! single zip produced by `zip`. Configuration is loaded from
//! `/etc/capture-kit/uploader.*`, `config/uploader.*` and `UPLOADER__*`
//! environment variables; command line flags override it.

use anyhow::{bail, Context, Result};
use capture_sequencer::read_image_descriptions;
use capture_uploader::config::LoggingConfig;
use capture_uploader::{zip_image_dir, BatchUploader, LoggingObserver, RawImageReader, UploaderConfig};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DESCRIPTION_FILE: &str = "capture_description.json";

#[derive(Parser)]
#[command(name = "capture-upload")]
#[command(about = "Archive and upload street-level imagery sequences")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an image directory or a sequence zip
    Upload(UploadArgs),
    /// Zip sequences without uploading them
    Zip(ZipArgs),
}

#[derive(Args)]
struct UploadArgs {
    /// Image directory, or a zip made by `zip`.
    import_path: PathBuf,

    /// Write chunks to the dry-run directory instead of the server.
    #[arg(long = "dry_run")]
    dry_run: bool,

    #[arg(long = "organization_key")]
    organization_key: Option<String>,

    #[arg(long = "project_key")]
    project_key: Option<String>,

    /// Description file. Defaults to <import_path>/capture_description.json.
    #[arg(long = "desc_path")]
    desc_path: Option<PathBuf>,
}

#[derive(Args)]
struct ZipArgs {
    /// Image directory.
    import_path: PathBuf,

    /// Where to write the archives.
    zip_dir: PathBuf,

    /// Description file. Defaults to <import_path>/capture_description.json.
    #[arg(long = "desc_path")]
    desc_path: Option<PathBuf>,
}

fn description_path(import_path: &Path, desc_path: &Option<PathBuf>) -> PathBuf {
    desc_path
        .clone()
        .unwrap_or_else(|| import_path.join(DEFAULT_DESCRIPTION_FILE))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = UploaderConfig::load().context("Failed to load configuration")?;
    if let Command::Upload(args) = &cli.command {
        if args.dry_run {
            config.upload.dry_run = true;
        }
        if args.organization_key.is_some() {
            config.account.organization_key = args.organization_key.clone();
        }
        if args.project_key.is_some() {
            config.account.project_key = args.project_key.clone();
        }
    }

    init_logging(&config.logging)?;
    config.validate()?;

    info!(
        service = "capture-upload",
        version = env!("CARGO_PKG_VERSION"),
        dry_run = config.upload.dry_run,
        "Starting"
    );

    match cli.command {
        Command::Upload(args) => upload(config, args).await,
        Command::Zip(args) => zip(config, args),
    }
}

async fn upload(config: UploaderConfig, args: UploadArgs) -> Result<()> {
    let uploader = BatchUploader::from_config(config)?.with_observer(Arc::new(LoggingObserver));

    if args.import_path.is_file() {
        let hash = uploader
            .upload_zip_file(&args.import_path)
            .await
            .with_context(|| format!("Failed to upload {}", args.import_path.display()))?;
        info!(hash = %hash, "Zip uploaded");
        return Ok(());
    }

    if !args.import_path.is_dir() {
        bail!("import path {} does not exist", args.import_path.display());
    }

    let desc_path = description_path(&args.import_path, &args.desc_path);
    let file = read_image_descriptions(&desc_path)
        .with_context(|| format!("Failed to read {}", desc_path.display()))?;

    let report = uploader
        .upload_image_dir_and_descriptions(&args.import_path, file)
        .await?;

    for failed in report.failed() {
        if let Err(e) = &failed.result {
            error!(sequence = %failed.sequence_uuid, images = failed.image_count, error = %e, "Not uploaded");
        }
    }
    if report.total() > 0 && report.succeeded() == 0 {
        bail!("no sequence could be uploaded");
    }
    Ok(())
}

fn zip(config: UploaderConfig, args: ZipArgs) -> Result<()> {
    if !args.import_path.is_dir() {
        bail!("import directory {} does not exist", args.import_path.display());
    }

    let desc_path = description_path(&args.import_path, &args.desc_path);
    let file = read_image_descriptions(&desc_path)
        .with_context(|| format!("Failed to read {}", desc_path.display()))?;

    let archives = zip_image_dir(
        &args.import_path,
        &file,
        &args.zip_dir,
        &config.upload.archive_prefix,
        &RawImageReader,
    )
    .with_context(|| format!("Failed to zip {}", args.import_path.display()))?;

    for archive in &archives {
        info!(
            sequence = %archive.sequence_uuid,
            archive = %archive.path.display(),
            images = archive.image_count,
            size_mib = format!("{:.2}", archive.size_mib()),
            "Archive ready"
        );
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
        .add_directive(format!("capture_uploader={}", level).parse()?)
        .add_directive(format!("capture_upload={}", level).parse()?)
        .add_directive(format!("capture_sequencer={}", level).parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}
