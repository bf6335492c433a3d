//! VaultDrop CLI - upload, download, and archive encrypted transfers.
//!
//! Thin front end over the storage gateway and archive engine. All state
//! lives in the remote store; the only local artifacts are the config file
//! and the salt file.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vaultdrop_archive::{assemble, ArchiveConfig};
use vaultdrop_common::{ByteStream, EncryptionPolicy, TransferId};
use vaultdrop_crypto::{CryptoEngine, EngineConfig};
use vaultdrop_storage::{
    FileUpload, MultipartStorage, ObjectStorage, S3Config, S3Provider, PART_SIZE,
};

#[derive(Parser)]
#[command(name = "vaultdrop")]
#[command(about = "VaultDrop - Encrypted transfer storage")]
#[command(version)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(short, long, default_value = "vaultdrop.json")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files to a transfer.
    Upload {
        /// Transfer identifier.
        #[arg(short, long)]
        transfer: String,

        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Upload every file in a directory, in parallel.
    UploadDir {
        /// Transfer identifier.
        #[arg(short, long)]
        transfer: String,

        /// Directory to upload.
        dir: PathBuf,

        /// Concurrent uploads per wave.
        #[arg(long, default_value_t = 3)]
        concurrency: usize,
    },

    /// Download one file from a transfer.
    Download {
        /// Transfer identifier.
        #[arg(short, long)]
        transfer: String,

        /// File name within the transfer.
        name: String,

        /// Output path; defaults to the file name.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Assemble a transfer into a zip archive.
    Archive {
        /// Transfer identifier.
        #[arg(short, long)]
        transfer: String,

        /// Output zip path.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List the files stored under a transfer.
    List {
        /// Transfer identifier.
        #[arg(short, long)]
        transfer: String,
    },

    /// Print the master key as hex, for persisting an ephemeral key.
    ExportMasterKey,
}

/// On-disk configuration: cipher engine, store connection, policy.
#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    #[serde(default)]
    engine: EngineConfig,
    s3: Option<S3Config>,
    #[serde(default)]
    policy: EncryptionPolicy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Upload { transfer, files } => cmd_upload(&config, &transfer, files).await,
        Commands::UploadDir {
            transfer,
            dir,
            concurrency,
        } => cmd_upload_dir(&config, &transfer, &dir, concurrency).await,
        Commands::Download {
            transfer,
            name,
            output,
        } => cmd_download(&config, &transfer, &name, output).await,
        Commands::Archive { transfer, output } => cmd_archive(&config, &transfer, &output).await,
        Commands::List { transfer } => cmd_list(&config, &transfer).await,
        Commands::ExportMasterKey => cmd_export_master_key(&config),
    }
}

fn load_config(path: &Path) -> Result<CliConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CliConfig::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read config {}", path.display())),
    }
}

fn build_engine(config: &CliConfig) -> Result<Arc<CryptoEngine>> {
    Ok(Arc::new(
        CryptoEngine::from_config(&config.engine).context("Failed to build cipher engine")?,
    ))
}

fn build_storage(config: &CliConfig) -> Result<Arc<ObjectStorage>> {
    let s3 = config
        .s3
        .as_ref()
        .context("No [s3] section in the config file")?;
    let provider: Arc<dyn MultipartStorage> =
        Arc::new(S3Provider::new(s3.clone()).context("Failed to build S3 provider")?);
    let engine = match config.policy {
        EncryptionPolicy::Disabled => None,
        _ => Some(build_engine(config)?),
    };
    Ok(Arc::new(ObjectStorage::new(provider, engine, config.policy)))
}

fn parse_transfer(raw: &str) -> Result<TransferId> {
    TransferId::new(raw).context("Invalid transfer id")
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

fn file_stream(file: tokio::fs::File) -> ByteStream {
    Box::pin(ReaderStream::new(file).map(|item| item.map_err(vaultdrop_common::Error::from)))
}

async fn cmd_upload(config: &CliConfig, transfer: &str, files: Vec<PathBuf>) -> Result<()> {
    let storage = build_storage(config)?;
    let transfer = parse_transfer(transfer)?;

    for path in files {
        let name = file_name(&path)?;
        let size = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len();

        let meta = if size as usize > PART_SIZE {
            info!("Uploading {} ({} bytes) via multipart", name, size);
            let file = tokio::fs::File::open(&path).await?;
            storage
                .upload_large(&transfer, &name, file_stream(file))
                .await?
        } else {
            let data = tokio::fs::read(&path).await?;
            storage.upload(&transfer, &name, Bytes::from(data)).await?
        };
        println!(
            "Uploaded {} -> {} ({} bytes, encrypted: {})",
            name, meta.key, meta.size, meta.encrypted
        );
    }
    Ok(())
}

async fn cmd_upload_dir(
    config: &CliConfig,
    transfer: &str,
    dir: &Path,
    concurrency: usize,
) -> Result<()> {
    let storage = build_storage(config)?;
    let transfer = parse_transfer(transfer)?;

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Cannot read directory {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let data = tokio::fs::read(entry.path()).await?;
        files.push(FileUpload {
            name: file_name(&entry.path())?,
            data: Bytes::from(data),
            content_type: None,
        });
    }
    if files.is_empty() {
        bail!("No files found in {}", dir.display());
    }

    let total = files.len();
    let outcomes = storage
        .upload_files_parallel(&transfer, files, concurrency)
        .await;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.error {
            None => println!("Uploaded {}", outcome.name),
            Some(e) => {
                failed += 1;
                eprintln!("Failed   {}: {}", outcome.name, e);
            }
        }
    }
    println!("{}/{} files uploaded", total - failed, total);
    if failed > 0 {
        bail!("{} upload(s) failed", failed);
    }
    Ok(())
}

async fn cmd_download(
    config: &CliConfig,
    transfer: &str,
    name: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let storage = build_storage(config)?;
    let transfer = parse_transfer(transfer)?;
    let output = output.unwrap_or_else(|| PathBuf::from(name));

    let mut stream = storage.download(&transfer, name).await?;
    let mut file = tokio::fs::File::create(&output)
        .await
        .with_context(|| format!("Cannot create {}", output.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    println!("Downloaded {} -> {} ({} bytes)", name, output.display(), written);
    Ok(())
}

async fn cmd_archive(config: &CliConfig, transfer: &str, output: &Path) -> Result<()> {
    let storage = build_storage(config)?;
    let transfer = parse_transfer(transfer)?;

    let archive = assemble(storage, &transfer, ArchiveConfig::default()).await?;
    info!(
        "Assembling archive, estimated size {} bytes",
        archive.estimated_size
    );

    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("Cannot create {}", output.display()))?;
    let mut stream = archive.stream;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    match archive.summary.await {
        Ok(summary) => {
            println!(
                "Archive written: {} ({} bytes, {} files)",
                output.display(),
                written,
                summary.written.len()
            );
            for omitted in &summary.omitted {
                eprintln!("Omitted {}: {}", omitted.name, omitted.reason);
            }
            if !summary.omitted.is_empty() {
                bail!("{} file(s) omitted from the archive", summary.omitted.len());
            }
        }
        Err(_) => bail!("Archive job aborted before finishing"),
    }
    Ok(())
}

async fn cmd_list(config: &CliConfig, transfer: &str) -> Result<()> {
    let storage = build_storage(config)?;
    let transfer = parse_transfer(transfer)?;

    let objects = storage.list(&transfer).await?;
    if objects.is_empty() {
        println!("Transfer {} holds no files.", transfer);
        return Ok(());
    }

    println!("Files in transfer {}:", transfer);
    for meta in &objects {
        let lock = if meta.encrypted { "[enc]  " } else { "[plain]" };
        println!("  {} {} ({} bytes)", lock, meta.name, meta.size);
    }

    // Presigned links are the handoff mechanism for direct downloads.
    for meta in &objects {
        let url = storage
            .signed_url(&meta.key, Duration::from_secs(3600))
            .await?;
        println!("  {} -> {}", meta.name, url);
    }
    Ok(())
}

fn cmd_export_master_key(config: &CliConfig) -> Result<()> {
    let engine = build_engine(config)?;
    println!("{}", engine.export_master_key());
    eprintln!("Store this in the config as engine.master_key_hex to reuse the key.");
    Ok(())
}
