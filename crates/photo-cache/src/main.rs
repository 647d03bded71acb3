//! photo-cache - offline maintenance for a photo wall disk cache
//!
//! Opens the disk tier directly, so it must not run while an application
//! holds the same cache directory.

use clap::{Parser, Subcommand};
use photo_cache::{CacheConfig, CacheCoordinator, CacheError, CacheMode, CacheValue, Result};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "photo-cache")]
#[command(about = "Inspect and maintain a photo wall disk cache")]
struct Cli {
    /// Cache directory (defaults to PHOTO_CACHE_DIR, then ./cache/photowall)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Disk budget in bytes; entries beyond it are evicted on open
    #[arg(long)]
    max_disk: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value
    Put {
        key: String,

        /// Store this string
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// Store the contents of this file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Parse --text as JSON and store it as a structured value
        #[arg(long, requires = "text")]
        json: bool,

        /// Store --file as an image with this MIME type
        #[arg(long, requires = "file")]
        content_type: Option<String>,

        /// Seconds until the value expires
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Print a value, or write it to a file
    Get {
        key: String,

        /// Write the payload here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a value
    Remove { key: String },

    /// Exit successfully if the key is cached
    Contains { key: String },

    /// Print entry counts and sizes as JSON
    Stats,

    /// Delete every entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env().add_directive("photo_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let cli = Cli::parse();

    // The memory tier would not outlive this process
    let mut config = CacheConfig::from_env_with(CacheMode::DiskOnly, cli.dir)?;
    if let Some(max_disk) = cli.max_disk {
        config.max_disk_bytes = max_disk;
    }
    info!("Cache dir: {:?}", config.disk_directory);

    let cache = CacheCoordinator::open(config).await?;
    let result = run(&cache, cli.command).await;
    cache.close().await?;
    result
}

async fn run(cache: &CacheCoordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            key,
            text,
            file,
            json,
            content_type,
            ttl_secs,
        } => {
            let value = match (text, file) {
                (Some(text), _) if json => CacheValue::Structured(serde_json::from_str(&text)?),
                (Some(text), _) => CacheValue::Text(text),
                (None, Some(path)) => {
                    let bytes = tokio::fs::read(&path).await?;
                    match content_type {
                        Some(content_type) => CacheValue::image(content_type, bytes),
                        None => CacheValue::Binary(bytes),
                    }
                }
                (None, None) => {
                    return Err(CacheError::Config(
                        "put needs --text or --file".to_string(),
                    ))
                }
            };
            match ttl_secs {
                Some(secs) => {
                    cache
                        .put_with_ttl(&key, value, Duration::from_secs(secs))
                        .await?
                }
                None => cache.put(&key, value).await?,
            }
            info!("Stored {}", key);
        }
        Commands::Get { key, output } => {
            let value = cache
                .get(&key)
                .await?
                .ok_or_else(|| CacheError::NotFound(key.clone()))?;
            let bytes = match value {
                CacheValue::Text(text) => text.into_bytes(),
                CacheValue::Structured(value) => serde_json::to_vec_pretty(&value)?,
                CacheValue::Binary(bytes) => bytes,
                CacheValue::Image(image) => {
                    info!("Content type: {}", image.content_type);
                    image.bytes
                }
            };
            match output {
                Some(path) => tokio::fs::write(&path, &bytes).await?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
            }
        }
        Commands::Remove { key } => {
            if !cache.remove(&key).await? {
                return Err(CacheError::NotFound(key));
            }
            info!("Removed {}", key);
        }
        Commands::Contains { key } => {
            if !cache.contains(&key) {
                return Err(CacheError::NotFound(key));
            }
            println!("{}", key);
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
        Commands::Clear => {
            cache.clear().await?;
            info!("Cache cleared");
        }
    }
    Ok(())
}
