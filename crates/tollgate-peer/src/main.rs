//! Tollgate - payment-gated P2P blob distribution

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tollgate_core::channel::memory::MemoryHub;
use tollgate_core::wallet::mock::MockWallet;
use tollgate_core::{hash_to_hex, pricing, PaymentMode, PeerId};
use tollgate_peer::{BandwidthLedger, BlobStore, Config, PeerManager};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(about = "Payment-gated P2P blob distribution", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.tollgate/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Data directory
    #[arg(short, long, default_value = "~/.tollgate")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// Quote the bandwidth price for a payload
    Price {
        /// Payload size in bytes
        #[arg(required = true)]
        size: u64,

        /// Rate in sats per GiB
        #[arg(short, long, default_value = "100")]
        rate: u64,
    },

    /// Show per-peer bandwidth statistics
    Stats {
        /// Maximum number of peers to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Clear all bandwidth statistics
    ClearStats,

    /// Add a file to the local blob store
    Add {
        /// Path to the file
        #[arg(required = true)]
        file: String,
    },

    /// List locally stored blobs
    List,

    /// Run a full paid transfer between two in-process peers
    Demo {
        /// File to transfer
        #[arg(required = true)]
        file: String,

        /// Gate the transfer with prepay instead of postpay
        #[arg(long)]
        prepay: bool,

        /// Provider rate in sats per GiB
        #[arg(short, long, default_value = "100")]
        rate: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Init => init_config(&cli.data_dir)?,
        Commands::Price { size, rate } => {
            println!("{} sat", pricing::price(size, rate));
        }
        Commands::Stats { limit } => show_stats(&cli.data_dir, limit)?,
        Commands::ClearStats => clear_stats(&cli.data_dir)?,
        Commands::Add { file } => add_blob(&cli.data_dir, &file)?,
        Commands::List => list_blobs(&cli.data_dir)?,
        Commands::Demo { file, prepay, rate } => run_demo(&file, prepay, rate).await?,
    }

    Ok(())
}

fn expand_path(path: &str) -> PathBuf {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

fn init_config(data_dir: &str) -> Result<()> {
    let dir = expand_path(data_dir);
    std::fs::create_dir_all(&dir)?;

    let config_path = dir.join("config.toml");
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    let config = Config::default();
    let toml = toml::to_string_pretty(&config)?;
    std::fs::write(&config_path, toml)?;
    std::fs::create_dir_all(dir.join("blobs"))?;

    println!("Initialized tollgate at: {}", dir.display());
    Ok(())
}

fn open_ledger(data_dir: &str) -> Result<BandwidthLedger> {
    let dir = expand_path(data_dir);
    std::fs::create_dir_all(&dir)?;
    Ok(BandwidthLedger::open(&dir.join("ledger.db"))?)
}

fn show_stats(data_dir: &str, limit: usize) -> Result<()> {
    let ledger = open_ledger(data_dir)?;
    let stats = ledger.list(limit);

    if stats.is_empty() {
        println!("No bandwidth statistics recorded yet.");
        return Ok(());
    }

    for s in stats {
        println!("{}", s.identity);
        println!(
            "  events: {} sent ({} B), {} received ({} B)",
            s.events_sent, s.event_bytes_sent, s.events_received, s.event_bytes_received
        );
        println!(
            "  blobs:  {} sent ({} B), {} received ({} B)",
            s.blobs_sent, s.blob_bytes_sent, s.blobs_received, s.blob_bytes_received
        );
        println!("  last seen: {}", s.last_seen);
    }
    Ok(())
}

fn clear_stats(data_dir: &str) -> Result<()> {
    let ledger = open_ledger(data_dir)?;
    ledger.clear_all()?;
    println!("Cleared all bandwidth statistics.");
    Ok(())
}

fn add_blob(data_dir: &str, file: &str) -> Result<()> {
    let path = std::path::Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let store = BlobStore::new(expand_path(data_dir).join("blobs"));
    store.load_all()?;
    let (hash, size) = store.add_file(path)?;

    println!("Added: {}", path.display());
    println!("Hash: {}", hash_to_hex(&hash));
    println!("Size: {} bytes", size);
    Ok(())
}

fn list_blobs(data_dir: &str) -> Result<()> {
    let store = BlobStore::new(expand_path(data_dir).join("blobs"));
    let count = store.load_all()?;

    if count == 0 {
        println!("No blobs stored. Use `tollgate add <file>` to add one.");
        return Ok(());
    }

    for (hash, size) in store.list() {
        println!("{}  {} bytes", hash_to_hex(&hash), size);
    }
    Ok(())
}

/// Two in-process peers on the memory transport run a complete
/// payment-gated transfer, then print what the ledgers saw.
async fn run_demo(file: &str, prepay: bool, rate: u64) -> Result<()> {
    let path = std::path::Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let hub = MemoryHub::new();
    let provider_id = PeerId::new("demo-provider");
    let requester_id = PeerId::new("demo-requester");

    let scratch = std::env::temp_dir().join(format!("tollgate-demo-{}", std::process::id()));

    let mut provider_config = Config::default();
    provider_config.pricing.rate_per_gb = rate;

    let provider = PeerManager::new(
        hub.endpoint(provider_id.as_str()),
        MockWallet::new(),
        Arc::new(BlobStore::new(scratch.join("provider-blobs"))),
        Arc::new(BandwidthLedger::open_in_memory()?),
        &provider_config,
    );
    let requester = PeerManager::new(
        hub.endpoint(requester_id.as_str()),
        MockWallet::new(),
        Arc::new(BlobStore::new(scratch.join("requester-blobs"))),
        Arc::new(BandwidthLedger::open_in_memory()?),
        &Config::default(),
    );
    provider.start();
    requester.start();

    let (hash, size) = provider.store().add_file(path)?;
    let mode = if prepay {
        PaymentMode::Prepay
    } else {
        PaymentMode::Postpay
    };

    println!("Blob:  {} ({} bytes)", hash_to_hex(&hash), size);
    println!("Price: {} sat at {} sat/GiB ({})", pricing::price(size, rate), rate, mode);

    // The external signaling layer would normally drive both ends; here
    // we simply connect them toward each other.
    provider.connect(&requester_id).await?;
    requester.connect(&provider_id).await?;

    let data = requester
        .request_blob(&provider_id, &hash, Some(size), mode, None)
        .await?;

    println!("Transferred and verified {} bytes.", data.len());

    if let Some(stats) = requester.ledger().get(&provider_id) {
        println!(
            "Requester ledger: {} blobs / {} bytes received from provider",
            stats.blobs_received, stats.blob_bytes_received
        );
    }
    if let Some(stats) = provider.ledger().get(&requester_id) {
        println!(
            "Provider ledger:  {} blobs / {} bytes sent to requester",
            stats.blobs_sent, stats.blob_bytes_sent
        );
    }

    let _ = std::fs::remove_dir_all(&scratch);
    Ok(())
}
