//! Sealdrop - authenticated peer-to-peer file transfer

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sealdrop_client::config::{expand_path, Config};
use sealdrop_client::{diagnostics, loopback};
use sealdrop_core::crypto::b64_encode;
use sealdrop_core::link::{generate_link, unix_now};
use sealdrop_core::{ConnectionLink, FileSource, IceCandidate, Identity, Role};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sealdrop")]
#[command(about = "Authenticated, encrypted peer-to-peer file transfer", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.sealdrop/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and the host identity
    Init,

    /// Show the host identity's public key
    Identity,

    /// Create a signed connection link
    Link {
        /// Relay payload handed to the peer (e.g. a signaling URL)
        #[arg(required = true)]
        relay: String,

        /// Link lifetime in seconds (overrides config)
        #[arg(short, long)]
        expiry: Option<u64>,
    },

    /// Validate and decode a connection link
    Inspect {
        #[arg(required = true)]
        link: String,
    },

    /// Transfer a file to an in-process peer over the memory transport
    SendLocal {
        /// File to send
        #[arg(required = true)]
        file: String,

        /// Where the receiver writes the file
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Guess whether a VPN or proxy hides local interfaces, from ICE
    /// candidate lines on stdin
    NetCheck {
        /// Collection window in milliseconds
        #[arg(short, long, default_value = "1500")]
        window_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);

    match cli.command {
        Commands::Init => init_config(&config_path)?,
        Commands::Identity => {
            let config = Config::load_or_default(&config_path)?;
            show_identity(&config)?;
        }
        Commands::Link { relay, expiry } => {
            let config = Config::load_or_default(&config_path)?;
            create_link(&config, &relay, expiry)?;
        }
        Commands::Inspect { link } => inspect_link(&link)?,
        Commands::SendLocal { file, output } => {
            let config = Config::load_or_default(&config_path)?;
            send_local(&config, &file, output.as_deref()).await?;
        }
        Commands::NetCheck { window_ms } => {
            net_check(Duration::from_millis(window_ms)).await?;
        }
    }

    Ok(())
}

fn init_config(config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        Config::load(config_path)?
    } else {
        let config = Config::default();
        config.save(config_path)?;
        tracing::info!("Wrote config: {}", config_path.display());
        config
    };

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let identity = load_identity(&config)?;

    println!("Initialized Sealdrop at: {}", data_dir.display());
    println!("Host key: {}", identity.public_key_b64());
    Ok(())
}

fn load_identity(config: &Config) -> Result<Identity> {
    let path = config.identity_path();
    Identity::load_or_create(Role::Host, &path)
        .with_context(|| format!("loading identity from {}", path.display()))
}

fn show_identity(config: &Config) -> Result<()> {
    let identity = load_identity(config)?;
    println!("Role: {}", identity.role());
    println!("Public key: {}", identity.public_key_b64());
    println!("Identity file: {}", config.identity_path().display());
    Ok(())
}

fn create_link(config: &Config, relay: &str, expiry: Option<u64>) -> Result<()> {
    let identity = load_identity(config)?;
    let expiry = expiry.unwrap_or(config.link.expiry_secs);
    let link = generate_link(Some(&identity), relay.as_bytes(), expiry)?;

    tracing::info!("Link valid for {}s", expiry);
    println!("{}", link);
    Ok(())
}

fn inspect_link(link: &str) -> Result<()> {
    let parsed = ConnectionLink::parse(link)?;

    println!("Version: {}", parsed.version);
    println!("Host key: {}", b64_encode(parsed.host_public_key.as_bytes()));
    match parsed.relay_str() {
        Some(relay) => println!("Relay: {}", relay),
        None => println!("Relay (hex): {}", hex::encode(&parsed.relay_payload)),
    }
    println!(
        "Expires: {} ({}s remaining)",
        parsed.expiry,
        parsed.expiry.saturating_sub(unix_now())
    );
    println!("Signature: valid");
    Ok(())
}

async fn send_local(config: &Config, file: &str, output: Option<&str>) -> Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let source = FileSource::open(path).await?;
    let output = match output {
        Some(output) => PathBuf::from(output),
        None => config
            .data_dir()
            .join("downloads")
            .join(&source.meta().name),
    };
    let identity = load_identity(config)?;

    let mut last_percent = None;
    let report = loopback::send_local(config, identity, source, &output, |done, total| {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        if last_percent.map_or(true, |last| percent >= last + 10 || percent == 100) {
            println!("Progress: {}% ({}/{} bytes)", percent, done, total);
            last_percent = Some(percent);
        }
    })
    .await?;

    if let Some(fingerprint) = report.fingerprint {
        println!("Fingerprint: {}", fingerprint);
    }
    println!(
        "Received: {} ({} bytes, {} chunks)",
        report.output.display(),
        report.bytes,
        report.chunks
    );
    println!("Hash: {}", report.content_hash);
    Ok(())
}

async fn net_check(window: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Accept either raw candidate lines or RTCIceCandidate JSON
            let candidate = if line.starts_with('{') {
                match serde_json::from_str::<IceCandidate>(line) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        tracing::warn!("Skipping malformed candidate: {}", e);
                        continue;
                    }
                }
            } else {
                IceCandidate::new(line)
            };
            if tx.send(candidate).is_err() {
                break;
            }
        }
    });

    let summary = diagnostics::probe(&mut rx, window).await;
    println!(
        "Candidates: {} (host {}, srflx {}, relay {})",
        summary.total, summary.host, summary.srflx, summary.relay
    );
    if summary.suspect_interference() {
        println!("A VPN or proxy may be interfering with direct connections");
    } else {
        println!("Network path looks normal");
    }
    Ok(())
}
