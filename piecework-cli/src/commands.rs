//! CLI command implementations

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use piecework_core::config::PieceworkConfig;
use piecework_core::engine::{EngineHandle, spawn_engine};
use piecework_core::torrent::{
    InfoHash, MetainfoParser, PeerPool, TorrentCreator, TorrentStatus,
};
use tracing::{info, warn};

/// Interval between progress reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download (and seed) one or more torrents
    Download {
        /// Paths to `.torrent` files
        #[arg(required = true)]
        torrents: Vec<PathBuf>,
        /// Directory data is written below
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Port to accept peers on
        #[arg(short, long)]
        port: Option<u16>,
        /// Peer to connect to, as ip:port or host:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Keep seeding after every torrent is complete
        #[arg(long)]
        seed: bool,
        /// Print progress as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Create a `.torrent` file from a file or directory
    Create {
        /// File or directory to describe
        path: PathBuf,
        /// Where to write the `.torrent` file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Piece length in bytes
        #[arg(long, default_value_t = piecework_core::torrent::creation::DEFAULT_PIECE_LENGTH)]
        piece_length: u32,
        /// Announce URL (repeatable)
        #[arg(long = "announce")]
        announce_urls: Vec<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of whichever step failed, with context for the user
pub async fn handle_command(command: Commands, config: PieceworkConfig) -> anyhow::Result<()> {
    match command {
        Commands::Download {
            torrents,
            output,
            port,
            peers,
            seed,
            json,
        } => {
            let mut config = config;
            if let Some(output) = output {
                config.storage.download_dir = output;
            }
            if let Some(port) = port {
                config.network.listen_port = port;
            }
            config.network.bootstrap_peers.extend(peers);
            download(config, &torrents, seed, json).await
        }
        Commands::Create {
            path,
            output,
            piece_length,
            announce_urls,
        } => create(&path, output, piece_length, announce_urls).await,
    }
}

/// Runs the engine until every torrent is done, or until Ctrl-C when seeding.
///
/// # Errors
/// - Torrent file unreadable or malformed
/// - Listener could not be bound
/// - Download directory could not be prepared
pub async fn download(
    config: PieceworkConfig,
    torrent_paths: &[PathBuf],
    seed: bool,
    json: bool,
) -> anyhow::Result<()> {
    let download_dir = config.storage.download_dir.clone();
    tokio::fs::create_dir_all(&download_dir)
        .await
        .with_context(|| format!("cannot create {}", download_dir.display()))?;

    let source = PeerPool::new(&config.network.bootstrap_peers, &config.network);
    let handle = spawn_engine(config, Box::new(source))
        .await
        .context("failed to start engine")?;
    println!("Listening on {}", handle.local_addr());

    for path in torrent_paths {
        let metainfo = MetainfoParser::parse_file(path)
            .await
            .with_context(|| format!("cannot load {}", path.display()))?;
        let name = metainfo.name.clone();
        let info_hash = handle.add_torrent(metainfo, &download_dir).await?;
        println!("Added {name} ({info_hash})");
    }

    let result = report_until_done(&handle, seed, json).await;
    handle.shutdown().await?;
    result
}

async fn report_until_done(handle: &EngineHandle, seed: bool, json: bool) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(REPORT_INTERVAL);
    let mut announced_done: Vec<InfoHash> = Vec::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Cannot listen for Ctrl-C");
                }
                info!("Interrupted, shutting down");
                return Ok(());
            }
        }

        let statuses = handle.statuses().await?;
        for status in &statuses {
            print_status(status, json)?;
            if status.is_done() && !announced_done.contains(&status.info_hash) {
                announced_done.push(status.info_hash);
                info!(info_hash = %status.info_hash, name = %status.name, "Torrent complete");
            }
        }

        if !seed && statuses.iter().all(TorrentStatus::is_done) {
            println!("All torrents complete");
            return Ok(());
        }
    }
}

fn print_status(status: &TorrentStatus, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
        return Ok(());
    }

    let percent = if status.piece_count == 0 {
        100.0
    } else {
        status.pieces_have as f64 * 100.0 / status.piece_count as f64
    };
    println!(
        "{:<24} {:>9} {:>6.1}%  peers {}/{}  down {:.1} KiB/s  up {:.1} KiB/s",
        truncate(&status.name, 24),
        status.state,
        percent,
        status.established,
        status.peers,
        status.download_rate / 1024.0,
        status.upload_rate / 1024.0,
    );
    Ok(())
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_string()
    } else {
        let mut short: String = name.chars().take(width - 1).collect();
        short.push('~');
        short
    }
}

/// Hashes local content and writes a `.torrent` file next to it.
///
/// # Errors
/// - Content unreadable or empty
/// - Output file could not be written
pub async fn create(
    path: &Path,
    output: Option<PathBuf>,
    piece_length: u32,
    announce_urls: Vec<String>,
) -> anyhow::Result<()> {
    let metainfo = TorrentCreator::new()
        .with_piece_length(piece_length)
        .with_announce_urls(announce_urls)
        .create_from_path(path)
        .await
        .with_context(|| format!("cannot create torrent for {}", path.display()))?;

    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.torrent", metainfo.name)));
    tokio::fs::write(&output, TorrentCreator::encode(&metainfo))
        .await
        .with_context(|| format!("cannot write {}", output.display()))?;

    println!("Created {}", output.display());
    println!("  Info hash: {}", metainfo.info_hash);
    println!(
        "  Pieces:    {} x {} bytes",
        metainfo.piece_hashes.len(),
        metainfo.piece_length
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_long_names() {
        assert_eq!(truncate("short", 24), "short");
        assert_eq!(truncate("abcdefgh", 5), "abcd~");
    }

    #[tokio::test]
    async fn test_create_writes_parseable_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("data.bin");
        std::fs::write(&content, vec![7u8; 40_000]).unwrap();
        let output = dir.path().join("data.torrent");

        create(
            &content,
            Some(output.clone()),
            16_384,
            vec!["udp://tracker.example:80".to_string()],
        )
        .await
        .unwrap();

        let metainfo = MetainfoParser::parse_file(&output).await.unwrap();
        assert_eq!(metainfo.name, "data.bin");
        assert_eq!(metainfo.total_length, 40_000);
        assert_eq!(metainfo.piece_hashes.len(), 3);
        assert_eq!(metainfo.announce_urls, vec!["udp://tracker.example:80"]);
    }
}
