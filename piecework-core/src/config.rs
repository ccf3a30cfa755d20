//! Centralized configuration for Piecework.
//!
//! Every protocol constant and tunable lives here so the engine, peers and
//! scheduler read the same values.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Piecework components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct PieceworkConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// Piece-exchange protocol parameters.
///
/// Controls request pipelining, the choke algorithm and keepalives.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Prefix of generated peer ids
    pub client_id: &'static str,
    /// Outstanding requests per peer while downloading
    pub request_threshold_downloading: usize,
    /// Outstanding requests per peer during endgame
    pub request_threshold_endgame: usize,
    /// Peers per torrent, counting both directions
    pub max_peers: usize,
    /// Interval between keepalive messages
    pub keepalive_interval: Duration,
    /// Interval between regular unchoke rounds
    pub unchoke_interval: Duration,
    /// Interval between optimistic unchoke picks
    pub optimistic_unchoke_interval: Duration,
    /// Rate-ranked unchoke slots
    pub unchoke_slots: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-PW0001-",
            request_threshold_downloading: 20,
            request_threshold_endgame: 4,
            max_peers: 32,
            keepalive_interval: Duration::from_secs(120),
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            unchoke_slots: 4,
        }
    }
}

/// Sockets, reactor timing and peer discovery.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the peer listener binds
    pub listen_address: IpAddr,
    /// TCP port for inbound peers
    pub listen_port: u16,
    /// Upper bound on one reactor wait
    pub poll_timeout: Duration,
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// Capacity of the resolver request and result queues
    pub resolver_queue_size: usize,
    /// Timeout of a single host lookup
    pub resolver_timeout: Duration,
    /// Delay before a failed host is looked up again
    pub resolver_retry_interval: Duration,
    /// Interval at which known peers are offered again
    pub peer_refresh_interval: Duration,
    /// Bootstrap peers as `ip:port` or `host:port`
    pub bootstrap_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 6881,
            poll_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            resolver_queue_size: 10,
            resolver_timeout: Duration::from_secs(30),
            resolver_retry_interval: Duration::from_secs(300), // 5 minutes
            peer_refresh_interval: Duration::from_secs(60),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Download and log locations.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory torrents are written below
    pub download_dir: PathBuf,
    /// Directory holding the last-run trace log
    pub logs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl PieceworkConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("PIECEWORK_LISTEN_PORT") {
            config.network.listen_port = port;
        }

        if let Some(max_peers) = env_parse::<usize>("PIECEWORK_MAX_PEERS") {
            config.torrent.max_peers = max_peers;
        }

        if let Some(millis) = env_parse::<u64>("PIECEWORK_POLL_TIMEOUT_MS") {
            config.network.poll_timeout = Duration::from_millis(millis);
        }

        if let Ok(dir) = std::env::var("PIECEWORK_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }

        if let Ok(peers) = std::env::var("PIECEWORK_PEERS") {
            config.network.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        config
    }

    /// Configuration for tests: loopback on an ephemeral port, a fast
    /// reactor and short choke rounds.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.network.listen_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.network.listen_port = 0;
        config.torrent.unchoke_interval = Duration::from_millis(100);
        config.torrent.optimistic_unchoke_interval = Duration::from_millis(300);
        config.network.poll_timeout = Duration::from_millis(50);
        config.network.connect_timeout = Duration::from_secs(2);
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = PieceworkConfig::default();

        assert_eq!(config.torrent.client_id, "-PW0001-");
        assert_eq!(config.torrent.request_threshold_downloading, 20);
        assert_eq!(config.torrent.request_threshold_endgame, 4);
        assert_eq!(config.torrent.max_peers, 32);
        assert_eq!(config.torrent.keepalive_interval, Duration::from_secs(120));
        assert_eq!(config.torrent.unchoke_interval, Duration::from_secs(10));
        assert_eq!(
            config.torrent.optimistic_unchoke_interval,
            Duration::from_secs(30)
        );
        assert_eq!(config.network.listen_port, 6881);
        assert_eq!(config.network.resolver_queue_size, 10);
        assert_eq!(
            config.network.resolver_retry_interval,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_testing_preset() {
        let config = PieceworkConfig::for_testing();
        assert_eq!(config.network.listen_port, 0);
        assert!(config.network.listen_address.is_loopback());
        assert!(config.network.poll_timeout < Duration::from_secs(1));
        assert!(config.torrent.unchoke_interval < config.torrent.optimistic_unchoke_interval);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("PIECEWORK_LISTEN_PORT", "7000");
            std::env::set_var("PIECEWORK_MAX_PEERS", "8");
            std::env::set_var("PIECEWORK_POLL_TIMEOUT_MS", "250");
            std::env::set_var("PIECEWORK_DOWNLOAD_DIR", "/tmp/piecework");
            std::env::set_var("PIECEWORK_PEERS", "10.0.0.1:6881, seed.example:6881,");
        }

        let config = PieceworkConfig::from_env();

        assert_eq!(config.network.listen_port, 7000);
        assert_eq!(config.torrent.max_peers, 8);
        assert_eq!(config.network.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.storage.download_dir, PathBuf::from("/tmp/piecework"));
        assert_eq!(
            config.network.bootstrap_peers,
            vec!["10.0.0.1:6881".to_string(), "seed.example:6881".to_string()]
        );

        unsafe {
            std::env::remove_var("PIECEWORK_LISTEN_PORT");
            std::env::remove_var("PIECEWORK_MAX_PEERS");
            std::env::remove_var("PIECEWORK_POLL_TIMEOUT_MS");
            std::env::remove_var("PIECEWORK_DOWNLOAD_DIR");
            std::env::remove_var("PIECEWORK_PEERS");
        }
    }
}
