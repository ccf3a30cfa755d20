//! Background host name resolution with bounded queues

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one `host:port` lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved {
        host: String,
        addrs: Vec<SocketAddr>,
    },
    Failed {
        host: String,
    },
}

/// Resolves `host:port` strings off the reactor task.
///
/// Requests and results travel through bounded channels. The reactor only
/// uses the non-blocking `submit` and `poll`; a full request queue leaves
/// the host pending for a later tick. Failed hosts are retried once the
/// retry interval has passed. Dropping the resolver aborts the worker.
pub struct Resolver {
    requests: mpsc::Sender<String>,
    results: mpsc::Receiver<Resolution>,
    worker: JoinHandle<()>,
    pending: Vec<String>,
    retry_at: HashMap<String, Instant>,
    retry_interval: Duration,
}

impl Resolver {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(queue_size: usize, lookup_timeout: Duration, retry_interval: Duration) -> Self {
        let (request_tx, request_rx) = mpsc::channel(queue_size.max(1));
        let (result_tx, result_rx) = mpsc::channel(queue_size.max(1));
        let worker = tokio::spawn(run_worker(request_rx, result_tx, lookup_timeout));

        Self {
            requests: request_tx,
            results: result_rx,
            worker,
            pending: Vec::new(),
            retry_at: HashMap::new(),
            retry_interval,
        }
    }

    /// Queues `host` for lookup without blocking.
    pub fn submit(&mut self, host: String) {
        if self.pending.contains(&host) {
            return;
        }
        match self.requests.try_send(host) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(host)) => self.pending.push(host),
            Err(mpsc::error::TrySendError::Closed(host)) => {
                warn!(%host, "Resolver worker gone, dropping lookup");
            }
        }
    }

    /// Collects finished lookups and resubmits due retries.
    pub fn poll(&mut self, now: Instant) -> Vec<Resolution> {
        let mut done = Vec::new();
        while let Ok(resolution) = self.results.try_recv() {
            if let Resolution::Failed { host } = &resolution {
                self.retry_at
                    .insert(host.clone(), now + self.retry_interval);
            }
            done.push(resolution);
        }

        let due: Vec<String> = self
            .retry_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(host, _)| host.clone())
            .collect();
        for host in due {
            self.retry_at.remove(&host);
            info!(%host, "Retrying host resolution");
            self.pending.push(host);
        }

        for host in std::mem::take(&mut self.pending) {
            self.submit(host);
        }

        done
    }

    /// Hosts waiting for a retry slot.
    pub fn retry_count(&self) -> usize {
        self.retry_at.len()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    mut requests: mpsc::Receiver<String>,
    results: mpsc::Sender<Resolution>,
    lookup_timeout: Duration,
) {
    while let Some(host) = requests.recv().await {
        debug!(%host, "Resolving");
        let lookup = tokio::time::timeout(lookup_timeout, tokio::net::lookup_host(host.clone())).await;
        let resolution = match lookup {
            Ok(Ok(addrs)) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    warn!(%host, "Resolution returned no addresses");
                    Resolution::Failed { host }
                } else {
                    Resolution::Resolved { host, addrs }
                }
            }
            Ok(Err(e)) => {
                warn!(%host, error = %e, "Resolution failed");
                Resolution::Failed { host }
            }
            Err(_) => {
                warn!(%host, "Resolution timed out");
                Resolution::Failed { host }
            }
        };

        if results.send(resolution).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for(resolver: &mut Resolver, now: Instant) -> Vec<Resolution> {
        for _ in 0..200 {
            let done = resolver.poll(now);
            if !done.is_empty() {
                return done;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_resolves_literal_address() {
        let mut resolver = Resolver::spawn(10, Duration::from_secs(5), Duration::from_secs(300));
        resolver.submit("127.0.0.1:6881".to_string());

        let done = wait_for(&mut resolver, Instant::now()).await;
        assert_eq!(
            done,
            vec![Resolution::Resolved {
                host: "127.0.0.1:6881".to_string(),
                addrs: vec!["127.0.0.1:6881".parse().unwrap()],
            }]
        );
    }

    #[tokio::test]
    async fn test_failure_is_retried_after_interval() {
        let retry = Duration::from_secs(300);
        let mut resolver = Resolver::spawn(10, Duration::from_secs(5), retry);
        // No port, so the lookup fails without touching the network.
        resolver.submit("not a host".to_string());

        let start = Instant::now();
        let done = wait_for(&mut resolver, start).await;
        assert_eq!(
            done,
            vec![Resolution::Failed {
                host: "not a host".to_string()
            }]
        );
        assert_eq!(resolver.retry_count(), 1);

        assert!(resolver.poll(start + Duration::from_secs(10)).is_empty());
        assert_eq!(resolver.retry_count(), 1);

        let later = start + retry;
        resolver.poll(later);
        assert_eq!(resolver.retry_count(), 0);
        let done = wait_for(&mut resolver, later).await;
        assert!(matches!(done[..], [Resolution::Failed { .. }]));
    }

    #[tokio::test]
    async fn test_full_queue_keeps_hosts_pending() {
        let mut resolver = Resolver::spawn(1, Duration::from_secs(5), Duration::from_secs(300));
        for port in 0..5 {
            resolver.submit(format!("127.0.0.1:{}", 7000 + port));
        }

        let mut resolved = 0;
        for _ in 0..400 {
            resolved += resolver.poll(Instant::now()).len();
            if resolved == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(resolved, 5);
    }
}
