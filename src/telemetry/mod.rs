//! Traffic telemetry
//!
//! Transports count the bytes flowing through their endpoint with a
//! [`TrafficMonitor`] and post a [`TransportTraffic`] sample to the
//! supervisor once per second. The supervisor side is [`TrafficReceiver`].
//!
//! Delivery is fire-and-forget: a failed post is logged and the next tick
//! sends fresh counters.

mod receiver;
mod stream;

pub use receiver::{TrafficReceiver, TRAFFIC_PATH};
pub use stream::{MonitoredListener, MonitoredStream, OpenGuard};

use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, warn};

/// Interval between two telemetry posts
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

const POST_TIMEOUT: Duration = Duration::from_secs(5);

/// One telemetry sample as posted by a transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTraffic {
    /// Remote addresses with at least one open connection
    pub opened: Vec<String>,
    pub read_total: u64,
    pub write_total: u64,
    /// Bytes per second since the previous sample
    pub throughput: f64,
}

/// Where and how to post samples
#[derive(Debug, Clone)]
pub struct ReportEndpoint {
    pub url: String,
    pub auth_secret: String,
}

struct Sample {
    at: Instant,
    total: u64,
}

struct MonitorInner {
    read_total: AtomicU64,
    write_total: AtomicU64,
    open: DashMap<String, usize>,
    last: Mutex<Sample>,
}

/// Shared byte counters and open-connection bookkeeping
#[derive(Clone)]
pub struct TrafficMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for TrafficMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficMonitor {
    pub fn new() -> Self {
        TrafficMonitor {
            inner: Arc::new(MonitorInner {
                read_total: AtomicU64::new(0),
                write_total: AtomicU64::new(0),
                open: DashMap::new(),
                last: Mutex::new(Sample {
                    at: Instant::now(),
                    total: 0,
                }),
            }),
        }
    }

    pub fn add_read(&self, n: u64) {
        self.inner.read_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.inner.write_total.fetch_add(n, Ordering::Relaxed);
    }

    /// (read, written)
    pub fn totals(&self) -> (u64, u64) {
        (
            self.inner.read_total.load(Ordering::Relaxed),
            self.inner.write_total.load(Ordering::Relaxed),
        )
    }

    /// Count a connection to `addr` as open until the guard is dropped.
    pub fn track_open(&self, addr: impl Into<String>) -> OpenGuard {
        let addr = addr.into();
        *self.inner.open.entry(addr.clone()).or_insert(0) += 1;
        OpenGuard::new(self.clone(), addr)
    }

    fn release(&self, addr: &str) {
        let now_closed = match self.inner.open.get_mut(addr) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if now_closed {
            self.inner.open.remove_if(addr, |_, count| *count == 0);
        }
    }

    /// Remote addresses with open connections, sorted
    pub fn opened(&self) -> Vec<String> {
        let mut opened: Vec<String> = self
            .inner
            .open
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        opened.sort();
        opened
    }

    /// Wrap a stream so its traffic is counted.
    pub fn monitor_stream<S>(&self, stream: S, remote: impl Into<String>) -> MonitoredStream<S> {
        MonitoredStream::new(stream, self.clone(), self.track_open(remote))
    }

    /// Take a sample. Throughput is measured against the previous call.
    pub fn snapshot(&self) -> TransportTraffic {
        let (read_total, write_total) = self.totals();
        let total = read_total + write_total;

        let throughput = {
            let mut last = self.inner.last.lock();
            let now = Instant::now();
            let secs = now.duration_since(last.at).as_secs_f64();
            let delta = total.saturating_sub(last.total);
            *last = Sample { at: now, total };
            if secs > 0.0 {
                delta as f64 / secs
            } else {
                0.0
            }
        };

        TransportTraffic {
            opened: self.opened(),
            read_total,
            write_total,
            throughput,
        }
    }

    /// Post a sample to `endpoint` every [`REPORT_INTERVAL`].
    pub fn spawn_reporter(&self, endpoint: ReportEndpoint) -> Result<JoinHandle<()>> {
        let client = reqwest::Client::builder().timeout(POST_TIMEOUT).build()?;
        let monitor = self.clone();
        let endpoint = Arc::new(endpoint);

        Ok(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + REPORT_INTERVAL;
            let mut ticker = interval_at(start, REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let traffic = monitor.snapshot();
                let client = client.clone();
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move {
                    if let Err(e) = post_traffic(&client, &endpoint, &traffic).await {
                        warn!("Could not post activity to {}: {}", endpoint.url, e);
                    }
                });
            }
        }))
    }
}

/// Post one sample with bearer authentication.
pub async fn post_traffic(
    client: &reqwest::Client,
    endpoint: &ReportEndpoint,
    traffic: &TransportTraffic,
) -> Result<()> {
    client
        .post(&endpoint.url)
        .bearer_auth(&endpoint.auth_secret)
        .json(traffic)
        .send()
        .await?
        .error_for_status()?;
    debug!(
        "posted traffic: {} read, {} written, {:.0} B/s",
        traffic.read_total, traffic.write_total, traffic.throughput
    );
    Ok(())
}
