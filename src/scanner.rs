use std::cmp::Ordering;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::enrich;
use crate::probe;
use crate::ranges;
use crate::types::EndpointResult;

/// Pacing between admission attempts, so the loop never spins tight while
/// all permits are taken.
const ADMISSION_GAP: Duration = Duration::from_millis(15);

/// Parameters of one endpoint scan session.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// CIDR blocks to sample from. Empty means the full built-in set.
    pub ranges: Vec<String>,
    /// Max concurrent probe-enrichment tasks.
    pub concurrency: usize,
    /// Per connect attempt timeout.
    pub timeout: Duration,
    /// Stop once this many endpoints have been accepted.
    pub max_results: usize,
    /// Target port probed on every candidate.
    pub port: u16,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            concurrency: 10,
            timeout: Duration::from_millis(1000),
            max_results: 20,
            port: 443,
        }
    }
}

/// Live state of a scan session, shared between the admission loop, its
/// probe tasks and any observer (CLI table, HTTP status endpoint).
///
/// All mutations of `results` go through its mutex, so every publish is a
/// complete sorted snapshot; counters are plain atomics.
#[derive(Clone, Debug)]
pub struct SharedScan {
    pub results: Arc<Mutex<Vec<EndpointResult>>>,
    /// Candidates admitted to probing so far.
    pub attempted: Arc<AtomicU64>,
    /// Endpoints accepted into the ranked collection.
    pub found: Arc<AtomicU64>,
    /// `max_results` of the running session, for the progress fraction.
    pub target: Arc<AtomicU64>,
    pub status: Arc<Mutex<String>>,
}

impl SharedScan {
    pub fn new() -> Self {
        Self {
            results: Arc::new(Mutex::new(Vec::new())),
            attempted: Arc::new(AtomicU64::new(0)),
            found: Arc::new(AtomicU64::new(0)),
            target: Arc::new(AtomicU64::new(0)),
            status: Arc::new(Mutex::new("ready".to_string())),
        }
    }

    /// Clear state at the start of a fresh session.
    pub async fn reset(&self, target: u64) {
        self.results.lock().await.clear();
        self.attempted.store(0, AtomicOrdering::Relaxed);
        self.found.store(0, AtomicOrdering::Relaxed);
        self.target.store(target, AtomicOrdering::Relaxed);
        *self.status.lock().await = "scanning".to_string();
    }

    /// Fraction of requested results found so far, in [0, 1].
    pub fn progress(&self) -> f32 {
        let target = self.target.load(AtomicOrdering::Relaxed);
        if target == 0 {
            return 0.0;
        }
        let found = self.found.load(AtomicOrdering::Relaxed);
        (found as f32 / target as f32).clamp(0.0, 1.0)
    }

    pub async fn snapshot(&self) -> Vec<EndpointResult> {
        self.results.lock().await.clone()
    }

    pub async fn status_text(&self) -> String {
        self.status.lock().await.clone()
    }
}

impl Default for SharedScan {
    fn default() -> Self {
        Self::new()
    }
}

/// Provisional ranking used right after the reachability measurement:
/// lowest packet loss first, then lowest latency.
pub fn provisional_order(a: &EndpointResult, b: &EndpointResult) -> Ordering {
    a.packet_loss
        .cmp(&b.packet_loss)
        .then(a.latency_ms.cmp(&b.latency_ms))
}

/// Final ranking once enrichment has run: endpoints with a confirmed data
/// exchange first, then lowest packet loss, then lowest latency.
pub fn final_order(a: &EndpointResult, b: &EndpointResult) -> Ordering {
    b.exchange_ok()
        .cmp(&a.exchange_ok())
        .then(a.packet_loss.cmp(&b.packet_loss))
        .then(a.latency_ms.cmp(&b.latency_ms))
}

/// Insert a freshly measured endpoint into the live collection if there is
/// room and its address is not already present, republishing in provisional
/// order. Returns whether the result was accepted.
async fn publish_provisional(
    shared: &SharedScan,
    result: &EndpointResult,
    max_results: usize,
) -> bool {
    let mut list = shared.results.lock().await;
    if list.len() >= max_results || list.iter().any(|e| e.address == result.address) {
        return false;
    }
    list.push(result.clone());
    list.sort_by(provisional_order);
    shared.found.fetch_add(1, AtomicOrdering::Relaxed);
    true
}

/// Fold enrichment data into the matching entry and republish in final
/// order. An exchange check that did not succeed demotes the endpoint by
/// forcing its packet loss to 100; a successful one leaves the measured loss
/// untouched.
async fn publish_enriched(
    shared: &SharedScan,
    address: &str,
    colo: String,
    country_code: String,
    exchange_status: crate::types::ExchangeStatus,
) {
    let mut list = shared.results.lock().await;
    if let Some(entry) = list.iter_mut().find(|e| e.address == address) {
        entry.colo = colo;
        entry.country_code = country_code;
        entry.exchange_status = exchange_status;
        if !entry.exchange_ok() {
            entry.packet_loss = 100;
        }
        list.sort_by(final_order);
    }
}

/// Run one endpoint scan session to completion or cancellation.
///
/// Repeatedly samples a candidate address from the selected ranges and
/// admits a probe-enrichment task under the concurrency bound. Probe and
/// enrichment failures are local to their task and never abort the session.
pub async fn scan_endpoints(
    cfg: &ScanConfig,
    cancel: CancellationToken,
    shared: SharedScan,
) -> Result<Vec<EndpointResult>> {
    if cfg.concurrency == 0 {
        bail!("concurrency must be at least 1");
    }
    if cfg.max_results == 0 {
        bail!("max_results must be at least 1");
    }
    let ranges = if cfg.ranges.is_empty() {
        ranges::default_ranges()
    } else {
        cfg.ranges.clone()
    };

    shared.reset(cfg.max_results as u64).await;
    info!(
        ranges = ranges.len(),
        concurrency = cfg.concurrency,
        port = cfg.port,
        max_results = cfg.max_results,
        "starting endpoint scan"
    );

    let sem = Arc::new(Semaphore::new(cfg.concurrency.clamp(1, 512)));
    let mut set = JoinSet::new();
    let client = reqwest::Client::new();

    while !cancel.is_cancelled()
        && shared.found.load(AtomicOrdering::Relaxed) < cfg.max_results as u64
    {
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore in scope");

        let range = &ranges[rand::thread_rng().gen_range(0..ranges.len())];
        let ip = match ranges::generate_candidate(range) {
            Ok(ip) => IpAddr::V4(ip),
            Err(e) => {
                debug!("skipping unusable range {range}: {e}");
                time::sleep(ADMISSION_GAP).await;
                continue;
            }
        };
        shared.attempted.fetch_add(1, AtomicOrdering::Relaxed);

        let shared = shared.clone();
        let cancel = cancel.clone();
        let client = client.clone();
        let port = cfg.port;
        let timeout = cfg.timeout;
        let max_results = cfg.max_results;

        set.spawn(async move {
            let _permit = permit; // held for the task's whole lifetime

            if cancel.is_cancelled() {
                return;
            }

            let result = probe::measure_endpoint(ip, port, timeout).await;
            if !result.success {
                return;
            }
            if !publish_provisional(&shared, &result, max_results).await {
                return;
            }
            debug!(address = %result.address, latency = result.latency_ms, "accepted endpoint");

            // Enrichment happens after the provisional publish, so observers
            // see the entry as soon as it is reachable.
            let (colo, country) = enrich::fetch_edge_info(&client, &result.address).await;
            let status = enrich::check_data_exchange(&result.address, port).await;
            publish_enriched(&shared, &result.address, colo, country, status).await;
        });

        time::sleep(ADMISSION_GAP).await;
    }

    // In-flight probes run to their own timeouts; no new admissions happen.
    while set.join_next().await.is_some() {}

    let final_status = if cancel.is_cancelled() {
        "scan stopped"
    } else {
        "scan complete"
    };
    *shared.status.lock().await = final_status.to_string();
    info!(
        found = shared.found.load(AtomicOrdering::Relaxed),
        attempted = shared.attempted.load(AtomicOrdering::Relaxed),
        "{final_status}"
    );

    Ok(shared.snapshot().await)
}

/// Owning handle around endpoint scan sessions: at most one active session
/// at a time, started in the background and stopped cooperatively.
pub struct EndpointScanner {
    shared: SharedScan,
    active: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointScanner {
    pub fn new() -> Self {
        Self {
            shared: SharedScan::new(),
            active: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Begin a scan session. Rejects (rather than cancel-and-restart) if a
    /// session is already active.
    pub async fn start(&self, cfg: ScanConfig) -> Result<()> {
        if self.active.swap(true, AtomicOrdering::SeqCst) {
            bail!("a scan session is already active");
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let shared = self.shared.clone();
        let active = self.active.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = scan_endpoints(&cfg, cancel, shared.clone()).await {
                *shared.status.lock().await = format!("scan failed: {e}");
            }
            active.store(false, AtomicOrdering::SeqCst);
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Request cooperative cancellation. Idempotent; a no-op when idle.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.as_ref() {
            cancel.cancel();
        }
    }

    /// Wait for the current session (if any) to finish.
    pub async fn wait(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::SeqCst)
    }

    pub fn shared(&self) -> &SharedScan {
        &self.shared
    }

    pub async fn results(&self) -> Vec<EndpointResult> {
        self.shared.snapshot().await
    }
}

impl Default for EndpointScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExchangeStatus;

    fn entry(address: &str, loss: u8, latency: i64, status: ExchangeStatus) -> EndpointResult {
        EndpointResult {
            address: address.to_string(),
            port: 443,
            latency_ms: latency,
            success: true,
            colo: "unknown".to_string(),
            country_code: "??".to_string(),
            exchange_status: status,
            packet_loss: loss,
        }
    }

    #[test]
    fn provisional_order_is_loss_then_latency() {
        let mut list = vec![
            entry("a", 20, 50, ExchangeStatus::Pending),
            entry("b", 0, 300, ExchangeStatus::Pending),
            entry("c", 0, 100, ExchangeStatus::Pending),
        ];
        list.sort_by(provisional_order);
        let order: Vec<&str> = list.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn final_order_puts_exchange_success_first() {
        let mut list = vec![
            entry("slow-ok", 0, 500, ExchangeStatus::Success),
            entry("fast-dead", 100, 10, ExchangeStatus::Failed),
            entry("lossy-ok", 40, 80, ExchangeStatus::Success),
        ];
        list.sort_by(final_order);
        let order: Vec<&str> = list.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(order, vec!["slow-ok", "lossy-ok", "fast-dead"]);
    }

    #[tokio::test]
    async fn publish_rejects_duplicate_addresses() {
        let shared = SharedScan::new();
        shared.reset(10).await;
        let e = entry("1.2.3.4", 0, 10, ExchangeStatus::Pending);
        assert!(publish_provisional(&shared, &e, 10).await);
        assert!(!publish_provisional(&shared, &e, 10).await);
        assert_eq!(shared.snapshot().await.len(), 1);
        assert_eq!(shared.found.load(AtomicOrdering::Relaxed), 1);
    }

    #[tokio::test]
    async fn publish_respects_capacity() {
        let shared = SharedScan::new();
        shared.reset(1).await;
        assert!(
            publish_provisional(&shared, &entry("1.1.1.1", 0, 10, ExchangeStatus::Pending), 1)
                .await
        );
        assert!(
            !publish_provisional(&shared, &entry("2.2.2.2", 0, 10, ExchangeStatus::Pending), 1)
                .await
        );
    }

    #[tokio::test]
    async fn enrichment_demotes_failed_exchange() {
        let shared = SharedScan::new();
        shared.reset(10).await;
        publish_provisional(&shared, &entry("1.2.3.4", 20, 10, ExchangeStatus::Pending), 10).await;
        publish_provisional(&shared, &entry("5.6.7.8", 40, 90, ExchangeStatus::Pending), 10).await;

        publish_enriched(
            &shared,
            "1.2.3.4",
            "FRA".to_string(),
            "DE".to_string(),
            ExchangeStatus::Failed,
        )
        .await;
        publish_enriched(
            &shared,
            "5.6.7.8",
            "AMS".to_string(),
            "NL".to_string(),
            ExchangeStatus::Success,
        )
        .await;

        let list = shared.snapshot().await;
        // Exchange success ranks first despite its higher measured loss.
        assert_eq!(list[0].address, "5.6.7.8");
        assert_eq!(list[0].packet_loss, 40);
        assert_eq!(list[1].address, "1.2.3.4");
        assert_eq!(list[1].packet_loss, 100);
        assert_eq!(list[1].colo, "FRA");
    }

    #[tokio::test]
    async fn sorted_after_random_publish_sequence() {
        let shared = SharedScan::new();
        shared.reset(64).await;
        let losses = [0u8, 20, 40, 60, 80];
        for i in 0..40u32 {
            let (loss, latency) = {
                let mut rng = rand::thread_rng();
                (losses[rng.gen_range(0..5)], rng.gen_range(1..500))
            };
            let e = entry(
                &format!("10.0.{}.{}", i / 250, i % 250 + 1),
                loss,
                latency,
                ExchangeStatus::Pending,
            );
            publish_provisional(&shared, &e, 64).await;
            let list = shared.snapshot().await;
            assert!(list
                .windows(2)
                .all(|w| provisional_order(&w[0], &w[1]) != Ordering::Greater));
        }
        for i in 0..40u32 {
            let addr = format!("10.0.{}.{}", i / 250, i % 250 + 1);
            let status = if i % 3 == 0 {
                ExchangeStatus::Failed
            } else {
                ExchangeStatus::Success
            };
            publish_enriched(&shared, &addr, "POP".to_string(), "XX".to_string(), status).await;
            let list = shared.snapshot().await;
            assert!(list
                .windows(2)
                .all(|w| final_order(&w[0], &w[1]) != Ordering::Greater));
        }
        // Loss forced to 100 exactly on the entries whose exchange failed.
        for e in shared.snapshot().await {
            if e.exchange_ok() {
                assert!(e.packet_loss < 100);
            } else {
                assert_eq!(e.packet_loss, 100);
            }
        }
    }

    #[tokio::test]
    async fn start_rejects_while_active() {
        let scanner = EndpointScanner::new();
        let cfg = ScanConfig {
            ranges: vec!["127.0.0.0/24".to_string()],
            concurrency: 1,
            timeout: Duration::from_millis(100),
            max_results: 1000,
            port: 9, // discard port, almost certainly closed
        };
        scanner.start(cfg.clone()).await.unwrap();
        assert!(scanner.start(cfg).await.is_err());
        scanner.stop().await;
        scanner.wait().await;
        assert!(!scanner.is_active());
    }
}
