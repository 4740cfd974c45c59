use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::probe;
use crate::types::FragmentCandidate;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1200);
const READ_TIMEOUT: Duration = Duration::from_millis(800);
/// Trials per grid cell. Two keeps a full sweep of the default grid fast
/// while still distinguishing flaky cells from stable ones.
const TRIALS_PER_CELL: u32 = 2;
/// Bytes written per trial, split into chunks under test.
const PAYLOAD_SIZE: usize = 200;
/// Candidates at or below this stability are discarded.
const MIN_STABILITY: u8 = 50;

/// The (chunk length, inter-chunk interval) search space.
///
/// Timing of individual writes is the variable under test, so cells are
/// always visited sequentially; concurrent trials on a shared link would
/// contaminate each other's latency.
#[derive(Debug, Clone)]
pub struct FragmentGrid {
    pub lengths: Vec<usize>,
    pub intervals_ms: Vec<u64>,
}

impl Default for FragmentGrid {
    fn default() -> Self {
        let mut lengths: Vec<usize> = (1..=20).collect();
        lengths.extend([30, 40, 50, 60, 80, 100, 150, 200, 300, 400, 500]);
        let mut intervals_ms: Vec<u64> = (1..=5).collect();
        intervals_ms.extend([10, 15, 20, 30, 40, 50]);
        Self {
            lengths,
            intervals_ms,
        }
    }
}

impl FragmentGrid {
    pub fn cell_count(&self) -> u64 {
        self.lengths.len() as u64 * self.intervals_ms.len() as u64
    }
}

/// Live state of a fragment scan, shared with observers.
#[derive(Clone, Debug)]
pub struct SharedFragmentScan {
    pub candidates: Arc<Mutex<Vec<FragmentCandidate>>>,
    pub completed: Arc<AtomicU64>,
    pub total: Arc<AtomicU64>,
    pub status: Arc<Mutex<String>>,
}

impl SharedFragmentScan {
    pub fn new() -> Self {
        Self {
            candidates: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
            status: Arc::new(Mutex::new("ready".to_string())),
        }
    }

    pub async fn reset(&self, total: u64) {
        self.candidates.lock().await.clear();
        self.completed.store(0, AtomicOrdering::Relaxed);
        self.total.store(total, AtomicOrdering::Relaxed);
    }

    /// Completed grid cells over total cells, in [0, 1].
    pub fn progress(&self) -> f32 {
        let total = self.total.load(AtomicOrdering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.completed.load(AtomicOrdering::Relaxed) as f32 / total as f32
    }

    pub async fn snapshot(&self) -> Vec<FragmentCandidate> {
        self.candidates.lock().await.clone()
    }

    pub async fn status_text(&self) -> String {
        self.status.lock().await.clone()
    }
}

impl Default for SharedFragmentScan {
    fn default() -> Self {
        Self::new()
    }
}

/// Ranking for kept candidates: most stable first, then lowest latency.
pub fn candidate_order(a: &FragmentCandidate, b: &FragmentCandidate) -> std::cmp::Ordering {
    b.stability
        .cmp(&a.stability)
        .then(a.latency_ms.cmp(&b.latency_ms))
}

/// One trial: connect, write the payload in `len`-byte chunks flushed
/// individually with `interval` pauses, then wait for any answer byte.
async fn fragment_trial(host: &str, port: u16, len: usize, interval_ms: u64) -> bool {
    let connect = time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await;
    let mut stream = match connect {
        Ok(Ok(s)) => s,
        _ => return false,
    };

    let payload: Vec<u8> = (0..PAYLOAD_SIZE).map(|i| i as u8).collect();
    for chunk in payload.chunks(len) {
        if stream.write_all(chunk).await.is_err() || stream.flush().await.is_err() {
            return false;
        }
        if interval_ms > 0 {
            time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    let mut buf = [0u8; 1];
    matches!(
        time::timeout(READ_TIMEOUT, stream.read(&mut buf)).await,
        Ok(Ok(n)) if n > 0
    )
}

/// Measure one grid cell over `TRIALS_PER_CELL` independent trials. Returns
/// None when no trial succeeded.
async fn measure_cell(
    host: &str,
    port: u16,
    len: usize,
    interval_ms: u64,
) -> Option<FragmentCandidate> {
    let start = Instant::now();
    let mut successes: u32 = 0;
    for _ in 0..TRIALS_PER_CELL {
        if fragment_trial(host, port, len, interval_ms).await {
            successes += 1;
        }
    }
    if successes == 0 {
        return None;
    }
    Some(FragmentCandidate {
        chunk_len: len,
        interval_ms,
        latency_ms: start.elapsed().as_millis() as u64 / TRIALS_PER_CELL as u64,
        stability: (successes * 100 / TRIALS_PER_CELL) as u8,
    })
}

/// Exhaustive sweep of the fragmentation grid against one fixed target.
///
/// Runs only if a preliminary health probe of the target succeeds; otherwise
/// publishes a terminal failure status and executes zero cells. Candidates
/// with stability above 50 are kept and the kept collection republished in
/// rank order after every acceptance.
pub async fn scan_fragments(
    host: &str,
    port: u16,
    grid: &FragmentGrid,
    cancel: CancellationToken,
    shared: SharedFragmentScan,
) -> Result<Vec<FragmentCandidate>> {
    shared.reset(grid.cell_count()).await;
    *shared.status.lock().await = "checking server health".to_string();

    if !probe::check_server_health(host, port).await {
        *shared.status.lock().await = "server unreachable or blocked".to_string();
        bail!("target {host}:{port} failed the health check");
    }

    info!(host, port, cells = grid.cell_count(), "starting fragment scan");

    'sweep: for &len in &grid.lengths {
        for &interval in &grid.intervals_ms {
            if cancel.is_cancelled() {
                break 'sweep;
            }
            *shared.status.lock().await = format!("testing {len}-{interval}");

            if let Some(candidate) = measure_cell(host, port, len, interval).await {
                if candidate.stability > MIN_STABILITY {
                    debug!(
                        len,
                        interval,
                        stability = candidate.stability,
                        latency = candidate.latency_ms,
                        "keeping fragment candidate"
                    );
                    let mut kept = shared.candidates.lock().await;
                    kept.push(candidate);
                    kept.sort_by(candidate_order);
                }
            }

            shared.completed.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    let final_status = if cancel.is_cancelled() {
        "scan stopped"
    } else {
        "scan complete, best result first"
    };
    *shared.status.lock().await = final_status.to_string();
    Ok(shared.snapshot().await)
}

/// Owning handle around fragment scan sessions, same single-session policy
/// as the endpoint scanner.
pub struct FragmentScanner {
    shared: SharedFragmentScan,
    active: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FragmentScanner {
    pub fn new() -> Self {
        Self {
            shared: SharedFragmentScan::new(),
            active: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Begin a deep scan in the background. Rejects while a session is
    /// already active.
    pub async fn start_deep_scan(&self, host: String, port: u16, grid: FragmentGrid) -> Result<()> {
        if self.active.swap(true, AtomicOrdering::SeqCst) {
            bail!("a fragment scan session is already active");
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let shared = self.shared.clone();
        let active = self.active.clone();
        let handle = tokio::spawn(async move {
            // The health-check failure path already set a terminal status.
            let _ = scan_fragments(&host, port, &grid, cancel, shared).await;
            active.store(false, AtomicOrdering::SeqCst);
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Request cooperative cancellation, observed between grid cells.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.as_ref() {
            cancel.cancel();
        }
    }

    pub async fn wait(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::SeqCst)
    }

    pub fn shared(&self) -> &SharedFragmentScan {
        &self.shared
    }

    pub async fn candidates(&self) -> Vec<FragmentCandidate> {
        self.shared.snapshot().await
    }
}

impl Default for FragmentScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grid_dimensions() {
        let grid = FragmentGrid::default();
        assert_eq!(grid.lengths.len(), 31);
        assert_eq!(grid.intervals_ms.len(), 11);
        assert_eq!(grid.cell_count(), 341);
        assert_eq!(grid.lengths[0], 1);
        assert_eq!(*grid.lengths.last().unwrap(), 500);
        assert_eq!(*grid.intervals_ms.last().unwrap(), 50);
    }

    #[test]
    fn candidate_order_prefers_stability_then_latency() {
        let mut list = vec![
            FragmentCandidate {
                chunk_len: 5,
                interval_ms: 10,
                latency_ms: 40,
                stability: 100,
            },
            FragmentCandidate {
                chunk_len: 2,
                interval_ms: 1,
                latency_ms: 10,
                stability: 100,
            },
        ];
        list.sort_by(candidate_order);
        assert_eq!(list[0].chunk_len, 2);
    }
}
