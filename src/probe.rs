use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::types::{EndpointResult, ExchangeStatus};

/// Attempts per reachability measurement.
pub const MEASURE_ATTEMPTS: u32 = 5;
/// Pacing between individual connect attempts.
const ATTEMPT_GAP: Duration = Duration::from_millis(20);
/// Timeout for the single-shot server health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_millis(2000);

/// Result of one bounded connect attempt. `elapsed_ms` is only meaningful
/// when `connected` is true.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub connected: bool,
    pub elapsed_ms: u64,
}

/// Perform a single TCP connect attempt against `addr`, bounded by `timeout`.
///
/// The socket is dropped on every exit path; failure (refused, reset, timed
/// out) is reported as `connected: false` and never as an error.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    let start = Instant::now();
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ProbeOutcome {
            connected: true,
            elapsed_ms: start.elapsed().as_millis() as u64,
        },
        _ => ProbeOutcome {
            connected: false,
            elapsed_ms: start.elapsed().as_millis() as u64,
        },
    }
}

/// Same single-shot probe against a hostname (resolved by the OS), used for
/// the fragment scanner's preliminary health check and the diagnostics
/// target-server step.
pub async fn check_server_health(host: &str, port: u16) -> bool {
    match time::timeout(HEALTH_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        _ => false,
    }
}

/// Multi-attempt reachability measurement: 5 independent connect attempts
/// with fixed pacing, accumulating latency over successful attempts only.
///
/// Zero successes yields `success: false` with the -1 latency sentinel; the
/// scanner discards such results instead of publishing them.
pub async fn measure_endpoint(ip: IpAddr, port: u16, timeout: Duration) -> EndpointResult {
    let addr = SocketAddr::new(ip, port);
    let mut successes: u32 = 0;
    let mut total_latency: u64 = 0;

    for _ in 0..MEASURE_ATTEMPTS {
        let outcome = probe(addr, timeout).await;
        if outcome.connected {
            successes += 1;
            total_latency += outcome.elapsed_ms;
        }
        time::sleep(ATTEMPT_GAP).await;
    }

    if successes > 0 {
        EndpointResult {
            address: ip.to_string(),
            port,
            latency_ms: (total_latency / successes as u64) as i64,
            success: true,
            colo: "unknown".to_string(),
            country_code: "??".to_string(),
            exchange_status: ExchangeStatus::Pending,
            packet_loss: (((MEASURE_ATTEMPTS - successes) * 100) / MEASURE_ATTEMPTS) as u8,
        }
    } else {
        EndpointResult {
            address: ip.to_string(),
            port,
            latency_ms: -1,
            success: false,
            colo: "unknown".to_string(),
            country_code: "??".to_string(),
            exchange_status: ExchangeStatus::Pending,
            packet_loss: 100,
        }
    }
}
