use std::sync::Arc;
use std::time::Duration;

use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio::time as ttime;
use tracing::info;

use crate::probe;
use crate::types::{DiagnosticStatus, DiagnosticStep};

const INTERNET_TIMEOUT: Duration = Duration::from_millis(1500);
const CLOCK_TIMEOUT: Duration = Duration::from_millis(2000);
/// Local clock is considered healthy below this skew.
const MAX_CLOCK_SKEW_MS: i128 = 30_000;

pub const STEP_INTERNET: &str = "internet connectivity";
pub const STEP_CLOCK: &str = "system clock";
pub const STEP_DNS: &str = "dns resolution";
pub const STEP_SERVER: &str = "target server";

/// Probe endpoints used by the four checks. Defaults match well-known
/// public infrastructure; tests point them at loopback fixtures.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// host:port connect test proving basic internet reachability.
    pub internet_probe: (String, u16),
    /// URL whose `Date:` response header anchors the clock-skew check.
    pub clock_url: String,
    /// Domain resolved for the DNS health check.
    pub dns_domain: String,
    /// The caller-supplied scan target.
    pub target_host: String,
    pub target_port: u16,
}

impl DiagnosticsConfig {
    pub fn for_target(host: impl Into<String>, port: u16) -> Self {
        Self {
            internet_probe: ("8.8.8.8".to_string(), 53),
            clock_url: "https://www.google.com".to_string(),
            dns_domain: "google.com".to_string(),
            target_host: host.into(),
            target_port: port,
        }
    }
}

/// Ordered diagnostic steps observable while the sequence runs.
#[derive(Clone, Debug, Default)]
pub struct SharedDiagnostics {
    pub steps: Arc<Mutex<Vec<DiagnosticStep>>>,
}

impl SharedDiagnostics {
    pub fn new() -> Self {
        Self {
            steps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn snapshot(&self) -> Vec<DiagnosticStep> {
        self.steps.lock().await.clone()
    }

    /// Append a step in Running state before its check executes.
    async fn begin(&self, name: &str) -> usize {
        let mut steps = self.steps.lock().await;
        steps.push(DiagnosticStep::running(name));
        steps.len() - 1
    }

    async fn finish(&self, index: usize, status: DiagnosticStatus, message: &str) {
        let mut steps = self.steps.lock().await;
        if let Some(step) = steps.get_mut(index) {
            step.status = status;
            step.message = message.to_string();
        }
    }
}

/// Run the fixed four-step health sequence against `cfg`.
///
/// Steps are appended before running (visible as Running) and updated in
/// place exactly once. A failed internet check short-circuits the rest,
/// which are reported as Pending / "not run" instead of executed.
pub async fn run_diagnostics(
    cfg: &DiagnosticsConfig,
    shared: &SharedDiagnostics,
) -> Vec<DiagnosticStep> {
    shared.steps.lock().await.clear();

    let idx = shared.begin(STEP_INTERNET).await;
    let online = check_internet(&cfg.internet_probe).await;
    if online {
        shared
            .finish(idx, DiagnosticStatus::Success, "internet is reachable")
            .await;
    } else {
        shared
            .finish(idx, DiagnosticStatus::Error, "no internet connection")
            .await;
        let mut steps = shared.steps.lock().await;
        for name in [STEP_CLOCK, STEP_DNS, STEP_SERVER] {
            steps.push(DiagnosticStep::skipped(name));
        }
        drop(steps);
        return shared.snapshot().await;
    }

    let idx = shared.begin(STEP_CLOCK).await;
    let skew = check_clock_skew(&cfg.clock_url).await;
    if skew < MAX_CLOCK_SKEW_MS {
        shared
            .finish(idx, DiagnosticStatus::Success, "clock is in sync")
            .await;
    } else {
        shared
            .finish(
                idx,
                DiagnosticStatus::Error,
                "clock is off by more than 30 seconds",
            )
            .await;
    }

    let idx = shared.begin(STEP_DNS).await;
    if check_dns(&cfg.dns_domain).await {
        shared
            .finish(idx, DiagnosticStatus::Success, "dns resolves correctly")
            .await;
    } else {
        shared
            .finish(
                idx,
                DiagnosticStatus::Warning,
                "dns lookup failed, resolver may be filtered",
            )
            .await;
    }

    let idx = shared.begin(STEP_SERVER).await;
    if probe::check_server_health(&cfg.target_host, cfg.target_port).await {
        shared
            .finish(idx, DiagnosticStatus::Success, "target server is reachable")
            .await;
    } else {
        shared
            .finish(
                idx,
                DiagnosticStatus::Error,
                "target server does not respond, its address may be blocked",
            )
            .await;
    }

    let steps = shared.snapshot().await;
    info!(
        errors = steps
            .iter()
            .filter(|s| s.status == DiagnosticStatus::Error)
            .count(),
        "diagnostics finished"
    );
    steps
}

/// Remediation hint for the first step that ended in Error, if any.
/// First-match only; simultaneous failures still yield a single message.
pub fn remediation(steps: &[DiagnosticStep]) -> Option<&'static str> {
    let failed = steps
        .iter()
        .find(|s| s.status == DiagnosticStatus::Error)?;
    Some(match failed.name.as_str() {
        STEP_CLOCK => {
            "Your clock disagrees with the server. Enable automatic date & time in system settings."
        }
        STEP_INTERNET => "You are offline. Check your data or wifi connection.",
        STEP_SERVER => {
            "The target address does not answer and is likely blocked. Run a fragment scan to find working parameters."
        }
        _ => "Toggle airplane mode once and try again.",
    })
}

async fn check_internet(probe_addr: &(String, u16)) -> bool {
    matches!(
        ttime::timeout(
            INTERNET_TIMEOUT,
            TcpStream::connect((probe_addr.0.as_str(), probe_addr.1)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Absolute difference between local time and the server's `Date:` header,
/// in ms. An unreachable server or missing header yields 0 so the check
/// degrades to success rather than blaming the clock.
async fn check_clock_skew(url: &str) -> i128 {
    let client = match reqwest::Client::builder().timeout(CLOCK_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return 0,
    };
    let resp = match client.get(url).send().await {
        Ok(r) => r,
        Err(_) => return 0,
    };
    let header = resp
        .headers()
        .get(reqwest::header::DATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Some(header) = header else { return 0 };
    let Ok(server_time) = OffsetDateTime::parse(&header, &Rfc2822) else {
        return 0;
    };
    let local = OffsetDateTime::now_utc();
    ((local - server_time).whole_milliseconds()).abs()
}

async fn check_dns(domain: &str) -> bool {
    match lookup_host((domain, 443u16)).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, status: DiagnosticStatus) -> DiagnosticStep {
        DiagnosticStep {
            name: name.to_string(),
            status,
            message: String::new(),
        }
    }

    #[test]
    fn remediation_picks_first_error() {
        let steps = vec![
            step(STEP_INTERNET, DiagnosticStatus::Success),
            step(STEP_CLOCK, DiagnosticStatus::Error),
            step(STEP_DNS, DiagnosticStatus::Warning),
            step(STEP_SERVER, DiagnosticStatus::Error),
        ];
        let hint = remediation(&steps).unwrap();
        assert!(hint.contains("clock"));
    }

    #[test]
    fn remediation_none_without_errors() {
        let steps = vec![
            step(STEP_INTERNET, DiagnosticStatus::Success),
            step(STEP_DNS, DiagnosticStatus::Warning),
        ];
        assert!(remediation(&steps).is_none());
    }
}
