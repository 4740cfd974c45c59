use serde::{Deserialize, Serialize};

/// Outcome of the lightweight data-exchange check against an endpoint.
///
/// An endpoint can accept TCP connects but still never exchange application
/// data (common with filtered CDN edges), so this is tracked separately from
/// plain reachability.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    /// Enrichment has not completed yet.
    Pending,
    /// The endpoint answered our request with at least one byte.
    Success,
    /// Connected and wrote, but the read returned EOF / zero bytes.
    NoResponse,
    /// Connect, write or read failed outright.
    Failed,
}

/// One scored endpoint discovered by the scanner.
///
/// Created on the first successful reachability measurement and updated in
/// place once geo/exchange enrichment completes. The live collection holds at
/// most one entry per address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EndpointResult {
    pub address: String,
    pub port: u16,
    /// Average connect latency in ms over successful attempts; -1 when
    /// `success` is false.
    pub latency_ms: i64,
    pub success: bool,
    /// CDN point-of-presence code, "unknown" until enrichment runs.
    pub colo: String,
    pub country_code: String,
    pub exchange_status: ExchangeStatus,
    /// 0..=100, fraction of reachability attempts that failed. Forced to 100
    /// when the exchange check does not succeed.
    pub packet_loss: u8,
}

impl EndpointResult {
    /// True once the exchange check has confirmed real data flow.
    pub fn exchange_ok(&self) -> bool {
        self.exchange_status == ExchangeStatus::Success
    }
}

/// One surviving cell of the fragmentation grid search. Immutable; a re-test
/// of the same cell produces a fresh instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FragmentCandidate {
    /// Chunk length in bytes the payload was split into.
    pub chunk_len: usize,
    /// Pause between chunk writes in ms.
    pub interval_ms: u64,
    /// Average elapsed time per trial in ms.
    pub latency_ms: u64,
    /// 0..=100, fraction of trials that got an answer back.
    pub stability: u8,
}

/// Lifecycle of a single diagnostic step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticStatus {
    Pending,
    Running,
    Success,
    Error,
    Warning,
}

/// One entry of the ordered diagnostics sequence, mutated in place as its
/// check completes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticStep {
    pub name: String,
    pub status: DiagnosticStatus,
    pub message: String,
}

impl DiagnosticStep {
    pub fn running(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: DiagnosticStatus::Running,
            message: "checking...".to_string(),
        }
    }

    pub fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: DiagnosticStatus::Pending,
            message: "not run".to_string(),
        }
    }
}

/// A verified DNS resolver with its measured connect+resolve latency.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResolverResult {
    pub ip: String,
    pub latency_ms: u64,
}

/// Release metadata fetched from the update endpoint. Out of the engine core,
/// consumed by callers only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub version_code: u32,
    pub download_url: String,
    pub mirror_url: String,
    pub change_log: String,
}
