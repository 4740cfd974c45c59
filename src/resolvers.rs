use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use std::fs;
use std::path::Path;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::ResolverResult;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(700);
/// At most this many candidates are tested per run, sampled at random from
/// the supplied list.
const SUBSET_CAP: usize = 100;

/// Parse a newline-delimited resolver list: one IP per line, `#` comments
/// and blank lines ignored.
pub fn parse_resolvers_str(s: &str) -> Vec<String> {
    s.lines()
        .filter_map(|raw| {
            let line = raw.split('#').next().map(str::trim).unwrap_or("");
            if line.is_empty() {
                None
            } else {
                Some(line.to_string())
            }
        })
        .collect()
}

/// Load the resolver candidate list from a file (read-only input).
pub fn load_resolvers_from_path(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read resolvers file: {}", path.as_ref().display()))?;
    Ok(parse_resolvers_str(&content))
}

/// An answer pointing into private or null space is a poisoned response,
/// not a real resolution.
fn is_poisoned(resolved: &str) -> bool {
    resolved.starts_with("10.") || resolved.starts_with("127.") || resolved == "0.0.0.0"
}

/// Sequentially verify resolver candidates against `domain`: TCP connect to
/// port 53, then resolve and reject poisoned answers. Survivors are returned
/// sorted by latency ascending. Cancellation is checked between candidates.
pub async fn verify_resolvers(
    resolvers: &[String],
    domain: &str,
    cancel: CancellationToken,
) -> Vec<ResolverResult> {
    let subset: Vec<String> = {
        let mut shuffled = resolvers.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        shuffled.truncate(SUBSET_CAP);
        shuffled
    };

    let mut verified: Vec<ResolverResult> = Vec::new();
    for resolver in &subset {
        if cancel.is_cancelled() {
            break;
        }
        let start = Instant::now();

        let connected = matches!(
            time::timeout(CONNECT_TIMEOUT, TcpStream::connect((resolver.as_str(), 53u16))).await,
            Ok(Ok(_))
        );
        if !connected {
            continue;
        }

        // The OS resolver answers here; the connect above only proves the
        // candidate speaks TCP on 53.
        let resolved = match lookup_host((domain, 443u16)).await {
            Ok(mut addrs) => addrs.next().map(|a| a.ip().to_string()),
            Err(_) => None,
        };
        let Some(resolved) = resolved else { continue };
        if is_poisoned(&resolved) {
            debug!(%resolver, %resolved, "rejecting poisoned answer");
            continue;
        }

        verified.push(ResolverResult {
            ip: resolver.clone(),
            latency_ms: start.elapsed().as_millis() as u64,
        });
    }

    verified.sort_by_key(|r| r.latency_ms);
    verified
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_blanks() {
        let input = "1.1.1.1\n# comment\n\n8.8.8.8  # google\n";
        assert_eq!(parse_resolvers_str(input), vec!["1.1.1.1", "8.8.8.8"]);
    }

    #[test]
    fn poisoned_answers_are_detected() {
        assert!(is_poisoned("10.10.34.34"));
        assert!(is_poisoned("127.0.0.1"));
        assert!(is_poisoned("0.0.0.0"));
        assert!(!is_poisoned("140.82.121.4"));
    }

    #[tokio::test]
    async fn unreachable_resolvers_are_dropped() {
        // TEST-NET-1 addresses are guaranteed non-routable.
        let resolvers = vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()];
        let out = verify_resolvers(&resolvers, "localhost", CancellationToken::new()).await;
        assert!(out.is_empty());
    }
}
