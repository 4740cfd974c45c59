use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use rand::Rng;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Published Cloudflare IPv4 blocks, used whenever the caller selects no
/// ranges of their own.
pub fn default_ranges() -> Vec<String> {
    const DEFAULT: &[&str] = &[
        "173.245.48.0/20",
        "103.21.244.0/22",
        "103.22.200.0/22",
        "103.31.4.0/22",
        "141.101.64.0/18",
        "108.162.192.0/18",
        "190.93.240.0/20",
        "188.114.96.0/20",
        "197.234.240.0/22",
        "198.41.128.0/17",
        "162.158.0.0/15",
        "104.16.0.0/13",
        "104.24.0.0/14",
        "172.64.0.0/13",
        "131.0.72.0/22",
    ];
    DEFAULT.iter().map(|s| s.to_string()).collect()
}

/// Sample a candidate host address from `"A.B.C.D/mask"`.
///
/// Heuristic, not strict subnet math: for masks <= 16 the third octet is
/// randomized over [0,255] and the fourth over [1,254] to cover large blocks;
/// otherwise only the fourth octet is randomized, keeping the first three
/// fixed. Excluding .0 and .255 hosts biases sampling toward usable
/// addresses. A malformed mask falls back to /24; a malformed address is an
/// error. Unseeded and collision-tolerant; the scanner dedupes by address.
pub fn generate_candidate(range: &str) -> Result<Ipv4Addr> {
    let (addr_part, mask_part) = match range.split_once('/') {
        Some((a, m)) => (a, m),
        None => (range, ""),
    };
    let base: Ipv4Addr = addr_part
        .trim()
        .parse()
        .with_context(|| format!("invalid range address: {range}"))?;
    let mask: u8 = mask_part.trim().parse().unwrap_or(24);
    let o = base.octets();

    let mut rng = rand::thread_rng();
    if mask <= 16 {
        Ok(Ipv4Addr::new(
            o[0],
            o[1],
            rng.gen_range(0..=255),
            rng.gen_range(1..=254),
        ))
    } else {
        Ok(Ipv4Addr::new(o[0], o[1], o[2], rng.gen_range(1..=254)))
    }
}

/// Parse a ranges file content into a deduplicated list of CIDR strings.
///
/// Supported per line: one `A.B.C.D/mask` block, `#` comments, blank lines.
/// Each entry must at least carry a parseable IPv4 network.
pub fn parse_ranges_str(s: &str) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        if line.parse::<Ipv4Net>().is_err() {
            // Tolerate a bare address without a mask; anything else is a typo
            // worth surfacing.
            if line.parse::<Ipv4Addr>().is_err() {
                bail!("line {line_no}: invalid range: {line}");
            }
        }
        if seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }

    Ok(out)
}

/// Load a ranges list from a file path. Errors if the file cannot be read or
/// parsed.
pub fn load_ranges_from_path(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ranges file: {}", path.as_ref().display()))?;
    parse_ranges_str(&content)
}

/// Load a ranges list from a file, or fall back to the built-in block set if
/// missing or empty.
pub fn load_ranges_or_default(path: impl AsRef<Path>) -> Vec<String> {
    match load_ranges_from_path(&path) {
        Ok(v) if !v.is_empty() => v,
        _ => default_ranges(),
    }
}
