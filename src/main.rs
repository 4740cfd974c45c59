use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use edge_scan_rs::diagnostics::{self, DiagnosticsConfig, SharedDiagnostics};
use edge_scan_rs::fragment::{self, FragmentGrid, SharedFragmentScan};
use edge_scan_rs::scanner::{self, ScanConfig, SharedScan};
use edge_scan_rs::types::{DiagnosticStatus, EndpointResult, FragmentCandidate};
use edge_scan_rs::{ranges, resolvers, server, update};

/// edge-scan-rs — async clean-IP scanner and fragmentation tuner for CDN edge endpoints.
#[derive(Debug, Parser)]
#[command(
    name = "edge-scan-rs",
    version,
    about = "Async clean-IP scanner and fragmentation tuner for CDN edge endpoints.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan CDN ranges for reachable endpoints and rank them.
    Scan {
        /// Path to a ranges file (one CIDR per line). Missing file means the built-in set.
        #[arg(long, default_value = "ranges.txt")]
        ranges: PathBuf,

        /// Max concurrent probe tasks.
        #[arg(long, default_value_t = 10)]
        concurrency: usize,

        /// Per connect attempt timeout in milliseconds.
        #[arg(long = "timeout-ms", default_value_t = 1000)]
        timeout_ms: u64,

        /// Stop after this many accepted endpoints.
        #[arg(long = "max-results", default_value_t = 20)]
        max_results: usize,

        /// Port probed on every candidate.
        #[arg(long, default_value_t = 443)]
        port: u16,

        /// Write the ranked results as pretty JSON to this path (optional).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Sweep the fragmentation grid against a fixed target.
    Fragment {
        /// Target host for the sweep.
        #[arg(long, default_value = "1.1.1.1")]
        host: String,

        #[arg(long, default_value_t = 443)]
        port: u16,
    },

    /// Run the four-step network health sequence.
    Diagnose {
        /// Target server checked by the final step.
        #[arg(long, default_value = "1.1.1.1")]
        target: String,

        #[arg(long, default_value_t = 443)]
        port: u16,
    },

    /// Verify DNS resolver candidates from a file and rank them by latency.
    Resolvers {
        #[arg(long, default_value = "resolvers.txt")]
        file: PathBuf,

        /// Domain resolved while verifying.
        #[arg(long, default_value = "www.github.com")]
        domain: String,
    },

    /// Check the update endpoint for newer release metadata.
    Update {
        #[arg(long)]
        url: String,
    },

    /// Serve the HTTP control API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("edge_scan_rs=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Scan {
            ranges: ranges_path,
            concurrency,
            timeout_ms,
            max_results,
            port,
            output,
        } => {
            let selected = ranges::load_ranges_or_default(&ranges_path);
            println!("edge-scan-rs configuration:");
            println!("  ranges       : {} blocks", selected.len());
            println!("  concurrency  : {concurrency}");
            println!("  timeout_ms   : {timeout_ms}");
            println!("  max_results  : {max_results}");
            println!("  port         : {port}");

            let cfg = ScanConfig {
                ranges: selected,
                concurrency,
                timeout: Duration::from_millis(timeout_ms),
                max_results,
                port,
            };
            let cancel = ctrl_c_token();
            let shared = SharedScan::new();
            let results = scanner::scan_endpoints(&cfg, cancel, shared.clone()).await?;
            println!("\n{}", shared.status_text().await);
            print_endpoint_table(&results);
            if let Some(path) = output.as_deref() {
                write_results_json(path, &results)?;
                println!("Wrote JSON results to {}", path.display());
            }
        }

        Command::Fragment { host, port } => {
            let cancel = ctrl_c_token();
            let shared = SharedFragmentScan::new();
            match fragment::scan_fragments(&host, port, &FragmentGrid::default(), cancel, shared.clone())
                .await
            {
                Ok(candidates) => {
                    println!("\n{}", shared.status_text().await);
                    print_fragment_table(&candidates);
                }
                Err(e) => eprintln!("fragment scan did not run: {e}"),
            }
        }

        Command::Diagnose { target, port } => {
            let cfg = DiagnosticsConfig::for_target(target, port);
            let shared = SharedDiagnostics::new();
            let steps = diagnostics::run_diagnostics(&cfg, &shared).await;
            for step in &steps {
                let mark = match step.status {
                    DiagnosticStatus::Success => "ok",
                    DiagnosticStatus::Warning => "warn",
                    DiagnosticStatus::Error => "FAIL",
                    DiagnosticStatus::Pending => "skip",
                    DiagnosticStatus::Running => "...",
                };
                println!("[{mark:>4}] {:<22} {}", step.name, step.message);
            }
            if let Some(hint) = diagnostics::remediation(&steps) {
                println!("\nsuggested fix: {hint}");
            }
        }

        Command::Resolvers { file, domain } => {
            let candidates = resolvers::load_resolvers_from_path(&file)?;
            println!("testing {} resolver candidates against {domain}", candidates.len());
            let verified = resolvers::verify_resolvers(&candidates, &domain, ctrl_c_token()).await;
            for r in verified.iter().take(10) {
                println!("{:<16} {:>6} ms", r.ip, r.latency_ms);
            }
        }

        Command::Update { url } => match update::fetch_update_info(&url).await {
            Some(info) => {
                println!("latest version code : {}", info.version_code);
                println!("download            : {}", info.download_url);
                println!("mirror              : {}", info.mirror_url);
                println!("changelog           : {}", info.change_log);
            }
            None => println!("no update metadata available"),
        },

        Command::Serve { bind } => {
            server::spawn_server(&bind).await?;
        }
    }

    Ok(())
}

/// A token cancelled on Ctrl-C, so every long-running mode stops cooperatively.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        child.cancel();
    });
    cancel
}

fn write_results_json(path: &std::path::Path, results: &[EndpointResult]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

fn print_endpoint_table(results: &[EndpointResult]) {
    println!(
        "{:<16}  {:>5}  {:>7}  {:>5}  {:<8}  {:<4}  exchange",
        "address", "port", "latency", "loss", "colo", "cc"
    );
    for e in results {
        println!(
            "{:<16}  {:>5}  {:>5}ms  {:>4}%  {:<8}  {:<4}  {:?}",
            e.address, e.port, e.latency_ms, e.packet_loss, e.colo, e.country_code, e.exchange_status
        );
    }
}

fn print_fragment_table(candidates: &[FragmentCandidate]) {
    println!(
        "{:<8}  {:>8}  {:>9}  {:>7}",
        "length", "interval", "stability", "latency"
    );
    for c in candidates {
        println!(
            "{:<8}  {:>6}ms  {:>8}%  {:>5}ms",
            c.chunk_len, c.interval_ms, c.stability, c.latency_ms
        );
    }
}
