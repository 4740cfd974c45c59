use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use crate::types::ExchangeStatus;

const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(1500);
const TRACE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Fetch the edge trace endpoint for `ip` and pull the colo / country codes
/// out of its `key=value` body.
///
/// Any failure degrades to the ("unknown", "??") sentinels; enrichment never
/// blocks or fails a scan.
pub async fn fetch_edge_info(client: &reqwest::Client, ip: &str) -> (String, String) {
    let url = format!("http://{ip}/cdn-cgi/trace");
    let req = client
        .get(&url)
        .header(reqwest::header::HOST, "cloudflare.com")
        .timeout(TRACE_TIMEOUT);

    let body = match req.send().await {
        Ok(resp) => match resp.text().await {
            Ok(text) => text,
            Err(_) => return ("unknown".to_string(), "??".to_string()),
        },
        Err(_) => return ("unknown".to_string(), "??".to_string()),
    };

    let field = |key: &str| {
        body.lines()
            .find_map(|l| l.strip_prefix(key))
            .map(str::to_string)
    };
    let colo = field("colo=").unwrap_or_else(|| "unknown".to_string());
    let country = field("loc=").unwrap_or_else(|| "??".to_string());
    (colo, country)
}

/// Check that the endpoint actually exchanges application data, not just
/// accepts connects: one plaintext request line, one bounded read.
pub async fn check_data_exchange(ip: &str, port: u16) -> ExchangeStatus {
    match exchange_inner(ip, port).await {
        Ok(n) if n > 0 => ExchangeStatus::Success,
        Ok(_) => ExchangeStatus::NoResponse,
        Err(_) => ExchangeStatus::Failed,
    }
}

async fn exchange_inner(ip: &str, port: u16) -> std::io::Result<usize> {
    let mut stream = time::timeout(EXCHANGE_TIMEOUT, TcpStream::connect((ip, port)))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

    let request = b"GET /cdn-cgi/trace HTTP/1.1\r\nHost: cloudflare.com\r\n\r\n";
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; 1024];
    let n = time::timeout(EXCHANGE_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exchange_success_on_answering_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
            }
        });

        let status = check_data_exchange("127.0.0.1", port).await;
        assert_eq!(status, ExchangeStatus::Success);
    }

    #[tokio::test]
    async fn exchange_no_response_on_silent_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                let _ = sock.read(&mut buf).await;
                // Drop without writing anything back: reader sees EOF.
            }
        });

        let status = check_data_exchange("127.0.0.1", port).await;
        assert_eq!(status, ExchangeStatus::NoResponse);
    }

    #[tokio::test]
    async fn exchange_failed_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let status = check_data_exchange("127.0.0.1", port).await;
        assert_eq!(status, ExchangeStatus::Failed);
    }
}
