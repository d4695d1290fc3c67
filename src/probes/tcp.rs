//! TCP connection probe implementation.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

/// Run a TCP connection probe to the specified host:port.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> TcpResult {
    let start = Instant::now();
    let attempt = tokio::time::timeout(timeout, TcpStream::connect((host, port))).await;

    let latency_ms = match attempt {
        Ok(Ok(_stream)) => Some(start.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            tracing::debug!(%host, %port, error = %e, "TCP connect failed");
            None
        }
        Err(_) => {
            tracing::debug!(%host, %port, timeout_ms = timeout.as_millis() as u64, "TCP connect timed out");
            None
        }
    };

    TcpResult {
        host: host.to_string(),
        port,
        latency_ms,
        reachable: latency_ms.is_some(),
    }
}

/// Whether a TCP connection to `host:port` can be established within `timeout`.
pub async fn can_connect(host: &str, port: u16, timeout: Duration) -> bool {
    probe(host, port, timeout).await.reachable
}

#[derive(Debug, serde::Serialize)]
pub struct TcpResult {
    pub host: String,
    pub port: u16,
    pub latency_ms: Option<f64>,
    pub reachable: bool,
}
