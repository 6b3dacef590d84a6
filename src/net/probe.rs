//! Backing-service reachability probe.
//!
//! # Wire Exchange
//! ```text
//! connect(host, port)
//!     → write 00 00 00 08 00 00 00 00   (startup packet with an unsupported protocol version)
//!     → read until "SFATAL" is seen     (server rejects the version: it is alive)
//!     → EOF / socket error / timeout    (unreachable)
//! ```
//!
//! # Design Decisions
//! - Never authenticates; the server's rejection is the liveness signal
//! - Every failure resolves to `false`, nothing is propagated

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

/// Fixed 8-byte diagnostic frame: length 8, protocol version 0.
pub const PING_MESSAGE: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00];

/// Marker present in the server's error response.
pub const PONG_MARKER: &[u8] = b"SFATAL";

/// Stop reading after this many bytes without seeing the marker.
const MAX_RESPONSE_BYTES: usize = 4096;

/// A single reachability check.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self) -> bool;
}

/// Probe over a plain TCP socket.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self) -> bool {
        probe(&self.host, self.port, self.timeout).await
    }
}

/// Check whether the service at `host:port` answers the diagnostic frame
/// within `timeout`.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    match time::timeout(timeout, exchange(host, port)).await {
        Ok(Ok(alive)) => {
            if !alive {
                tracing::debug!(host, port, "Probe response did not contain the expected marker");
            }
            alive
        }
        Ok(Err(e)) => {
            tracing::debug!(host, port, error = %e, "Probe failed: socket error");
            false
        }
        Err(_) => {
            tracing::debug!(host, port, timeout_ms = timeout.as_millis() as u64, "Probe failed: timeout");
            false
        }
    }
}

async fn exchange(host: &str, port: u16) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(&PING_MESSAGE).await?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    let found = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // Closed before the marker showed up.
            break false;
        }
        response.extend_from_slice(&chunk[..n]);
        if contains_marker(&response) {
            break true;
        }
        if response.len() >= MAX_RESPONSE_BYTES {
            break false;
        }
    };

    let _ = stream.shutdown().await;
    Ok(found)
}

fn contains_marker(buf: &[u8]) -> bool {
    buf.windows(PONG_MARKER.len()).any(|w| w == PONG_MARKER)
}
