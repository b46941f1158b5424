//! TCP readiness checks.
//!
//! Readiness is defined purely as "a TCP connect to the port succeeds". The
//! backend's log output is never parsed.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

use crate::defaults::{READY_CONNECT_TIMEOUT, READY_RETRY_INTERVAL};

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("{host}:{port} did not accept connections within {}s", .waited.as_secs())]
    Timeout {
        host: String,
        port: u16,
        waited: Duration,
    },
}

/// Single connect attempt. The socket is dropped as soon as the connect
/// succeeds.
pub async fn port_open(host: &str, port: u16, connect_timeout: Duration) -> bool {
    timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .is_ok_and(|r| r.is_ok())
}

/// Block until `host:port` accepts a connection or `overall` elapses.
pub async fn wait_for_port(host: &str, port: u16, overall: Duration) -> Result<(), ReadinessError> {
    wait_for_port_with(host, port, overall, READY_RETRY_INTERVAL).await
}

pub async fn wait_for_port_with(
    host: &str,
    port: u16,
    overall: Duration,
    retry_interval: Duration,
) -> Result<(), ReadinessError> {
    let started = Instant::now();
    let deadline = started + overall;
    let mut attempts: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let connect_timeout = READY_CONNECT_TIMEOUT.min(remaining.max(Duration::from_millis(1)));
        if port_open(host, port, connect_timeout).await {
            tracing::debug!(host, port, attempts, "port accepted connection");
            return Ok(());
        }
        attempts += 1;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ReadinessError::Timeout {
                host: host.to_string(),
                port,
                waited: started.elapsed(),
            });
        }
        tracing::trace!(host, port, attempts, "port not ready yet");
        sleep(retry_interval.min(remaining)).await;
    }
}
