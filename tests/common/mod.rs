//! Shared utilities for integration and load testing.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bulkhead::boundary::TransportError;
use bulkhead::config::BulkheadConfig;

/// Defaults with the WARM tier under `dir` and short grace periods.
#[allow(dead_code)]
pub fn test_config(dir: &Path) -> BulkheadConfig {
    let mut config = BulkheadConfig::default();
    config.cache.warm_dir = dir.join("disk").join("warm");
    config.cache.warm_capacity_bytes = 1 << 20;
    config.lifecycle.drain_grace_secs = 1;
    config.observability.metrics_enabled = false;
    config
}

/// Start a line-oriented backend on an ephemeral port.
///
/// For every connection `f` is called; `Some(reply)` is written back,
/// `None` closes the socket without answering.
#[allow(dead_code)]
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 1024];
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if let Some(reply) = f(request).await {
                            let _ = socket.write_all(reply.as_bytes()).await;
                        }
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Send `payload` to `addr` and read the whole reply.
#[allow(dead_code)]
pub async fn roundtrip(addr: SocketAddr, payload: String) -> Result<String, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload.as_bytes()).await?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    if reply.is_empty() {
        return Err(TransportError::new("connection closed without reply"));
    }
    Ok(reply)
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}
