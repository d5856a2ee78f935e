//! Byte relay between a local socket and a channel
//!
//! When one side reaches EOF the write half of the other side is shut down
//! and the opposite direction is drained. An error or cancellation ends
//! both, as does the idle timeout once neither direction has moved a byte
//! for that long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BUFFER_SIZE: usize = 32768;

/// Statistics for a forwarder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> local)
    pub bytes_received: u64,
}

/// Lock-free counters shared by every connection task of a forwarder
#[derive(Debug, Default)]
pub struct ForwardStatsAtomic {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ForwardStatsAtomic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn to_stats(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Count a new connection; the guard decrements `active_connections` on drop
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }
}

pub struct ConnectionGuard {
    stats: Arc<ForwardStatsAtomic>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    Error(String),
}

/// Last time either direction carried data
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Resolves once both directions have been quiet for `limit`
    async fn idle(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, activity: &Activity, counter: &AtomicU64) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return PumpEnd::Eof;
            }
            Ok(n) => {
                activity.touch();
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return PumpEnd::Error(format!("write: {}", e));
                }
                if let Err(e) = writer.flush().await {
                    return PumpEnd::Error(format!("flush: {}", e));
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => return PumpEnd::Error(format!("read: {}", e)),
        }
    }
}

/// Copy bytes both ways until both sides finish, one side fails, the
/// connection sits idle, or `cancel` fires
pub async fn relay<L, R>(
    local: L,
    remote: R,
    idle_timeout: Duration,
    stats: &ForwardStatsAtomic,
    cancel: &CancellationToken,
) where
    L: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let activity = Activity::new();

    let upstream = pump(&mut local_read, &mut remote_write, &activity, &stats.bytes_sent);
    let downstream = pump(&mut remote_read, &mut local_write, &activity, &stats.bytes_received);
    let idle = activity.idle(idle_timeout);
    tokio::pin!(upstream);
    tokio::pin!(downstream);
    tokio::pin!(idle);

    let idle_reason = || format!("idle for {:?}", idle_timeout);
    let reason = tokio::select! {
        _ = cancel.cancelled() => "cancelled".to_string(),

        _ = &mut idle => idle_reason(),

        end = &mut upstream => match end {
            PumpEnd::Eof => tokio::select! {
                _ = cancel.cancelled() => "cancelled".to_string(),
                _ = &mut idle => idle_reason(),
                end = &mut downstream => format!("local closed, remote {:?}", end),
            },
            other => format!("local {:?}", other),
        },

        end = &mut downstream => match end {
            PumpEnd::Eof => tokio::select! {
                _ = cancel.cancelled() => "cancelled".to_string(),
                _ = &mut idle => idle_reason(),
                end = &mut upstream => format!("remote closed, local {:?}", end),
            },
            other => format!("remote {:?}", other),
        },
    };

    debug!("Relay finished: {}", reason);
}
