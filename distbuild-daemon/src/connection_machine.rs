//! Outbound connect-with-reconnect (`spec.md` §4.9). Used for worker
//! addresses configured as `host:port` the controller dials out to,
//! rather than accepts connections from.
//!
//! Grounded on `connection_machine.py`'s `connecting -> connected ->
//! timeout -> connecting` cycle; the `ProxyEventSource` swap trick from
//! the original has no Rust counterpart needed here, since each
//! connection attempt simply spawns a fresh worker-connection task
//! rather than rebinding one persistent event source.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Repeatedly dials `addr`, running `on_connect` to completion each time
/// a connection succeeds, until `stop` fires. Mirrors the
/// `connecting`/`timeout` states: a failed dial or a closed connection
/// both lead back to a delay-then-retry, not a terminated task.
pub async fn run_with_reconnect<F, Fut>(
    addr: String,
    reconnect_interval: Duration,
    mut stop: tokio::sync::oneshot::Receiver<()>,
    mut on_connect: F,
) where
    F: FnMut(TcpStream) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = &mut stop => {
                info!(%addr, "connection machine stopped");
                return;
            }
            result = TcpStream::connect(&addr) => {
                match result {
                    Ok(stream) => {
                        debug!(%addr, "connected");
                        on_connect(stream).await;
                        info!(%addr, "connection ended, will reconnect");
                    }
                    Err(err) => {
                        warn!(%addr, error = %err, "connect failed, retrying after backoff");
                    }
                }
            }
        }

        tokio::select! {
            _ = &mut stop => return,
            _ = tokio::time::sleep(reconnect_interval) => {}
        }
    }
}
