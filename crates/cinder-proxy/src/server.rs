//! Listener setup and the accept loop.
//!
//! Accepts clients in a tight loop, absorbing transient errors and
//! deferring on descriptor shortage. Two ceilings are enforced before
//! any connection state is allocated (the global client limit and the
//! per-pool limit), and a socket over either ceiling is closed on the
//! spot so the backlog can't grow. Successful accepts get TCP_NODELAY
//! and a spawned handler task holding both ceiling permits.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::connection::{self, PoolContext};
use crate::stats;

/// Binds a listening socket with an explicit backlog.
pub fn bind(listen: &str, backlog: u32) -> io::Result<TcpListener> {
    let addr: std::net::SocketAddr = listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad listen address '{listen}': {e}")))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Accepts clients for one pool until the listener fails fatally.
pub async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<PoolContext>,
    global: Arc<Semaphore>,
    per_pool: Arc<Semaphore>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) if is_transient(&e) => {
                debug!(pool = %ctx.name, "accept not ready: {e}");
                continue;
            }
            Err(e) if is_fd_shortage(&e) => {
                warn!(pool = %ctx.name, "out of descriptors, deferring accepts: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Err(e) => {
                error!(pool = %ctx.name, "accept failed: {e}");
                return;
            }
        };

        // ceilings are checked before any connection state exists; an
        // over-limit socket is closed immediately
        let Ok(global_permit) = global.clone().try_acquire_owned() else {
            warn!(pool = %ctx.name, %peer, "global client ceiling reached, dropping connection");
            stats::connection_rejected(&ctx.name);
            continue;
        };
        let Ok(pool_permit) = per_pool.clone().try_acquire_owned() else {
            warn!(pool = %ctx.name, %peer, "pool client ceiling reached, dropping connection");
            stats::connection_rejected(&ctx.name);
            continue;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed, ignored: {e}");
        }

        stats::connection_accepted(&ctx.name);
        debug!(pool = %ctx.name, %peer, "accepted client");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, peer, ctx).await {
                debug!(%peer, "connection closed: {e}");
            }
            drop(global_permit);
            drop(pool_permit);
        });
    }
}

/// Errors absorbed by retrying the accept immediately.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// ENFILE / EMFILE: no descriptor to accept into right now.
fn is_fd_shortage(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use cinder_core::{Continuum, HashKind, StaticRules};
    use cinder_protocol::KeyType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn test_ctx() -> Arc<PoolContext> {
        let pool = cinder_core::pool::spawn_pool(Vec::new(), Duration::from_secs(1));
        Arc::new(PoolContext {
            name: "test".into(),
            continuum: Continuum::uniform(1),
            hash: HashKind::Murmur,
            key_field: b"uid".to_vec(),
            key_type: KeyType::Unsigned,
            timeout: Duration::from_secs(1),
            pool,
            cache_groups: vec![0],
            hot_group: None,
            full_group: None,
            classifier: Arc::new(StaticRules::default()),
            synth_keys: AtomicU64::new(1),
            unit_ids: Arc::new(AtomicU64::new(1)),
        })
    }

    #[tokio::test]
    async fn ceiling_breach_closes_the_socket_without_state() {
        let listener = bind("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();

        // per-pool ceiling of zero: every accept is over the limit
        let global = Arc::new(Semaphore::new(8));
        let per_pool = Arc::new(Semaphore::new(0));
        tokio::spawn(accept_loop(listener, test_ctx(), global.clone(), per_pool));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        // the proxy closes immediately without sending anything
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("proxy must close promptly")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // no permit was consumed
        assert_eq!(global.available_permits(), 8);
    }

    #[tokio::test]
    async fn accepted_client_gets_the_auth_acknowledgment() {
        let listener = bind("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let global = Arc::new(Semaphore::new(8));
        let per_pool = Arc::new(Semaphore::new(8));
        tokio::spawn(accept_loop(listener, test_ctx(), global, per_pool));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        // login unit: 1-byte payload, sequence 1
        client.write_all(b"\x01\x00\x00\x01\x00").await.unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("reply must arrive")
            .unwrap();
        // synthesized OK unit: header + OK marker, sequence bumped
        assert!(n >= 5);
        assert_eq!(buf[3], 2, "reply sequence follows the request");
        assert_eq!(buf[4], 0x00, "OK marker");
    }

    #[tokio::test]
    async fn malformed_unit_tears_the_connection_down() {
        let listener = bind("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(accept_loop(
            listener,
            test_ctx(),
            Arc::new(Semaphore::new(8)),
            Arc::new(Semaphore::new(8)),
        ));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        // authenticate first
        client.write_all(b"\x01\x00\x00\x01\x00").await.unwrap();
        let mut buf = [0u8; 64];
        let _ = client.read(&mut buf).await.unwrap();

        // a unit declaring an oversized payload is connection-fatal
        client.write_all(b"\xff\xff\xff\x02").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("proxy must close promptly")
            .unwrap_or(0);
        assert_eq!(n, 0, "connection is torn down");
    }
}
