//! Listening sockets: one per configured port on the wildcard address.
//!
//! Ports bind independently. A port that cannot be bound is reported and
//! skipped, and the remaining listeners start anyway. Each accepted
//! connection is handed to its own spawned [`ConnectionHandler`] task, so
//! nothing one connection does can stall an accept loop or another
//! connection.

use super::forwarder::{ConnectionHandler, Dialer};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept` (e.g. out of file descriptors) before
/// trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Pending-connection queue length for each listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// A configured port that could not be bound.
#[derive(Debug)]
pub struct BindFailure {
    pub port: u16,
    pub error: io::Error,
}

/// The set of successfully bound listeners.
pub struct ListenerSet {
    listeners: Vec<TcpListener>,
}

impl ListenerSet {
    /// Bind `bind_addr:port` for every port in `ports`.
    ///
    /// Never fails as a whole: the returned set holds whatever bound, and
    /// each port that did not is returned as a [`BindFailure`].
    pub fn bind(bind_addr: IpAddr, ports: &[u16]) -> (Self, Vec<BindFailure>) {
        let mut listeners = Vec::with_capacity(ports.len());
        let mut failures = Vec::new();

        for &port in ports {
            let addr = SocketAddr::new(bind_addr, port);
            match bind_listener(addr) {
                Ok(listener) => {
                    let actual = listener.local_addr().unwrap_or(addr);
                    info!(addr = %actual, "listening");
                    listeners.push(listener);
                }
                Err(e) => {
                    error!(addr = %addr, error = %e, "failed to bind listener");
                    failures.push(BindFailure { port, error: e });
                }
            }
        }

        (Self { listeners }, failures)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Addresses actually bound (port `0` resolves to the OS-chosen port).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accept on every listener until this future is dropped.
    ///
    /// Dropping it stops all accept loops and closes the listening sockets;
    /// connections already handed off keep running in their own tasks.
    pub async fn run<D: Dialer>(self, handler: Arc<ConnectionHandler<D>>) {
        let mut loops = JoinSet::new();
        for listener in self.listeners {
            loops.spawn(accept_loop(listener, handler.clone()));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "accept loop died");
            }
        }
    }
}

/// Bind one listening socket. An IPv6 socket also accepts IPv4 clients
/// (as IPv4-mapped peers) whatever the host's `bindv6only` default is.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop<D: Dialer>(listener: TcpListener, handler: Arc<ConnectionHandler<D>>) {
    let local = listener.local_addr().ok();

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "connection accepted");
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler.handle(stream).await;
                });
            }
            Err(e) => {
                warn!(listener = ?local, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
