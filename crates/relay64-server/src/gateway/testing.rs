//! Test doubles for the gateway: in-memory dialers and drop-counting streams.

use super::forwarder::Dialer;
use std::future::Future;
use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

/// Wraps a stream and counts how many times it is dropped.
pub struct Tracked<S> {
    inner: S,
    drops: Arc<AtomicUsize>,
}

impl<S> Tracked<S> {
    pub fn new(inner: S, drops: Arc<AtomicUsize>) -> Self {
        Self { inner, drops }
    }
}

impl<S> Drop for Tracked<S> {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// How a [`MockDialer`] answers.
#[derive(Debug, Clone, Copy)]
pub enum DialBehavior {
    /// Hand out one end of an in-memory pipe; the other end goes to the test.
    Connect,
    /// Fail with `ConnectionRefused`.
    Refuse,
    /// Never complete.
    Hang,
}

/// Records every dial and answers according to its [`DialBehavior`].
pub struct MockDialer {
    behavior: DialBehavior,
    dialed: Arc<Mutex<Vec<SocketAddrV4>>>,
    remotes: mpsc::UnboundedSender<DuplexStream>,
    outbound_drops: Arc<AtomicUsize>,
}

/// The test's view of a [`MockDialer`].
pub struct DialerProbe {
    pub dialed: Arc<Mutex<Vec<SocketAddrV4>>>,
    pub remotes: mpsc::UnboundedReceiver<DuplexStream>,
    pub outbound_drops: Arc<AtomicUsize>,
}

impl DialerProbe {
    pub fn dialed(&self) -> Vec<SocketAddrV4> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn outbound_drops(&self) -> usize {
        self.outbound_drops.load(Ordering::SeqCst)
    }
}

impl MockDialer {
    pub fn new(behavior: DialBehavior) -> (Self, DialerProbe) {
        let dialed = Arc::new(Mutex::new(Vec::new()));
        let outbound_drops = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            behavior,
            dialed: dialed.clone(),
            remotes: tx,
            outbound_drops: outbound_drops.clone(),
        };
        let probe = DialerProbe {
            dialed,
            remotes: rx,
            outbound_drops,
        };
        (dialer, probe)
    }
}

impl Dialer for MockDialer {
    type Stream = Tracked<DuplexStream>;

    fn dial(&self, target: SocketAddrV4) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        self.dialed.lock().unwrap().push(target);
        let behavior = self.behavior;
        let remotes = self.remotes.clone();
        let drops = self.outbound_drops.clone();
        async move {
            match behavior {
                DialBehavior::Connect => {
                    let (local, remote) = tokio::io::duplex(1024);
                    let _ = remotes.send(remote);
                    Ok(Tracked::new(local, drops))
                }
                DialBehavior::Refuse => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
                DialBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(io::Error::from(io::ErrorKind::TimedOut))
                }
            }
        }
    }
}
