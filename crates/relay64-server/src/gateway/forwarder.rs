//! Per-connection pipeline: extract addresses, synthesize and vet the IPv4
//! target, dial it, and relay until both sides are done.
//!
//! ```text
//! Accepted → AddressExtracted → Translated → Validated → Dialing → Relaying → Closed
//!     └────────────┴───────────────┴────────────┴──────────┴──→ Rejected
//! ```
//!
//! The handler owns the inbound stream (and the outbound one once dialed),
//! so every exit path, rejection or relay completion, closes them exactly
//! once when they go out of scope.

use super::relay::{Relay, RelayOptions, RelaySummary};
use crate::config::RelayConfig;
use relay64_core::{classify, translate_endpoint, DenyReason, TranslateError, Verdict};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Opens outbound connections to synthesized targets.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn dial(&self, target: SocketAddrV4) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Dials plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn dial(&self, target: SocketAddrV4) -> impl Future<Output = io::Result<TcpStream>> + Send {
        TcpStream::connect(target)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Accepted,
    AddressExtracted,
    Translated,
    Validated,
    Dialing,
    Relaying,
    Closed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Accepted => "accepted",
            Stage::AddressExtracted => "address-extracted",
            Stage::Translated => "translated",
            Stage::Validated => "validated",
            Stage::Dialing => "dialing",
            Stage::Relaying => "relaying",
            Stage::Closed => "closed",
        }
    }
}

/// Why a connection was closed without being forwarded.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("connection addresses unavailable: {0}")]
    AddressUnavailable(#[source] io::Error),

    #[error("no IPv4 target in destination: {0}")]
    Translate(#[from] TranslateError),

    #[error("target {target} denied ({reason})")]
    Denied {
        target: SocketAddrV4,
        reason: DenyReason,
    },

    #[error("dial {target} failed: {source}")]
    DialFailed {
        target: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("dial {target} timed out after {timeout:?}")]
    DialTimeout {
        target: SocketAddrV4,
        timeout: Duration,
    },
}

impl Rejection {
    /// The stage the pipeline had reached when it gave up.
    pub fn stage(&self) -> Stage {
        match self {
            Rejection::AddressUnavailable(_) => Stage::Accepted,
            Rejection::Translate(_) => Stage::AddressExtracted,
            Rejection::Denied { .. } => Stage::Translated,
            Rejection::DialFailed { .. } | Rejection::DialTimeout { .. } => Stage::Dialing,
        }
    }
}

/// Endpoints of one connection. Only constructed once the target has been
/// synthesized and allowed, and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    client: SocketAddr,
    listener: SocketAddr,
    target: SocketAddrV4,
}

impl ConnectionContext {
    /// Translate the listener-side address and run it through the
    /// destination filter.
    pub fn establish(client: SocketAddr, listener: SocketAddr) -> Result<Self, Rejection> {
        let target = translate_endpoint(listener)?;
        if let Verdict::Denied(reason) = classify(*target.ip()) {
            return Err(Rejection::Denied { target, reason });
        }
        Ok(Self {
            client,
            listener,
            target,
        })
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn listener(&self) -> SocketAddr {
        self.listener
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} -> {}", self.client, self.listener, self.target)
    }
}

/// Result of handling one connection.
#[derive(Debug)]
pub enum Outcome {
    Relayed {
        context: ConnectionContext,
        summary: RelaySummary,
    },
    Rejected(Rejection),
}

/// Runs the pipeline for each accepted connection. Holds no per-connection
/// state; one instance is shared by every listener.
pub struct ConnectionHandler<D = TcpDialer> {
    dialer: D,
    relay: Relay,
    dial_timeout: Option<Duration>,
}

impl ConnectionHandler<TcpDialer> {
    pub fn new(config: &RelayConfig) -> Self {
        let options = RelayOptions {
            buffer_size: config.buffer_size,
            idle_timeout: config.idle_timeout,
            drain_timeout: config.drain_timeout,
        };
        Self::with_dialer(TcpDialer, options, config.dial_timeout)
    }
}

impl<D: Dialer> ConnectionHandler<D> {
    pub fn with_dialer(dialer: D, options: RelayOptions, dial_timeout: Option<Duration>) -> Self {
        Self {
            dialer,
            relay: Relay::new(options),
            dial_timeout,
        }
    }

    /// Handle a freshly accepted TCP connection.
    pub async fn handle(&self, stream: TcpStream) -> Outcome {
        let addrs = stream
            .peer_addr()
            .and_then(|peer| Ok((peer, stream.local_addr()?)));

        match addrs {
            Ok((peer, local)) => self.handle_stream(stream, peer, local).await,
            Err(e) => self.reject(stream, Rejection::AddressUnavailable(e)).await,
        }
    }

    /// Handle a connection whose addresses are already known.
    ///
    /// `local` is the listener-side address the client connected to; the
    /// target is synthesized from it.
    pub async fn handle_stream<S>(&self, inbound: S, peer: SocketAddr, local: SocketAddr) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let context = match ConnectionContext::establish(peer, local) {
            Ok(context) => context,
            Err(rejection) => return self.reject_from(inbound, peer, rejection).await,
        };

        debug!(
            client = %context.client(),
            target = %context.target(),
            stage = Stage::Validated.as_str(),
            "dialing"
        );

        let outbound = match self.dial(context.target()).await {
            Ok(stream) => stream,
            Err(rejection) => return self.reject_from(inbound, peer, rejection).await,
        };

        info!(
            client = %context.client(),
            listener = %context.listener(),
            target = %context.target(),
            stage = Stage::Relaying.as_str(),
            "forwarding"
        );

        let summary = self
            .relay
            .run(inbound, outbound, &context.to_string())
            .await;

        debug!(
            client = %context.client(),
            target = %context.target(),
            sent = summary.upstream.bytes,
            received = summary.downstream.bytes,
            stage = Stage::Closed.as_str(),
            "connection closed"
        );

        Outcome::Relayed { context, summary }
    }

    async fn dial(&self, target: SocketAddrV4) -> Result<D::Stream, Rejection> {
        let attempt = self.dialer.dial(target);
        let result = match self.dial_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| Rejection::DialTimeout { target, timeout })?,
            None => attempt.await,
        };
        result.map_err(|source| Rejection::DialFailed { target, source })
    }

    async fn reject_from<S>(&self, inbound: S, peer: SocketAddr, rejection: Rejection) -> Outcome
    where
        S: AsyncWrite + Unpin,
    {
        match &rejection {
            Rejection::DialFailed { .. } | Rejection::DialTimeout { .. } => {
                warn!(client = %peer, stage = rejection.stage().as_str(), reason = %rejection, "rejected");
            }
            _ => {
                debug!(client = %peer, stage = rejection.stage().as_str(), reason = %rejection, "rejected");
            }
        }
        Self::close(inbound).await;
        Outcome::Rejected(rejection)
    }

    async fn reject<S>(&self, inbound: S, rejection: Rejection) -> Outcome
    where
        S: AsyncWrite + Unpin,
    {
        warn!(stage = rejection.stage().as_str(), reason = %rejection, "rejected");
        Self::close(inbound).await;
        Outcome::Rejected(rejection)
    }

    async fn close<S: AsyncWrite + Unpin>(mut inbound: S) {
        let _ = inbound.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::relay::RelayEnd;
    use crate::gateway::testing::{DialBehavior, MockDialer, Tracked};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt};

    const CLIENT: &str = "[2001:db8::1]:50000";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn handler(behavior: DialBehavior) -> (ConnectionHandler<MockDialer>, crate::gateway::testing::DialerProbe) {
        let (dialer, probe) = MockDialer::new(behavior);
        let options = RelayOptions {
            buffer_size: 1024,
            idle_timeout: None,
            drain_timeout: Duration::from_secs(5),
        };
        (ConnectionHandler::with_dialer(dialer, options, Some(Duration::from_millis(200))), probe)
    }

    #[test]
    fn test_context_synthesizes_target() {
        let ctx = ConnectionContext::establish(addr(CLIENT), addr("[64:ff9b::93:184:216:34]:443")).unwrap();
        assert_eq!(ctx.target(), SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443));
        assert_eq!(ctx.client(), addr(CLIENT));
        assert_eq!(ctx.listener(), addr("[64:ff9b::93:184:216:34]:443"));
    }

    #[test]
    fn test_context_rejects_private_target() {
        let err = ConnectionContext::establish(addr(CLIENT), addr("[2001:db8::10:0:0:1]:80")).unwrap_err();
        assert!(matches!(err, Rejection::Denied { reason: DenyReason::Private, .. }));
        assert_eq!(err.stage(), Stage::Translated);
    }

    #[tokio::test]
    async fn test_forwards_bytes_verbatim() {
        let (handler, mut probe) = handler(DialBehavior::Connect);
        let (mut client, inbound) = duplex(1024);

        let task = tokio::spawn(async move {
            handler
                .handle_stream(inbound, addr(CLIENT), addr("[64:ff9b::93:184:216:34]:443"))
                .await
        });

        let mut remote = probe.remotes.recv().await.unwrap();
        assert_eq!(
            probe.dialed(),
            vec![SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443)]
        );

        let hello = b"\x16\x03\x01\x00\x05hello";
        client.write_all(hello).await.unwrap();
        let mut got = vec![0u8; hello.len()];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, hello);

        remote.write_all(b"\x16\x03\x03world").await.unwrap();
        let mut got = vec![0u8; 8];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"\x16\x03\x03world");

        remote.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        client.shutdown().await.unwrap();

        match task.await.unwrap() {
            Outcome::Relayed { context, summary } => {
                assert_eq!(context.target().port(), 443);
                assert_eq!(summary.upstream.bytes, hello.len() as u64);
                assert_eq!(summary.downstream.bytes, 8);
                assert!(matches!(summary.downstream.end, RelayEnd::Eof));
            }
            Outcome::Rejected(r) => panic!("unexpected rejection: {r}"),
        }
        assert_eq!(probe.outbound_drops(), 1);
    }

    #[tokio::test]
    async fn test_loopback_target_never_dialed() {
        let (handler, probe) = handler(DialBehavior::Connect);
        let (mut client, inbound) = duplex(64);

        let outcome = handler
            .handle_stream(inbound, addr(CLIENT), addr("[2001:db8::127:0:0:1]:8080"))
            .await;

        assert!(matches!(
            outcome,
            Outcome::Rejected(Rejection::Denied { reason: DenyReason::Loopback, .. })
        ));
        assert!(probe.dialed().is_empty());

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_untranslatable_destination_rejected() {
        let (handler, probe) = handler(DialBehavior::Connect);
        let (mut client, inbound) = duplex(64);

        let outcome = handler
            .handle_stream(inbound, addr(CLIENT), addr("[2001:db8::93:184:216:ff]:443"))
            .await;

        match outcome {
            Outcome::Rejected(r) => {
                assert!(matches!(r, Rejection::Translate(TranslateError::NonDecimalGroup { .. })));
                assert_eq!(r.stage(), Stage::AddressExtracted);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(probe.dialed().is_empty());

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ipv4_listener_rejected() {
        let (handler, _probe) = handler(DialBehavior::Connect);
        let (_client, inbound) = duplex(64);

        let outcome = handler
            .handle_stream(inbound, addr("127.0.0.1:50000"), addr("127.0.0.1:443"))
            .await;
        assert!(matches!(
            outcome,
            Outcome::Rejected(Rejection::Translate(TranslateError::NotIpv6(_)))
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_not_retried() {
        let (handler, probe) = handler(DialBehavior::Refuse);
        let (mut client, inbound) = duplex(64);

        let outcome = handler
            .handle_stream(inbound, addr(CLIENT), addr("[2001:db8::8:8:8:8]:53"))
            .await;

        match outcome {
            Outcome::Rejected(r @ Rejection::DialFailed { .. }) => assert_eq!(r.stage(), Stage::Dialing),
            other => panic!("expected dial failure, got {other:?}"),
        }
        assert_eq!(probe.dialed().len(), 1);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        let (handler, _probe) = handler(DialBehavior::Hang);
        let (_client, inbound) = duplex(64);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            handler.handle_stream(inbound, addr(CLIENT), addr("[2001:db8::1:1:1:1]:443")),
        )
        .await
        .expect("dial timeout should fire");
        assert!(matches!(outcome, Outcome::Rejected(Rejection::DialTimeout { .. })));
    }

    /// Runs one connection with a drop-counted inbound stream and returns
    /// (inbound drops, outbound drops) after the handler finished.
    async fn drops_after(behavior: DialBehavior, local: &str, relay_error: bool) -> (usize, usize) {
        let (handler, mut probe) = handler(behavior);
        let inbound_drops = Arc::new(AtomicUsize::new(0));
        let (mut client, inbound) = duplex(64);
        let inbound = Tracked::new(inbound, inbound_drops.clone());
        let local = addr(local);

        let task = tokio::spawn(async move { handler.handle_stream(inbound, addr(CLIENT), local).await });

        if matches!(behavior, DialBehavior::Connect) {
            if let Some(remote) = probe.remotes.recv().await {
                if relay_error {
                    // Remote vanishes mid-stream, the client keeps writing.
                    drop(remote);
                    let mut buf = [0u8; 1];
                    let _ = client.read(&mut buf).await;
                    let _ = client.write_all(b"late").await;
                } else {
                    let mut remote = remote;
                    client.write_all(b"ping").await.unwrap();
                    let mut buf = [0u8; 4];
                    remote.read_exact(&mut buf).await.unwrap();
                    remote.shutdown().await.unwrap();
                    client.shutdown().await.unwrap();
                    let mut rest = Vec::new();
                    let _ = client.read_to_end(&mut rest).await;
                    let _ = remote.read_to_end(&mut rest).await;
                }
            }
        }

        let outcome = task.await.unwrap();
        if relay_error {
            match &outcome {
                Outcome::Relayed { summary, .. } => {
                    assert!(matches!(summary.upstream.end, RelayEnd::Error(_)));
                }
                other => panic!("expected relay, got {other:?}"),
            }
        }
        (inbound_drops.load(Ordering::SeqCst), probe.outbound_drops())
    }

    #[tokio::test]
    async fn test_every_outcome_closes_each_stream_once() {
        // Rejected by policy: inbound closed, nothing dialed.
        assert_eq!(drops_after(DialBehavior::Connect, "[::10:0:0:1]:80", false).await, (1, 0));
        // Dial failure.
        assert_eq!(drops_after(DialBehavior::Refuse, "[::1:1:1:1]:80", false).await, (1, 0));
        // Clean relay.
        assert_eq!(drops_after(DialBehavior::Connect, "[::1:1:1:1]:80", false).await, (1, 1));
        // Relay I/O error.
        assert_eq!(drops_after(DialBehavior::Connect, "[::1:1:1:1]:80", true).await, (1, 1));
    }
}
