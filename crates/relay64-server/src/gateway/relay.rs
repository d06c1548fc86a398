//! Bidirectional byte relay between an inbound and an outbound stream.
//!
//! Each direction runs as its own task inside a per-connection
//! [`JoinSet`], so dropping the relay future (runtime shutdown, a panicking
//! parent) aborts both directions and releases their halves. A direction
//! ends on EOF, on an I/O error, or on an optional idle timeout; it then
//! half-closes its destination. The surviving direction keeps copying for at
//! most the drain window before it is cut off, which guarantees both sockets
//! are released even when only one side ever speaks.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Tunables for one relay.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Read buffer size per direction.
    pub buffer_size: usize,
    /// Close a direction that has neither read nor written for this long.
    /// `None` never times out.
    pub idle_timeout: Option<Duration>,
    /// How long the surviving direction may keep copying after the other
    /// direction has ended.
    pub drain_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            idle_timeout: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target.
    Upstream,
    /// Target to client.
    Downstream,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

/// How a direction terminated.
#[derive(Debug)]
pub enum RelayEnd {
    /// The source returned a zero-length read.
    Eof,
    /// Reading the source or writing the destination failed.
    Error(io::Error),
    /// Nothing moved within the idle timeout.
    IdleTimeout,
    /// Cut off at the end of the drain window, or the task died.
    Aborted,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::Eof => f.write_str("eof"),
            RelayEnd::Error(e) => write!(f, "error: {e}"),
            RelayEnd::IdleTimeout => f.write_str("idle timeout"),
            RelayEnd::Aborted => f.write_str("aborted"),
        }
    }
}

/// Outcome of one direction of a relay. Diagnostics only.
#[derive(Debug)]
pub struct DirectionReport {
    pub direction: Direction,
    pub bytes: u64,
    pub end: RelayEnd,
}

/// Both directions of a finished relay.
#[derive(Debug)]
pub struct RelaySummary {
    pub upstream: DirectionReport,
    pub downstream: DirectionReport,
}

impl RelaySummary {
    fn from_reports(reports: Vec<DirectionReport>) -> Self {
        let mut upstream = None;
        let mut downstream = None;
        for report in reports {
            match report.direction {
                Direction::Upstream => upstream = Some(report),
                Direction::Downstream => downstream = Some(report),
            }
        }
        Self {
            upstream: upstream.unwrap_or_else(|| aborted(Direction::Upstream)),
            downstream: downstream.unwrap_or_else(|| aborted(Direction::Downstream)),
        }
    }
}

fn aborted(direction: Direction) -> DirectionReport {
    DirectionReport {
        direction,
        bytes: 0,
        end: RelayEnd::Aborted,
    }
}

/// Copies bytes both ways between two streams until both directions end.
#[derive(Debug, Clone, Default)]
pub struct Relay {
    options: RelayOptions,
}

impl Relay {
    pub fn new(options: RelayOptions) -> Self {
        Self { options }
    }

    /// Relay between `client` and `target`, consuming both. Both streams are
    /// closed by the time this returns.
    ///
    /// `label` identifies the connection in log records.
    pub async fn run<A, B>(&self, client: A, target: B, label: &str) -> RelaySummary
    where
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let label: Arc<str> = Arc::from(label);
        let (client_read, client_write) = tokio::io::split(client);
        let (target_read, target_write) = tokio::io::split(target);

        // Fires once the first direction has ended.
        let (drain_tx, drain_rx) = watch::channel(());

        let mut directions = JoinSet::new();
        directions.spawn(pump(
            client_read,
            target_write,
            Direction::Upstream,
            self.options.clone(),
            drain_rx.clone(),
            label.clone(),
        ));
        directions.spawn(pump(
            target_read,
            client_write,
            Direction::Downstream,
            self.options.clone(),
            drain_rx,
            label.clone(),
        ));

        let mut reports = Vec::with_capacity(2);
        while let Some(joined) = directions.join_next().await {
            let _ = drain_tx.send(());
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => warn!(conn = %label, error = %e, "relay task failed"),
            }
        }

        RelaySummary::from_reports(reports)
    }
}

/// Which deadline cut an operation short.
#[derive(Debug, Clone, Copy)]
enum Limit {
    Idle,
    Drain,
}

impl Limit {
    fn end(self) -> RelayEnd {
        match self {
            Limit::Idle => RelayEnd::IdleTimeout,
            Limit::Drain => RelayEnd::Aborted,
        }
    }
}

/// Deadlines shared by every read and write of one direction.
struct Deadlines {
    idle_timeout: Option<Duration>,
    drain_timeout: Duration,
    drain_at: Option<Instant>,
    drain_rx: watch::Receiver<()>,
}

impl Deadlines {
    /// Run `op` to completion unless a deadline passes first.
    ///
    /// The other direction may end while `op` is pending; the drain window
    /// is armed at that moment and bounds the same `op`.
    async fn guard<F, T>(&mut self, op: F) -> Result<io::Result<T>, RelayEnd>
    where
        F: Future<Output = io::Result<T>>,
    {
        tokio::pin!(op);
        let idle_at = self.idle_timeout.map(|d| Instant::now() + d);

        loop {
            let limit = next_limit(idle_at, self.drain_at);
            tokio::select! {
                biased;
                _ = self.drain_rx.changed(), if self.drain_at.is_none() => {
                    self.drain_at = Some(Instant::now() + self.drain_timeout);
                }
                result = &mut op => return Ok(result),
                kind = expire(limit) => return Err(kind.end()),
            }
        }
    }
}

/// Copy `reader` into `writer` until EOF, error or a deadline, then
/// half-close `writer`.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    options: RelayOptions,
    drain_rx: watch::Receiver<()>,
    label: Arc<str>,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.buffer_size];
    let mut bytes: u64 = 0;
    let mut deadlines = Deadlines {
        idle_timeout: options.idle_timeout,
        drain_timeout: options.drain_timeout,
        drain_at: None,
        drain_rx,
    };

    let end = loop {
        let n = match deadlines.guard(reader.read(&mut buf)).await {
            Ok(Ok(0)) => break RelayEnd::Eof,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break RelayEnd::Error(e),
            Err(end) => break end,
        };

        match deadlines.guard(writer.write_all(&buf[..n])).await {
            Ok(Ok(())) => bytes += n as u64,
            Ok(Err(e)) => break RelayEnd::Error(e),
            Err(end) => break end,
        }
    };

    let _ = writer.shutdown().await;

    match &end {
        RelayEnd::Error(e) => {
            warn!(conn = %label, direction = direction.as_str(), bytes, error = %e, "relay direction failed");
        }
        _ => {
            debug!(conn = %label, direction = direction.as_str(), bytes, end = %end, "relay direction ended");
        }
    }

    DirectionReport {
        direction,
        bytes,
        end,
    }
}

/// The earlier of the idle deadline and the drain deadline.
fn next_limit(idle_at: Option<Instant>, drain_at: Option<Instant>) -> Option<(Instant, Limit)> {
    let idle = idle_at.map(|at| (at, Limit::Idle));
    let drain = drain_at.map(|at| (at, Limit::Drain));
    match (idle, drain) {
        (Some(i), Some(d)) => Some(if d.0 <= i.0 { d } else { i }),
        (i, d) => i.or(d),
    }
}

/// Resolves when `limit` passes; never resolves without one.
async fn expire(limit: Option<(Instant, Limit)>) -> Limit {
    match limit {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}
