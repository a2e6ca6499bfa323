use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use logfleet_core::{HostSpec, LogMessage, MinuteKey, TransportError};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// One query round dispatched to a single host.
///
/// The covered range is half-open `[from, to)`. A transport scans it
/// backward from `to` and stops once `max_lines` matches were collected or
/// `from` was reached, so the scanned subrange is `[scan_floor, to)` with
/// `scan_floor >= from`. The cut lands on a timestamp boundary: matches
/// tied at the floor timestamp are never split across rounds, because a
/// follow-up round ends just below the floor and could not recover them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryJob {
    /// Generation tag; output for a superseded generation is discarded.
    pub generation: u64,
    /// Round index within one browsing session; 0 is the fresh query,
    /// every load-earlier extension increments it.
    pub round: u32,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Opaque filter expression; empty matches everything.
    pub query: String,
    /// Soft cap on streamed matches, exceeded only to keep the tie group
    /// at the floor timestamp whole.
    pub max_lines: usize,
}

/// Streamed item produced by a transport while a query runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutput {
    /// One matched line, produced in the host's own order.
    Message(LogMessage),
    /// Per-minute match counts for (a part of) the scanned subrange.
    MinuteStats(BTreeMap<MinuteKey, u64>),
}

/// Summary a transport reports once a query round completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStats {
    /// Total matches in the scanned subrange `[scan_floor, to)`; every
    /// one of them was streamed.
    pub num_msgs: u64,
    /// Oldest point actually scanned; equals `job.from` unless the line
    /// cap stopped the scan early.
    pub scan_floor: DateTime<Utc>,
}

/// Connection to one host, able to run a single query at a time.
///
/// Cancellation is cooperative: the agent drops the `run_query` future and
/// relies on the generation check to discard anything the remote side still
/// manages to deliver.
pub trait HostTransport: Send {
    /// Establish the connection. Called again after transient failures;
    /// implementations must tolerate repeat calls.
    fn connect(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Execute one query, streaming output into `out`. Resolves with the
    /// round summary once the scan is complete.
    fn run_query(
        &mut self,
        job: QueryJob,
        out: mpsc::UnboundedSender<QueryOutput>,
    ) -> BoxFuture<'_, Result<QueryStats, TransportError>>;

    /// Release resources. Called exactly once on every agent exit path.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Creates a transport for each host entering the active filter.
pub trait TransportFactory: Send + Sync {
    fn create(&self, spec: &HostSpec) -> Box<dyn HostTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&HostSpec) -> Box<dyn HostTransport> + Send + Sync,
{
    fn create(&self, spec: &HostSpec) -> Box<dyn HostTransport> {
        self(spec)
    }
}
