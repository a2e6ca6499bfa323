use crate::transport::{HostTransport, QueryJob, QueryOutput, QueryStats, TransportFactory};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use logfleet_core::{minute_key, HostId, HostSpec, LogMessage, TransportError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted behavior of one in-memory host: a fixed message set plus
/// failure injection. Backs the tests and the demo binary.
#[derive(Debug, Default)]
pub struct ScriptedHost {
    /// Messages in the order the host's log contains them. Usually
    /// ascending by time; deliberate regressions exercise skew handling.
    pub lines: Vec<LogMessage>,
    /// Number of leading connect attempts that fail transiently.
    pub fail_connects: AtomicU32,
    /// When set, every connect attempt fails with an auth error.
    pub fatal_connect: AtomicBool,
    /// When set, the next operation fails with an auth error. Lets a test
    /// poison a healthy host mid-session.
    pub poisoned: AtomicBool,
    /// Artificial latency before a query round streams its output.
    pub query_delay: Duration,
}

impl ScriptedHost {
    pub fn with_lines(lines: Vec<LogMessage>) -> Self {
        Self {
            lines,
            ..Self::default()
        }
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }
}

/// Convenience constructor for scripted log lines.
pub fn scripted_message(host: &str, time: DateTime<Utc>, msg: &str) -> LogMessage {
    LogMessage {
        time,
        msg: msg.to_string(),
        context: BTreeMap::new(),
        host: HostId::new(host),
        file: "scripted.log".to_string(),
        line_no: 0,
        orig_line: msg.to_string(),
        decreased_timestamp: false,
    }
}

/// Transport factory serving `ScriptedTransport`s from a fixed script map.
#[derive(Default)]
pub struct ScriptedFleet {
    scripts: HashMap<HostId, Arc<ScriptedHost>>,
}

impl ScriptedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, id: impl Into<String>, script: ScriptedHost) -> Arc<ScriptedHost> {
        let script = Arc::new(script);
        self.scripts.insert(HostId::new(id), script.clone());
        script
    }
}

impl TransportFactory for ScriptedFleet {
    fn create(&self, spec: &HostSpec) -> Box<dyn HostTransport> {
        let script = self
            .scripts
            .get(&spec.id)
            .cloned()
            .unwrap_or_else(|| Arc::new(ScriptedHost::default()));
        Box::new(ScriptedTransport {
            host: spec.id.clone(),
            script,
        })
    }
}

pub struct ScriptedTransport {
    host: HostId,
    script: Arc<ScriptedHost>,
}

impl ScriptedTransport {
    pub fn new(host: HostId, script: Arc<ScriptedHost>) -> Self {
        Self { host, script }
    }

    fn check_poisoned(&self) -> Result<(), TransportError> {
        if self.script.poisoned.load(Ordering::SeqCst) {
            return Err(TransportError::Auth(format!(
                "host {} rejected credentials",
                self.host
            )));
        }
        Ok(())
    }
}

impl HostTransport for ScriptedTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            self.check_poisoned()?;
            if self.script.fatal_connect.load(Ordering::SeqCst) {
                return Err(TransportError::Auth(format!(
                    "host {} rejected credentials",
                    self.host
                )));
            }
            let remaining = self.script.fail_connects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.script
                    .fail_connects
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::ConnectionLost(format!(
                    "host {} unreachable",
                    self.host
                )));
            }
            Ok(())
        }
        .boxed()
    }

    fn run_query(
        &mut self,
        job: QueryJob,
        out: mpsc::UnboundedSender<QueryOutput>,
    ) -> BoxFuture<'_, Result<QueryStats, TransportError>> {
        async move {
            if !self.script.query_delay.is_zero() {
                tokio::time::sleep(self.script.query_delay).await;
            }
            self.check_poisoned()?;

            // Backward scan with a line cap: keep the newest max_lines
            // matches; everything older stays unscanned this round.
            let matches: Vec<&LogMessage> = self
                .script
                .lines
                .iter()
                .filter(|m| m.time >= job.from && m.time < job.to)
                .filter(|m| job.query.is_empty() || m.orig_line.contains(&job.query))
                .collect();
            let (kept, scan_floor) = if matches.len() > job.max_lines {
                let mut cut = matches.len() - job.max_lines;
                let floor = matches[cut..]
                    .iter()
                    .map(|m| m.time)
                    .min()
                    .unwrap_or(job.from);
                // The next round's range ends just below the floor, so
                // anything at or above it must be kept in this one.
                while cut > 0 && matches[cut - 1].time >= floor {
                    cut -= 1;
                }
                (&matches[cut..], floor)
            } else {
                (&matches[..], job.from)
            };

            let mut stats = BTreeMap::new();
            for m in kept {
                *stats.entry(minute_key(m.time)).or_insert(0) += 1;
            }
            if !stats.is_empty() {
                let _ = out.send(QueryOutput::MinuteStats(stats));
            }
            let num_msgs = kept.len() as u64;
            for m in kept {
                let mut msg = (*m).clone();
                msg.host = self.host.clone();
                let _ = out.send(QueryOutput::Message(msg));
            }

            Ok(QueryStats {
                num_msgs,
                scan_floor,
            })
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}
