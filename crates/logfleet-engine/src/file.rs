use crate::transport::{HostTransport, QueryJob, QueryOutput, QueryStats, TransportFactory};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use logfleet_core::{minute_key, HostId, HostSpec, LogMessage, TransportError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::debug;

/// Transport that scans a local log file, the "localhost" story of the
/// tool. Expected line format, tab separated:
///
/// `2024-05-01T12:34:56Z<TAB>level=info unit=sshd<TAB>message text`
///
/// The tag field is optional; malformed lines are skipped.
pub struct FileTransport {
    host: HostId,
    path: PathBuf,
}

impl FileTransport {
    pub fn new(host: HostId, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    fn parse_line(&self, line_no: u32, line: &str) -> Option<LogMessage> {
        let mut parts = line.splitn(3, '\t');
        let ts_part = parts.next()?;
        let second = parts.next()?;
        let third = parts.next();

        let time = DateTime::parse_from_rfc3339(ts_part.trim())
            .ok()?
            .with_timezone(&Utc);
        let (tags_part, msg) = match third {
            Some(msg) => (second, msg),
            None => ("", second),
        };

        let mut context = BTreeMap::new();
        for pair in tags_part.split_whitespace() {
            if let Some((key, value)) = pair.split_once('=') {
                context.insert(key.to_string(), value.to_string());
            }
        }

        Some(LogMessage {
            time,
            msg: msg.to_string(),
            context,
            host: self.host.clone(),
            file: self.path.display().to_string(),
            line_no,
            orig_line: line.to_string(),
            decreased_timestamp: false,
        })
    }
}

/// Factory mapping each host spec's `addr` to a log file path.
pub struct FileFleet;

impl TransportFactory for FileFleet {
    fn create(&self, spec: &HostSpec) -> Box<dyn HostTransport> {
        let path = spec.addr.clone().unwrap_or_default();
        Box::new(FileTransport::new(spec.id.clone(), path))
    }
}

impl HostTransport for FileTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let meta = tokio::fs::metadata(&self.path)
                .await
                .map_err(|err| TransportError::Config(format!(
                    "log file {}: {err}",
                    self.path.display()
                )))?;
            if !meta.is_file() {
                return Err(TransportError::Config(format!(
                    "log file {} is not a regular file",
                    self.path.display()
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
            let contents = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|err| TransportError::Io(format!(
                    "reading {}: {err}",
                    self.path.display()
                )))?;

            let mut matches = Vec::new();
            let mut skipped = 0usize;
            for (idx, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let Some(msg) = self.parse_line(idx as u32 + 1, line) else {
                    skipped += 1;
                    continue;
                };
                if msg.time < job.from || msg.time >= job.to {
                    continue;
                }
                if !job.query.is_empty() && !msg.orig_line.contains(&job.query) {
                    continue;
                }
                matches.push(msg);
            }
            if skipped > 0 {
                debug!(
                    event = "file_lines_skipped",
                    host = %self.host,
                    file = %self.path.display(),
                    skipped
                );
            }

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
                (matches.split_off(cut), floor)
            } else {
                (matches, job.from)
            };

            let mut stats = BTreeMap::new();
            for m in &kept {
                *stats.entry(minute_key(m.time)).or_insert(0) += 1;
            }
            if !stats.is_empty() {
                let _ = out.send(QueryOutput::MinuteStats(stats));
            }
            let num_msgs = kept.len() as u64;
            for m in kept {
                let _ = out.send(QueryOutput::Message(m));
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
