use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a host in the configured fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One configured fleet member. `addr` is interpreted by the transport:
/// a remote endpoint, a local file path, or unused for scripted hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: HostId,
    #[serde(default)]
    pub addr: Option<String>,
}

impl HostSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: HostId::new(id),
            addr: None,
        }
    }

    pub fn with_addr(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: HostId::new(id),
            addr: Some(addr.into()),
        }
    }
}

/// Lifecycle state of one host agent connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum HostAgentState {
    Unused,
    Connecting,
    ConnectedIdle,
    ConnectedBusy,
    Disconnected,
    Errored,
}

impl HostAgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostAgentState::Unused => "unused",
            HostAgentState::Connecting => "connecting",
            HostAgentState::ConnectedIdle => "connected-idle",
            HostAgentState::ConnectedBusy => "connected-busy",
            HostAgentState::Disconnected => "disconnected",
            HostAgentState::Errored => "errored",
        }
    }

    /// Whether this agent can accept a query right now.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            HostAgentState::ConnectedIdle | HostAgentState::ConnectedBusy
        )
    }
}

impl fmt::Display for HostAgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostAgentState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "unused" => Ok(HostAgentState::Unused),
            "connecting" => Ok(HostAgentState::Connecting),
            "connected-idle" | "idle" => Ok(HostAgentState::ConnectedIdle),
            "connected-busy" | "busy" => Ok(HostAgentState::ConnectedBusy),
            "disconnected" => Ok(HostAgentState::Disconnected),
            "errored" => Ok(HostAgentState::Errored),
            other => Err(format!("unknown host agent state: {other}")),
        }
    }
}

/// A single matched log line. Immutable once produced by a transport;
/// the merger sets `decreased_timestamp` on its output copies only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub time: DateTime<Utc>,
    pub msg: String,
    /// Parsed key/value tags (level, unit, etc).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub host: HostId,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line_no: u32,
    /// The raw line exactly as it appeared in the source log.
    #[serde(default)]
    pub orig_line: String,
    /// True when the merged view emitted this message after one with a
    /// later timestamp (inter-host clock skew or chunk boundaries).
    #[serde(default)]
    pub decreased_timestamp: bool,
}

/// Epoch seconds truncated to the minute.
pub type MinuteKey = i64;

/// Truncate a timestamp to its minute bucket key.
pub fn minute_key(time: DateTime<Utc>) -> MinuteKey {
    let secs = time.timestamp();
    secs - secs.rem_euclid(60)
}

/// Aggregate match count for one minute bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteStat {
    pub num_msgs: u64,
}

/// A normalized query: absolute bounds, opaque filter, pagination flag.
/// The caller guarantees both bounds are set and `from <= to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub load_earlier: bool,
}

/// Merged query result, published as a complete replacement each time.
/// `logs` is bounded by the display window; `num_msgs_total` counts every
/// match the fleet reported, so it can exceed `logs.len()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub logs: Vec<LogMessage>,
    pub minute_stats: BTreeMap<MinuteKey, MinuteStat>,
    pub num_msgs_total: u64,
    pub loaded_earlier: bool,
}

/// Derived fleet-wide connectivity snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetState {
    pub connected: bool,
    pub busy: bool,
    pub no_matching_hosts: bool,
    pub hosts_by_state: BTreeMap<HostAgentState, Vec<HostId>>,
    /// Hosts matching the current filter.
    pub num_hosts: usize,
    /// Configured hosts excluded by the current filter.
    pub num_unused: usize,
}

impl FleetState {
    pub fn hosts_in(&self, state: HostAgentState) -> usize {
        self.hosts_by_state.get(&state).map_or(0, Vec::len)
    }
}
