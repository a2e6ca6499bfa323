use crate::host_agent::HostAgentHandle;
use globset::{Glob, GlobSet, GlobSetBuilder};
use logfleet_core::{HostAgentState, HostId, HostSpec};
use std::collections::BTreeMap;
use tracing::info;

/// Hosts filter: comma-separated glob patterns matched against host ids.
/// An empty pattern matches every configured host.
#[derive(Debug)]
pub struct HostsFilter {
    pattern: String,
    glob: Option<GlobSet>,
}

impl HostsFilter {
    pub fn new(pattern: &str) -> Result<Self, globset::Error> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Ok(Self {
                pattern: String::new(),
                glob: None,
            });
        }
        let mut builder = GlobSetBuilder::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            builder.add(Glob::new(part)?);
        }
        Ok(Self {
            pattern: trimmed.to_string(),
            glob: Some(builder.build()?),
        })
    }

    pub fn match_all() -> Self {
        Self {
            pattern: String::new(),
            glob: None,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, id: &HostId) -> bool {
        match &self.glob {
            None => true,
            Some(set) => set.is_match(id.as_str()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct AgentEntry {
    pub handle: HostAgentHandle,
    pub state: HostAgentState,
    pub ever_connected: bool,
}

/// Owns the configured fleet and the active subset selected by the
/// current filter. Agents exist exactly for the active subset; changing
/// the filter is the only way they are created or destroyed.
pub(crate) struct HostRegistry {
    fleet: Vec<HostSpec>,
    filter: HostsFilter,
    agents: BTreeMap<HostId, AgentEntry>,
}

impl HostRegistry {
    pub fn new(fleet: Vec<HostSpec>) -> Self {
        Self {
            fleet,
            filter: HostsFilter::match_all(),
            agents: BTreeMap::new(),
        }
    }

    pub fn num_configured(&self) -> usize {
        self.fleet.len()
    }

    pub fn num_active(&self) -> usize {
        self.agents.len()
    }

    pub fn is_active(&self, host: &HostId) -> bool {
        self.agents.contains_key(host)
    }

    /// Recompute the active set for a new pattern. Agents for hosts
    /// leaving the filter are told to cancel + close before being
    /// forgotten; hosts entering it get a fresh agent from `spawn`.
    pub fn set_filter(
        &mut self,
        pattern: &str,
        mut spawn: impl FnMut(&HostSpec) -> HostAgentHandle,
    ) -> Result<(), globset::Error> {
        let filter = HostsFilter::new(pattern)?;

        let removed: Vec<HostId> = self
            .agents
            .keys()
            .filter(|id| !filter.matches(id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(entry) = self.agents.remove(&id) {
                info!(event = "host_left_filter", host = %id);
                entry.handle.cancel_query();
                entry.handle.close();
            }
        }

        for spec in &self.fleet {
            if filter.matches(&spec.id) && !self.agents.contains_key(&spec.id) {
                info!(event = "host_entered_filter", host = %spec.id);
                let handle = spawn(spec);
                self.agents.insert(
                    spec.id.clone(),
                    AgentEntry {
                        handle,
                        state: HostAgentState::Connecting,
                        ever_connected: false,
                    },
                );
            }
        }

        self.filter = filter;
        Ok(())
    }

    /// Record an agent transition. Returns false for hosts that already
    /// left the active set; their late events must be ignored.
    pub fn record_state(&mut self, host: &HostId, state: HostAgentState, ever_connected: bool) -> bool {
        match self.agents.get_mut(host) {
            Some(entry) => {
                entry.state = state;
                entry.ever_connected = ever_connected;
                true
            }
            None => false,
        }
    }

    pub fn statuses(&self) -> impl Iterator<Item = (&HostId, HostAgentState, bool)> {
        self.agents
            .iter()
            .map(|(id, entry)| (id, entry.state, entry.ever_connected))
    }

    /// Agents able to take part in a query round right now.
    pub fn connected(&self) -> impl Iterator<Item = (&HostId, &HostAgentHandle)> {
        self.agents
            .iter()
            .filter(|(_, entry)| entry.state.is_connected())
            .map(|(id, entry)| (id, &entry.handle))
    }

    pub fn close_all(&mut self) {
        for (id, entry) in &self.agents {
            info!(event = "host_closing", host = %id);
            entry.handle.cancel_query();
            entry.handle.close();
        }
        self.agents.clear();
    }
}
