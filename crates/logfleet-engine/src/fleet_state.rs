use logfleet_core::{FleetState, HostAgentState, HostId};
use tokio::sync::watch;
use tracing::debug;

/// Reduce the per-host states into one fleet snapshot.
///
/// `connected` latches per host: once a host completed its first
/// handshake it counts as connected even while mid-reconnect, so only
/// total unreachability keeps the flag false.
pub fn aggregate<'a>(
    num_configured: usize,
    statuses: impl Iterator<Item = (&'a HostId, HostAgentState, bool)>,
) -> FleetState {
    let mut snapshot = FleetState::default();
    for (host, state, ever_connected) in statuses {
        snapshot.num_hosts += 1;
        snapshot
            .hosts_by_state
            .entry(state)
            .or_default()
            .push(host.clone());
        if ever_connected {
            snapshot.connected = true;
        }
        if state == HostAgentState::ConnectedBusy {
            snapshot.busy = true;
        }
    }
    snapshot.no_matching_hosts = snapshot.num_hosts == 0;
    snapshot.num_unused = num_configured.saturating_sub(snapshot.num_hosts);
    snapshot
}

/// Publishes fleet snapshots over a watch channel, deduplicating
/// unchanged recomputations. Subscribers always see a complete snapshot.
pub(crate) struct StateAggregator {
    tx: watch::Sender<FleetState>,
}

impl StateAggregator {
    pub fn new() -> (Self, watch::Receiver<FleetState>) {
        let (tx, rx) = watch::channel(FleetState::default());
        (Self { tx }, rx)
    }

    pub fn publish(&self, snapshot: FleetState) {
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            debug!(
                event = "fleet_state",
                connected = snapshot.connected,
                busy = snapshot.busy,
                num_hosts = snapshot.num_hosts,
                num_unused = snapshot.num_unused
            );
            *current = snapshot;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(
        entries: &[(&str, HostAgentState, bool)],
    ) -> Vec<(HostId, HostAgentState, bool)> {
        entries
            .iter()
            .map(|(id, state, ever)| (HostId::new(*id), *state, *ever))
            .collect()
    }

    fn aggregate_of(num_configured: usize, entries: &[(&str, HostAgentState, bool)]) -> FleetState {
        let owned = statuses(entries);
        aggregate(num_configured, owned.iter().map(|(id, s, e)| (id, *s, *e)))
    }

    #[test]
    fn empty_active_set_reports_no_matching_hosts() {
        let snapshot = aggregate_of(3, &[]);
        assert!(snapshot.no_matching_hosts);
        assert!(!snapshot.connected);
        assert_eq!(snapshot.num_hosts, 0);
        assert_eq!(snapshot.num_unused, 3);
    }

    #[test]
    fn counts_hosts_per_state() {
        let snapshot = aggregate_of(
            4,
            &[
                ("a", HostAgentState::ConnectedIdle, true),
                ("b", HostAgentState::ConnectedBusy, true),
                ("c", HostAgentState::Errored, false),
            ],
        );
        assert_eq!(snapshot.num_hosts, 3);
        assert_eq!(snapshot.num_unused, 1);
        assert_eq!(snapshot.hosts_in(HostAgentState::ConnectedIdle), 1);
        assert_eq!(snapshot.hosts_in(HostAgentState::ConnectedBusy), 1);
        assert_eq!(snapshot.hosts_in(HostAgentState::Errored), 1);
        assert!(snapshot.connected);
        assert!(snapshot.busy);
        assert!(!snapshot.no_matching_hosts);
    }

    #[test]
    fn connectivity_latches_through_reconnects() {
        let snapshot = aggregate_of(1, &[("a", HostAgentState::Disconnected, true)]);
        assert!(snapshot.connected);

        let snapshot = aggregate_of(1, &[("a", HostAgentState::Connecting, false)]);
        assert!(!snapshot.connected);
    }

    #[test]
    fn publish_deduplicates_unchanged_snapshots() {
        let (aggregator, rx) = StateAggregator::new();
        let snapshot = aggregate_of(1, &[("a", HostAgentState::ConnectedIdle, true)]);
        aggregator.publish(snapshot.clone());
        assert!(rx.has_changed().unwrap());

        let mut rx = rx;
        rx.borrow_and_update();
        aggregator.publish(snapshot);
        assert!(!rx.has_changed().unwrap());
    }
}
