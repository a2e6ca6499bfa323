use crate::config::EngineConfig;
use crate::fleet_state::{aggregate, StateAggregator};
use crate::host_agent::{spawn_host_agent, AgentEvent};
use crate::merger::ResultMerger;
use crate::registry::HostRegistry;
use crate::transport::{QueryJob, QueryOutput, TransportFactory};
use chrono::{DateTime, Utc};
use logfleet_core::{EngineError, FleetState, HostId, HostSpec, QueryRequest, QueryResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug)]
enum EngineCommand {
    SetHostsFilter(String),
    Query(QueryRequest),
    Shutdown,
}

/// One browsing session: the fresh query that started it plus the scan
/// floors used to extend it backward.
#[derive(Debug, Clone)]
struct QuerySession {
    generation: u64,
    from: DateTime<Utc>,
    query: String,
    /// Oldest point each host has scanned so far; load-earlier asks for
    /// the window ending there.
    floors: HashMap<HostId, DateTime<Utc>>,
}

/// Caller-facing handle. All mutation goes through the engine task;
/// published values arrive as immutable snapshots on watch channels.
#[derive(Clone)]
pub struct FleetHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    state_rx: watch::Receiver<FleetState>,
    resp_rx: watch::Receiver<Option<QueryResponse>>,
}

impl FleetHandle {
    /// Change which configured hosts are active. This is the only way
    /// agents are created or destroyed.
    pub fn set_hosts_filter(&self, pattern: impl Into<String>) -> Result<(), EngineError> {
        self.cmd_tx
            .send(EngineCommand::SetHostsFilter(pattern.into()))
            .map_err(|_| EngineError::ShutDown)
    }

    /// Submit a query. Progressive results appear on `responses()`; a
    /// newer submission always supersedes an in-flight one.
    pub fn query(&self, req: QueryRequest) -> Result<(), EngineError> {
        if req.from > req.to {
            return Err(EngineError::InvalidRange {
                from: req.from.to_rfc3339(),
                to: req.to.to_rfc3339(),
            });
        }
        self.cmd_tx
            .send(EngineCommand::Query(req))
            .map_err(|_| EngineError::ShutDown)
    }

    pub fn state(&self) -> watch::Receiver<FleetState> {
        self.state_rx.clone()
    }

    pub fn responses(&self) -> watch::Receiver<Option<QueryResponse>> {
        self.resp_rx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
    }
}

/// The multi-host query orchestration engine.
pub struct FleetEngine;

impl FleetEngine {
    /// Start the engine task for a configured fleet. All hosts are active
    /// initially (empty filter); use the handle to narrow the set.
    pub fn spawn(
        fleet: Vec<HostSpec>,
        factory: Arc<dyn TransportFactory>,
        config: EngineConfig,
    ) -> FleetHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (aggregator, state_rx) = StateAggregator::new();
        let (resp_tx, resp_rx) = watch::channel(None);

        let task = EngineTask {
            config,
            factory,
            registry: HostRegistry::new(fleet),
            merger: ResultMerger::new(config.window_cap),
            aggregator,
            resp_tx,
            cmd_rx,
            event_rx,
            event_tx,
            generation: Arc::new(AtomicU64::new(0)),
            session: None,
            pending_query: None,
        };
        tokio::spawn(task.run());

        FleetHandle {
            cmd_tx,
            state_rx,
            resp_rx,
        }
    }
}

struct EngineTask {
    config: EngineConfig,
    factory: Arc<dyn TransportFactory>,
    registry: HostRegistry,
    merger: ResultMerger,
    aggregator: StateAggregator,
    resp_tx: watch::Sender<Option<QueryResponse>>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    event_rx: mpsc::UnboundedReceiver<AgentEvent>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    /// Current generation; superseded output is dropped against it both
    /// at the agents and again here.
    generation: Arc<AtomicU64>,
    session: Option<QuerySession>,
    /// Query remembered while no host is connected yet, fired on the
    /// first connectivity transition.
    pending_query: Option<QueryRequest>,
}

impl EngineTask {
    async fn run(mut self) {
        self.apply_filter("");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(EngineCommand::SetHostsFilter(pattern)) => self.apply_filter(&pattern),
                    Some(EngineCommand::Query(req)) => self.handle_query(req),
                    Some(EngineCommand::Shutdown) | None => break,
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }
        info!(event = "engine_stopping");
        self.registry.close_all();
    }

    fn apply_filter(&mut self, pattern: &str) {
        let factory = self.factory.clone();
        let config = self.config;
        let generation = self.generation.clone();
        let event_tx = self.event_tx.clone();
        let result = self.registry.set_filter(pattern, |spec| {
            spawn_host_agent(
                spec.id.clone(),
                factory.create(spec),
                config,
                generation.clone(),
                event_tx.clone(),
            )
        });
        match result {
            Ok(()) => {
                info!(
                    event = "hosts_filter_applied",
                    pattern,
                    num_hosts = self.registry.num_active()
                );
                self.publish_state();
            }
            Err(err) => {
                warn!(event = "hosts_filter_invalid", pattern, error = %err);
            }
        }
    }

    fn handle_query(&mut self, req: QueryRequest) {
        if req.load_earlier && self.session.is_some() {
            self.extend_session();
        } else {
            self.start_session(req);
        }
    }

    fn start_session(&mut self, req: QueryRequest) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            event = "query_submitted",
            generation,
            from = %req.from,
            to = %req.to,
            query = %req.query
        );
        self.merger.reset();
        let round = self.merger.begin_round();
        self.resp_tx.send_replace(None);
        self.session = Some(QuerySession {
            generation,
            from: req.from,
            query: req.query.clone(),
            floors: HashMap::new(),
        });

        let mut dispatched = 0usize;
        for (_, handle) in self.registry.connected() {
            handle.run_query(QueryJob {
                generation,
                round,
                from: req.from,
                to: req.to,
                query: req.query.clone(),
                max_lines: self.config.max_lines_per_host,
            });
            dispatched += 1;
        }
        if dispatched == 0 {
            // Nobody reachable yet; fire once the fleet connects.
            debug!(event = "query_deferred", generation);
            self.pending_query = Some(req);
        }
    }

    fn extend_session(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let round = self.merger.begin_round();
        let max_lines = self.config.max_lines_per_host;

        let mut dispatched = 0usize;
        for (host, handle) in self.registry.connected() {
            // A host without session state has nothing recorded to page
            // back from; it joins again on the next fresh query.
            let Some(floor) = session.floors.get(host) else {
                continue;
            };
            if *floor <= session.from {
                continue;
            }
            handle.run_query(QueryJob {
                generation: session.generation,
                round,
                from: session.from,
                to: *floor,
                query: session.query.clone(),
                max_lines,
            });
            dispatched += 1;
        }
        info!(
            event = "load_earlier",
            generation = session.generation,
            round,
            dispatched
        );
        if dispatched == 0 {
            // Nothing older anywhere; answer right away.
            self.publish_response();
        }
    }

    fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::StateChanged {
                host,
                state,
                ever_connected,
            } => {
                if !self.registry.record_state(&host, state, ever_connected) {
                    return;
                }
                self.publish_state();
                if state.is_connected() {
                    if let Some(req) = self.pending_query.take() {
                        debug!(event = "deferred_query_fired", host = %host);
                        self.start_session(req);
                    }
                }
            }
            AgentEvent::Output {
                host,
                generation,
                round,
                output,
            } => {
                if !self.event_relevant(&host, generation) {
                    return;
                }
                match output {
                    QueryOutput::Message(msg) => self.merger.push_message(round, msg),
                    QueryOutput::MinuteStats(stats) => self.merger.add_minute_stats(&host, stats),
                }
            }
            AgentEvent::Finished {
                host,
                generation,
                round: _,
                stats,
            } => {
                if !self.event_relevant(&host, generation) {
                    return;
                }
                self.merger.finish_host_round(&host, &stats);
                if let Some(session) = self.session.as_mut() {
                    session.floors.insert(host.clone(), stats.scan_floor);
                }
                debug!(
                    event = "host_round_finished",
                    host = %host,
                    generation,
                    num_msgs = stats.num_msgs
                );
                self.publish_response();
            }
            AgentEvent::Aborted {
                host, generation, ..
            } => {
                if !self.event_relevant(&host, generation) {
                    return;
                }
                // The round stays best-effort; missing hosts show up only
                // through the fleet state.
                debug!(event = "host_round_aborted", host = %host, generation);
                self.publish_response();
            }
        }
    }

    /// Output is merged only when it belongs to the live generation and
    /// its host is still in the active set.
    fn event_relevant(&self, host: &HostId, generation: u64) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        session.generation == generation
            && self.generation.load(Ordering::SeqCst) == generation
            && self.registry.is_active(host)
    }

    fn publish_response(&self) {
        self.resp_tx.send_replace(Some(self.merger.response()));
    }

    fn publish_state(&self) {
        let snapshot = aggregate(self.registry.num_configured(), self.registry.statuses());
        self.aggregator.publish(snapshot);
    }
}
