use crate::config::EngineConfig;
use crate::transport::{HostTransport, QueryJob, QueryOutput, QueryStats};
use logfleet_core::{HostAgentState, HostId, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) enum AgentCommand {
    RunQuery(QueryJob),
    CancelQuery,
    Close,
}

#[derive(Debug)]
pub(crate) enum AgentEvent {
    StateChanged {
        host: HostId,
        state: HostAgentState,
        ever_connected: bool,
    },
    Output {
        host: HostId,
        generation: u64,
        round: u32,
        output: QueryOutput,
    },
    Finished {
        host: HostId,
        generation: u64,
        round: u32,
        stats: QueryStats,
    },
    /// The round ended without a result for this host: cancelled,
    /// superseded, timed out or failed. Never a user-visible error.
    Aborted {
        host: HostId,
        generation: u64,
        round: u32,
    },
}

/// Cheap handle owned by the registry; commands are fire-and-forget
/// because the agent may already be gone during teardown.
#[derive(Debug)]
pub(crate) struct HostAgentHandle {
    pub host: HostId,
    cmd_tx: mpsc::UnboundedSender<AgentCommand>,
}

impl HostAgentHandle {
    pub fn run_query(&self, job: QueryJob) {
        let _ = self.cmd_tx.send(AgentCommand::RunQuery(job));
    }

    pub fn cancel_query(&self) {
        let _ = self.cmd_tx.send(AgentCommand::CancelQuery);
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(AgentCommand::Close);
    }

    #[cfg(test)]
    pub fn for_test(host: HostId) -> (Self, mpsc::UnboundedReceiver<AgentCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (Self { host, cmd_tx }, cmd_rx)
    }
}

/// Spawn the per-host worker task owning this host's connection.
pub(crate) fn spawn_host_agent(
    host: HostId,
    transport: Box<dyn HostTransport>,
    config: EngineConfig,
    current_generation: Arc<AtomicU64>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
) -> HostAgentHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let worker = AgentWorker {
        host: host.clone(),
        transport,
        config,
        current_generation,
        cmd_rx,
        event_tx,
        state: HostAgentState::Unused,
        ever_connected: false,
        failures: 0,
    };
    tokio::spawn(worker.run());
    HostAgentHandle { host, cmd_tx }
}

enum Step {
    Continue,
    Exit,
}

enum ConnectOutcome {
    Done(Result<(), TransportError>),
    Closed,
}

enum QueryOutcome {
    Finished(QueryStats),
    Failed(TransportError),
    TimedOut,
    Cancelled,
    Superseded(QueryJob),
    Closed,
}

struct AgentWorker {
    host: HostId,
    transport: Box<dyn HostTransport>,
    config: EngineConfig,
    current_generation: Arc<AtomicU64>,
    cmd_rx: mpsc::UnboundedReceiver<AgentCommand>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    state: HostAgentState,
    ever_connected: bool,
    failures: u32,
}

impl AgentWorker {
    async fn run(mut self) {
        self.set_state(HostAgentState::Connecting);
        loop {
            let step = match self.state {
                HostAgentState::Connecting => self.connect_phase().await,
                HostAgentState::ConnectedIdle => self.idle_phase().await,
                HostAgentState::Disconnected => self.backoff_phase().await,
                HostAgentState::Errored => self.parked_phase().await,
                HostAgentState::Unused | HostAgentState::ConnectedBusy => Step::Exit,
            };
            if matches!(step, Step::Exit) {
                break;
            }
        }
        self.transport.close().await;
        self.set_state(HostAgentState::Unused);
        debug!(event = "agent_stopped", host = %self.host);
    }

    fn set_state(&mut self, state: HostAgentState) {
        if self.state == state {
            return;
        }
        debug!(event = "agent_state", host = %self.host, from = %self.state, to = %state);
        self.state = state;
        let _ = self.event_tx.send(AgentEvent::StateChanged {
            host: self.host.clone(),
            state,
            ever_connected: self.ever_connected,
        });
    }

    fn send_aborted(&self, job: &QueryJob) {
        let _ = self.event_tx.send(AgentEvent::Aborted {
            host: self.host.clone(),
            generation: job.generation,
            round: job.round,
        });
    }

    async fn connect_phase(&mut self) -> Step {
        let connect_timeout = self.config.connect_timeout;
        let event_tx = self.event_tx.clone();
        let host = self.host.clone();

        let outcome = {
            let attempt = tokio::time::timeout(connect_timeout, self.transport.connect());
            tokio::pin!(attempt);
            loop {
                tokio::select! {
                    res = &mut attempt => {
                        break ConnectOutcome::Done(res.unwrap_or(Err(TransportError::Timeout {
                            seconds: connect_timeout.as_secs(),
                        })));
                    }
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(AgentCommand::RunQuery(job)) => {
                            // Not connected yet; the round goes on without us.
                            let _ = event_tx.send(AgentEvent::Aborted {
                                host: host.clone(),
                                generation: job.generation,
                                round: job.round,
                            });
                        }
                        Some(AgentCommand::CancelQuery) => {}
                        Some(AgentCommand::Close) | None => break ConnectOutcome::Closed,
                    }
                }
            }
        };

        match outcome {
            ConnectOutcome::Closed => Step::Exit,
            ConnectOutcome::Done(Ok(())) => {
                info!(event = "host_connected", host = %self.host);
                self.failures = 0;
                self.ever_connected = true;
                self.set_state(HostAgentState::ConnectedIdle);
                Step::Continue
            }
            ConnectOutcome::Done(Err(err)) => {
                self.record_failure(err);
                Step::Continue
            }
        }
    }

    fn record_failure(&mut self, err: TransportError) {
        if err.is_fatal() {
            warn!(event = "host_errored", host = %self.host, error = %err);
            self.set_state(HostAgentState::Errored);
            return;
        }
        self.failures += 1;
        debug!(
            event = "host_transient_failure",
            host = %self.host,
            error = %err,
            failures = self.failures
        );
        if self.failures > self.config.retry_budget {
            warn!(
                event = "host_retry_budget_exhausted",
                host = %self.host,
                failures = self.failures
            );
            self.set_state(HostAgentState::Errored);
        } else {
            self.set_state(HostAgentState::Disconnected);
        }
    }

    async fn idle_phase(&mut self) -> Step {
        match self.cmd_rx.recv().await {
            Some(AgentCommand::RunQuery(job)) => self.query_phase(job).await,
            Some(AgentCommand::CancelQuery) => Step::Continue,
            Some(AgentCommand::Close) | None => Step::Exit,
        }
    }

    async fn query_phase(&mut self, mut job: QueryJob) -> Step {
        loop {
            self.set_state(HostAgentState::ConnectedBusy);
            let outcome = self.run_one_query(&job).await;
            match outcome {
                QueryOutcome::Finished(stats) => {
                    self.failures = 0;
                    if self.generation_current(job.generation) {
                        let _ = self.event_tx.send(AgentEvent::Finished {
                            host: self.host.clone(),
                            generation: job.generation,
                            round: job.round,
                            stats,
                        });
                    }
                    self.set_state(HostAgentState::ConnectedIdle);
                    return Step::Continue;
                }
                QueryOutcome::Failed(err) => {
                    self.send_aborted(&job);
                    self.record_failure(err);
                    return Step::Continue;
                }
                QueryOutcome::TimedOut => {
                    // Excluded from this round only; no retry inside it.
                    debug!(event = "query_round_timeout", host = %self.host);
                    self.send_aborted(&job);
                    self.set_state(HostAgentState::ConnectedIdle);
                    return Step::Continue;
                }
                QueryOutcome::Cancelled => {
                    self.send_aborted(&job);
                    self.set_state(HostAgentState::ConnectedIdle);
                    return Step::Continue;
                }
                QueryOutcome::Superseded(next) => {
                    // Latest request wins; stale work is never queued.
                    self.send_aborted(&job);
                    job = next;
                }
                QueryOutcome::Closed => {
                    self.send_aborted(&job);
                    return Step::Exit;
                }
            }
        }
    }

    async fn run_one_query(&mut self, job: &QueryJob) -> QueryOutcome {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let event_tx = self.event_tx.clone();
        let host = self.host.clone();
        let current_generation = self.current_generation.clone();
        let generation = job.generation;
        let round = job.round;

        let forward = move |output: QueryOutput| {
            // Superseded output is dropped at the source; the engine
            // re-checks on receipt.
            if current_generation.load(Ordering::SeqCst) == generation {
                let _ = event_tx.send(AgentEvent::Output {
                    host: host.clone(),
                    generation,
                    round,
                    output,
                });
            }
        };

        let outcome = {
            let fut = self.transport.run_query(job.clone(), out_tx);
            tokio::pin!(fut);
            let deadline = tokio::time::sleep(self.config.round_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    res = &mut fut => {
                        while let Ok(output) = out_rx.try_recv() {
                            forward(output);
                        }
                        break match res {
                            Ok(stats) => QueryOutcome::Finished(stats),
                            Err(err) => QueryOutcome::Failed(err),
                        };
                    }
                    Some(output) = out_rx.recv() => forward(output),
                    _ = &mut deadline => break QueryOutcome::TimedOut,
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(AgentCommand::RunQuery(next)) => break QueryOutcome::Superseded(next),
                        Some(AgentCommand::CancelQuery) => break QueryOutcome::Cancelled,
                        Some(AgentCommand::Close) | None => break QueryOutcome::Closed,
                    }
                }
            }
        };
        outcome
    }

    async fn backoff_phase(&mut self) -> Step {
        let delay = self.config.backoff_delay(self.failures.saturating_sub(1));
        let event_tx = self.event_tx.clone();
        let host = self.host.clone();

        let outcome = {
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break Step::Continue,
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(AgentCommand::RunQuery(job)) => {
                            let _ = event_tx.send(AgentEvent::Aborted {
                                host: host.clone(),
                                generation: job.generation,
                                round: job.round,
                            });
                        }
                        Some(AgentCommand::CancelQuery) => {}
                        Some(AgentCommand::Close) | None => break Step::Exit,
                    }
                }
            }
        };

        if matches!(outcome, Step::Continue) {
            self.set_state(HostAgentState::Connecting);
        }
        outcome
    }

    /// An errored host stays visible in the fleet state but ignores query
    /// rounds until its agent is recreated by a filter change.
    async fn parked_phase(&mut self) -> Step {
        loop {
            match self.cmd_rx.recv().await {
                Some(AgentCommand::RunQuery(job)) => self.send_aborted(&job),
                Some(AgentCommand::CancelQuery) => {}
                Some(AgentCommand::Close) | None => return Step::Exit,
            }
        }
    }

    fn generation_current(&self, generation: u64) -> bool {
        self.current_generation.load(Ordering::SeqCst) == generation
    }
}
