//! Connection to one compute engine.
//!
//! [`ConnectionMachine`] decides what to do next from what was last observed
//! (pod status, launch result, connect result). [`ComputeWorker`] runs those
//! decisions as I/O on a spawned task, then owns the framed TCP stream once
//! connected.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rc2_protocol::{ComputeState, WorkspaceId};

use crate::error::ComputeError;
use crate::framing::{ComputeFrame, ComputeFrameCodec};
use crate::orchestration::{Orchestrator, PodPhase, PodStatus};

/// Consecutive failed pods tolerated before a session's compute is unusable.
pub const MAX_POD_FAILURES: u32 = 3;

/// Where a session's compute engine comes from.
#[derive(Clone)]
pub enum ComputeTarget {
    Direct {
        host: String,
        port: u16,
    },
    Orchestrated {
        orchestrator: Arc<dyn Orchestrator>,
        poll_interval: Duration,
    },
}

pub struct WorkerConfig {
    pub target: ComputeTarget,
    pub wspace_id: WorkspaceId,
    pub session_id: i64,
    /// `None` waits forever.
    pub connect_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

/// What the worker reports to its session, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeEvent {
    StateChanged(ComputeState),
    Message(Bytes),
    Error(ComputeError),
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Start,
    PodStatus(Option<PodStatus>),
    LaunchSucceeded,
    LaunchFailed(String),
    OrchestrationFailed(String),
    ConnectSucceeded,
    ConnectFailed(String),
    ConnectionLost(String),
    WriteFailed(String),
}

/// I/O requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    QueryStatus { after: Duration },
    Launch,
    Connect { host: String, port: u16 },
    Report(ComputeError),
}

#[derive(Debug, Clone)]
enum MachineTarget {
    Direct { host: String, port: u16 },
    Orchestrated { poll_interval: Duration, compute_port: u16 },
}

/// Connection establishment as a pure transition function.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ComputeState,
    target: MachineTarget,
    pod_failures: u32,
}

impl ConnectionMachine {
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        Self::new(MachineTarget::Direct {
            host: host.into(),
            port,
        })
    }

    pub fn orchestrated(poll_interval: Duration, compute_port: u16) -> Self {
        Self::new(MachineTarget::Orchestrated {
            poll_interval,
            compute_port,
        })
    }

    fn new(target: MachineTarget) -> Self {
        Self {
            state: ComputeState::Uninitialized,
            target,
            pod_failures: 0,
        }
    }

    pub fn state(&self) -> ComputeState {
        self.state
    }

    pub fn pod_failures(&self) -> u32 {
        self.pod_failures
    }

    /// Apply one observation, returning the new state and the effects to run
    /// in order.
    pub fn step(&mut self, observation: Observation) -> (ComputeState, Vec<Effect>) {
        if self.state.is_terminal() {
            return (self.state, Vec::new());
        }
        let poll = match &self.target {
            MachineTarget::Orchestrated { poll_interval, .. } => *poll_interval,
            MachineTarget::Direct { .. } => Duration::ZERO,
        };

        let (state, effects) = match observation {
            Observation::Start => match &self.target {
                MachineTarget::Direct { host, port } => (
                    ComputeState::Connecting,
                    vec![Effect::Connect {
                        host: host.clone(),
                        port: *port,
                    }],
                ),
                MachineTarget::Orchestrated { .. } => (
                    ComputeState::InitialHostSearch,
                    vec![Effect::QueryStatus {
                        after: Duration::ZERO,
                    }],
                ),
            },
            Observation::PodStatus(None) => {
                if self.state == ComputeState::InitialHostSearch {
                    (ComputeState::Loading, vec![Effect::Launch])
                } else {
                    // a just-launched pod may not be listed yet
                    (ComputeState::Loading, vec![Effect::QueryStatus { after: poll }])
                }
            }
            Observation::PodStatus(Some(status)) => self.on_pod_status(status, poll),
            Observation::LaunchSucceeded => {
                (ComputeState::Loading, vec![Effect::QueryStatus { after: poll }])
            }
            Observation::LaunchFailed(reason)
            | Observation::OrchestrationFailed(reason)
            | Observation::ConnectFailed(reason) => (
                ComputeState::FailedToConnect,
                vec![Effect::Report(ComputeError::FailedToConnect(reason))],
            ),
            Observation::ConnectSucceeded => (ComputeState::Connected, Vec::new()),
            Observation::ConnectionLost(reason) => (
                ComputeState::FailedToConnect,
                vec![Effect::Report(ComputeError::FailedToReadMessage(reason))],
            ),
            Observation::WriteFailed(reason) => (
                ComputeState::FailedToConnect,
                vec![Effect::Report(ComputeError::FailedToWrite(reason))],
            ),
        };
        self.state = state;
        (state, effects)
    }

    fn on_pod_status(&mut self, status: PodStatus, poll: Duration) -> (ComputeState, Vec<Effect>) {
        match status.phase {
            PodPhase::Pending => (ComputeState::Loading, vec![Effect::QueryStatus { after: poll }]),
            PodPhase::Running => match (status.address, &self.target) {
                (Some(host), MachineTarget::Orchestrated { compute_port, .. }) => (
                    ComputeState::Connecting,
                    vec![Effect::Connect {
                        host,
                        port: *compute_port,
                    }],
                ),
                _ => (ComputeState::Loading, vec![Effect::QueryStatus { after: poll }]),
            },
            PodPhase::Succeeded => (
                ComputeState::FailedToConnect,
                vec![Effect::Report(ComputeError::FailedToConnect(
                    "compute pod exited".to_string(),
                ))],
            ),
            PodPhase::Failed => {
                if status.failed_pods <= self.pod_failures {
                    // the relaunched pod is not listed yet
                    return (ComputeState::Loading, vec![Effect::QueryStatus { after: poll }]);
                }
                self.pod_failures = status.failed_pods;
                if self.pod_failures >= MAX_POD_FAILURES {
                    (
                        ComputeState::Unusable,
                        vec![Effect::Report(ComputeError::TooManyCrashes)],
                    )
                } else {
                    (ComputeState::Loading, vec![Effect::Launch])
                }
            }
            PodPhase::Unknown => (
                ComputeState::FailedToConnect,
                vec![Effect::Report(ComputeError::FailedToConnect(
                    "compute pod in unknown state".to_string(),
                ))],
            ),
        }
    }
}

enum Outbound {
    Frame(Bytes),
    Close,
}

/// Handle to a running compute connection task.
pub struct ComputeWorker {
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ComputeState>,
    cancel: CancellationToken,
}

impl ComputeWorker {
    /// Start connecting. Events arrive on the returned receiver until the
    /// worker stops.
    pub fn spawn(config: WorkerConfig) -> (ComputeWorker, mpsc::UnboundedReceiver<ComputeEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ComputeState::Uninitialized);
        let cancel = CancellationToken::new();

        let machine = match &config.target {
            ComputeTarget::Direct { host, port } => ConnectionMachine::direct(host.clone(), *port),
            ComputeTarget::Orchestrated {
                orchestrator,
                poll_interval,
            } => ConnectionMachine::orchestrated(*poll_interval, orchestrator.compute_port()),
        };
        let driver = Driver {
            config,
            machine,
            state_tx,
            events: events_tx,
            outbound: outbound_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run());

        (
            ComputeWorker {
                outbound: outbound_tx,
                state: state_rx,
                cancel,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ComputeState {
        *self.state.borrow()
    }

    /// Queue one payload for the compute engine.
    pub fn send(&self, payload: Bytes) -> Result<(), ComputeError> {
        if self.state() != ComputeState::Connected {
            return Err(ComputeError::NotConnected);
        }
        self.outbound
            .send(Outbound::Frame(payload))
            .map_err(|_| ComputeError::NotConnected)
    }

    /// Resolves once connected, or with the error that ended establishment.
    pub async fn wait_connected(&self) -> Result<(), ComputeError> {
        let mut rx = self.state.clone();
        let state = *rx
            .wait_for(|s| *s == ComputeState::Connected || s.is_terminal())
            .await
            .map_err(|_| ComputeError::Unknown("compute worker stopped".to_string()))?;
        match state {
            ComputeState::Connected => Ok(()),
            ComputeState::Unusable => Err(ComputeError::Unusable),
            _ => Err(ComputeError::FailedToConnect(format!(
                "compute connection ended in state {state:?}"
            ))),
        }
    }

    /// Flush queued payloads, close the connection and stop the task.
    pub fn shutdown(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.cancel.cancel();
    }
}

impl Drop for ComputeWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    config: WorkerConfig,
    machine: ConnectionMachine,
    state_tx: watch::Sender<ComputeState>,
    events: mpsc::UnboundedSender<ComputeEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let session_id = self.config.session_id;
        let mut next = Some(Observation::Start);
        let mut stream = None;

        while let Some(observation) = next.take() {
            let (state, effects) = self.machine.step(observation);
            self.publish(state);
            for effect in effects {
                let observed = match effect {
                    Effect::Report(err) => {
                        warn!(session_id, error = %err, "compute connection failed");
                        let _ = self.events.send(ComputeEvent::Error(err));
                        continue;
                    }
                    Effect::QueryStatus { after } => self.query_status(after).await,
                    Effect::Launch => self.launch().await,
                    Effect::Connect { host, port } => match self.connect(&host, port).await {
                        Some(Ok(tcp)) => {
                            info!(session_id, %host, port, "connected to compute engine");
                            stream = Some(tcp);
                            Some(Observation::ConnectSucceeded)
                        }
                        Some(Err(reason)) => Some(Observation::ConnectFailed(reason)),
                        None => None,
                    },
                };
                match observed {
                    Some(obs) => next = Some(obs),
                    None => {
                        debug!(session_id, "compute worker cancelled");
                        return;
                    }
                }
            }
        }

        if let Some(tcp) = stream {
            if self.machine.state() == ComputeState::Connected {
                if let Some(lost) = self.serve(tcp).await {
                    let (state, effects) = self.machine.step(lost);
                    self.publish(state);
                    for effect in effects {
                        if let Effect::Report(err) = effect {
                            let _ = self.events.send(ComputeEvent::Error(err));
                        }
                    }
                }
            }
        }
    }

    fn publish(&self, state: ComputeState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!(session_id = self.config.session_id, ?state, "compute state");
        let _ = self.events.send(ComputeEvent::StateChanged(state));
        self.state_tx.send_replace(state);
    }

    async fn query_status(&self, after: Duration) -> Option<Observation> {
        let ComputeTarget::Orchestrated { orchestrator, .. } = &self.config.target else {
            return Some(Observation::OrchestrationFailed(
                "status query without orchestrator".to_string(),
            ));
        };
        let orchestrator = orchestrator.clone();
        let session_id = self.config.session_id;
        self.cancellable(async move {
            if !after.is_zero() {
                tokio::time::sleep(after).await;
            }
            match orchestrator.status(session_id).await {
                Ok(status) => Observation::PodStatus(status),
                Err(e) => Observation::OrchestrationFailed(e.to_string()),
            }
        })
        .await
    }

    async fn launch(&self) -> Option<Observation> {
        let ComputeTarget::Orchestrated { orchestrator, .. } = &self.config.target else {
            return Some(Observation::LaunchFailed(
                "launch without orchestrator".to_string(),
            ));
        };
        let orchestrator = orchestrator.clone();
        let (wspace_id, session_id) = (self.config.wspace_id, self.config.session_id);
        self.cancellable(async move {
            match orchestrator.launch(wspace_id, session_id).await {
                Ok(()) => Observation::LaunchSucceeded,
                Err(e) => Observation::LaunchFailed(e.to_string()),
            }
        })
        .await
    }

    async fn connect(&self, host: &str, port: u16) -> Option<Result<TcpStream, String>> {
        let timeout = self.config.connect_timeout;
        self.cancellable(async move {
            let connect = TcpStream::connect((host, port));
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, connect).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("connect to {host}:{port} timed out")),
                },
                None => connect.await.map_err(|e| e.to_string()),
            }
        })
        .await
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Pump frames until the connection ends. Returns the observation to feed
    /// back when it ended abnormally.
    async fn serve(&mut self, tcp: TcpStream) -> Option<Observation> {
        let session_id = self.config.session_id;
        let framed = Framed::new(tcp, ComputeFrameCodec::new(self.config.max_frame_len));
        let (mut sink, mut frames) = framed.split();

        loop {
            tokio::select! {
                biased;

                outbound = self.outbound.recv() => match outbound {
                    Some(Outbound::Frame(payload)) => {
                        if let Err(e) = sink.send(payload).await {
                            warn!(session_id, error = %e, "compute write failed");
                            return Some(Observation::WriteFailed(e.to_string()));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.close().await;
                        info!(session_id, "compute connection closed");
                        return None;
                    }
                },

                frame = frames.next() => match frame {
                    Some(Ok(ComputeFrame::Payload(payload))) => {
                        let _ = self.events.send(ComputeEvent::Message(payload));
                    }
                    Some(Ok(ComputeFrame::InvalidHeader { magic, len })) => {
                        warn!(session_id, magic, len, "invalid frame header from compute engine");
                        let _ = self
                            .events
                            .send(ComputeEvent::Error(ComputeError::InvalidHeader { magic, len }));
                    }
                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "compute read failed");
                        return Some(Observation::ConnectionLost(e.to_string()));
                    }
                    None => {
                        info!(session_id, "compute engine closed the connection");
                        return Some(Observation::ConnectionLost(
                            "connection closed by compute engine".to_string(),
                        ));
                    }
                },

                _ = self.cancel.cancelled() => return None,
            }
        }
    }
}
