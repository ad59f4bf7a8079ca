mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use librc2::error::OrchestrationError;
use librc2::{
    ComputeError, ComputeEvent, ComputeTarget, ComputeWorker, Orchestrator, PodPhase, PodStatus,
    WorkerConfig,
};
use rc2_protocol::{ComputeState, WorkspaceId};

use support::*;

const POLL: Duration = Duration::from_millis(20);

/// Pods that come up on the first launch and are reachable on `port`.
struct HealthyCluster {
    port: u16,
    launches: AtomicU32,
}

#[async_trait]
impl Orchestrator for HealthyCluster {
    async fn status(&self, _session_id: i64) -> Result<Option<PodStatus>, OrchestrationError> {
        if self.launches.load(Ordering::SeqCst) == 0 {
            return Ok(None);
        }
        Ok(Some(PodStatus {
            phase: PodPhase::Running,
            address: Some("127.0.0.1".to_string()),
            failed_pods: 0,
        }))
    }

    async fn launch(&self, _wspace_id: WorkspaceId, _session_id: i64) -> Result<(), OrchestrationError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn compute_port(&self) -> u16 {
        self.port
    }
}

/// Every launched pod crashes.
#[derive(Default)]
struct CrashingCluster {
    launches: AtomicU32,
}

#[async_trait]
impl Orchestrator for CrashingCluster {
    async fn status(&self, _session_id: i64) -> Result<Option<PodStatus>, OrchestrationError> {
        let launches = self.launches.load(Ordering::SeqCst);
        if launches == 0 {
            return Ok(None);
        }
        Ok(Some(PodStatus {
            phase: PodPhase::Failed,
            address: None,
            failed_pods: launches,
        }))
    }

    async fn launch(&self, _wspace_id: WorkspaceId, _session_id: i64) -> Result<(), OrchestrationError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn compute_port(&self) -> u16 {
        7714
    }
}

fn config(target: ComputeTarget) -> WorkerConfig {
    WorkerConfig {
        target,
        wspace_id: ALICE_WSPACE,
        session_id: 42,
        connect_timeout: None,
        max_frame_len: librc2::framing::DEFAULT_MAX_FRAME_LEN,
    }
}

async fn states_until_terminal(
    events: &mut mpsc::UnboundedReceiver<ComputeEvent>,
) -> (Vec<ComputeState>, Vec<ComputeError>) {
    let mut states = Vec::new();
    let mut errors = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            ComputeEvent::StateChanged(state) => {
                states.push(state);
                if state.is_terminal() {
                    // the report follows the state change
                    if let Some(ComputeEvent::Error(e)) = events.recv().await {
                        errors.push(e);
                    }
                    break;
                }
            }
            ComputeEvent::Error(e) => errors.push(e),
            ComputeEvent::Message(_) => {}
        }
    }
    (states, errors)
}

#[tokio::test]
async fn direct_worker_exchanges_frames() -> Result<()> {
    let mut engine = MockEngine::start().await?;
    let (worker, mut events) = ComputeWorker::spawn(config(ComputeTarget::Direct {
        host: "127.0.0.1".to_string(),
        port: engine.port,
    }));
    within(worker.wait_connected()).await??;
    assert_eq!(worker.state(), ComputeState::Connected);

    worker.send(Bytes::from_static(br#"{"msg":"help","topic":"lm"}"#))?;
    let got = within(engine.expect("help")).await??;
    assert_eq!(got["topic"], "lm");

    engine.reply(serde_json::json!({"msg": "results", "string": "hi"}));
    let payload = within(async {
        loop {
            match events.recv().await {
                Some(ComputeEvent::Message(payload)) => return Some(payload),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await?
    .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&payload)?;
    assert_eq!(value["string"], "hi");

    worker.shutdown();
    Ok(())
}

#[tokio::test]
async fn refused_connection_is_terminal() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let (worker, mut events) = ComputeWorker::spawn(config(ComputeTarget::Direct {
        host: "127.0.0.1".to_string(),
        port,
    }));
    let (states, errors) = within(states_until_terminal(&mut events)).await?;
    assert_eq!(
        states,
        vec![ComputeState::Connecting, ComputeState::FailedToConnect]
    );
    assert!(matches!(errors.as_slice(), [ComputeError::FailedToConnect(_)]));
    assert!(matches!(
        worker.wait_connected().await,
        Err(ComputeError::FailedToConnect(_))
    ));
    assert_eq!(
        worker.send(Bytes::from_static(b"{}")),
        Err(ComputeError::NotConnected)
    );
    Ok(())
}

#[tokio::test]
async fn engine_hangup_is_reported() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        if let Ok((tcp, _)) = listener.accept().await {
            drop(tcp);
        }
    });

    let (worker, mut events) = ComputeWorker::spawn(config(ComputeTarget::Direct {
        host: "127.0.0.1".to_string(),
        port,
    }));
    let (states, errors) = within(states_until_terminal(&mut events)).await?;
    assert_eq!(
        states,
        vec![
            ComputeState::Connecting,
            ComputeState::Connected,
            ComputeState::FailedToConnect
        ]
    );
    assert!(matches!(errors.as_slice(), [ComputeError::FailedToReadMessage(_)]));
    assert_eq!(worker.state(), ComputeState::FailedToConnect);
    Ok(())
}

#[tokio::test]
async fn orchestrated_worker_launches_then_connects() -> Result<()> {
    let mut engine = MockEngine::start().await?;
    let cluster = Arc::new(HealthyCluster {
        port: engine.port,
        launches: AtomicU32::new(0),
    });
    let (worker, mut events) = ComputeWorker::spawn(config(ComputeTarget::Orchestrated {
        orchestrator: cluster.clone(),
        poll_interval: POLL,
    }));
    within(worker.wait_connected()).await??;
    assert_eq!(cluster.launches.load(Ordering::SeqCst), 1);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ComputeEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ComputeState::InitialHostSearch,
            ComputeState::Loading,
            ComputeState::Connecting,
            ComputeState::Connected
        ]
    );

    worker.send(Bytes::from_static(br#"{"msg":"clearEnvironment"}"#))?;
    within(engine.expect("clearEnvironment")).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn crashing_pods_stop_after_three_launches() -> Result<()> {
    let cluster = Arc::new(CrashingCluster::default());
    let (worker, mut events) = ComputeWorker::spawn(config(ComputeTarget::Orchestrated {
        orchestrator: cluster.clone(),
        poll_interval: POLL,
    }));
    let (states, errors) = states_until_terminal(&mut events).await;
    assert_eq!(states.last(), Some(&ComputeState::Unusable));
    assert_eq!(errors, vec![ComputeError::TooManyCrashes]);
    assert_eq!(cluster.launches.load(Ordering::SeqCst), 3);
    assert_eq!(worker.wait_connected().await, Err(ComputeError::Unusable));

    // no relaunch after giving up
    tokio::time::sleep(POLL * 10).await;
    assert_eq!(cluster.launches.load(Ordering::SeqCst), 3);
    Ok(())
}
