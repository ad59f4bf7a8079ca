//! `K8sServer` against an in-process stand-in for the cluster pods API.

mod support;

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

use librc2::{
    AppConfig, ComputeTarget, ComputeWorker, K8sServer, OrchestrationError, Orchestrator,
    PodPhase, PodStatus, WorkerConfig,
};

use support::*;

#[derive(Default)]
struct Cluster {
    pods: Vec<Value>,
    created: Vec<Value>,
    selectors: Vec<String>,
    bearer: Vec<String>,
    namespaces: Vec<String>,
    /// Status answered to every create; 201 when unset.
    create_status: Option<u16>,
    /// Address given to pods created from now on; they start `Running`.
    run_at: Option<String>,
}

type Shared = Arc<Mutex<Cluster>>;

async fn list_pods(
    State(cluster): State<Shared>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut cluster = cluster.lock().unwrap();
    cluster.namespaces.push(namespace);
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        cluster.bearer.push(auth.to_string());
    }
    cluster
        .selectors
        .push(query.get("labelSelector").cloned().unwrap_or_default());
    Json(json!({"kind": "PodList", "items": cluster.pods}))
}

async fn create_pod(
    State(cluster): State<Shared>,
    Json(manifest): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut cluster = cluster.lock().unwrap();
    cluster.created.push(manifest.clone());
    let status = cluster.create_status.unwrap_or(201);
    if status == 201 {
        if let Some(ip) = cluster.run_at.clone() {
            cluster
                .pods
                .push(json!({"status": {"phase": "Running", "podIP": ip}}));
        }
    }
    (
        StatusCode::from_u16(status).unwrap(),
        Json(json!({"kind": "Pod", "metadata": manifest["metadata"]})),
    )
}

async fn start_cluster(cluster: Shared) -> Result<String> {
    let app = Router::new()
        .route("/api/v1/namespaces/{namespace}/pods", get(list_pods).post(create_pod))
        .with_state(cluster);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn server(base_url: &str, compute_port: u16) -> Result<(K8sServer, NamedTempFile)> {
    let mut token = NamedTempFile::new()?;
    writeln!(token, "sekrit-token")?;
    let config = AppConfig::from_toml_str(&format!(
        r#"
        [orchestration]
        api_base_url = "{base_url}/"
        namespace = "rc2"
        image = "docker.rc2.io/compute:latest"
        token_path = "{}"
        compute_port = {compute_port}
        poll_interval_ms = 20
        "#,
        token.path().display()
    ))?;
    let orch = config.orchestration.expect("orchestration section");
    Ok((K8sServer::new(&orch)?, token))
}

#[tokio::test]
async fn status_queries_by_session_label() -> Result<()> {
    let cluster = Shared::default();
    let base = start_cluster(cluster.clone()).await?;
    let (k8s, _token) = server(&base, 7714)?;

    assert_eq!(within(k8s.status(42)).await??, None);
    cluster.lock().unwrap().pods = vec![
        json!({"status": {"phase": "Failed"}}),
        json!({"status": {"phase": "Running", "podIP": "10.0.0.7"}}),
    ];
    assert_eq!(
        within(k8s.status(42)).await??,
        Some(PodStatus {
            phase: PodPhase::Running,
            address: Some("10.0.0.7".to_string()),
            failed_pods: 1,
        })
    );

    let cluster = cluster.lock().unwrap();
    assert_eq!(cluster.selectors, vec!["rc2-session=42", "rc2-session=42"]);
    assert_eq!(cluster.namespaces, vec!["rc2", "rc2"]);
    assert!(cluster.bearer.iter().all(|b| b == "Bearer sekrit-token"));
    assert_eq!(cluster.bearer.len(), 2);
    Ok(())
}

#[tokio::test]
async fn launch_posts_rendered_manifest() -> Result<()> {
    let cluster = Shared::default();
    let base = start_cluster(cluster.clone()).await?;
    let (k8s, _token) = server(&base, 7714)?;

    within(k8s.launch(100, 42)).await??;
    let cluster = cluster.lock().unwrap();
    let [manifest] = cluster.created.as_slice() else {
        panic!("expected one pod create, got {}", cluster.created.len());
    };
    assert_eq!(manifest["kind"], "Pod");
    assert_eq!(manifest["metadata"]["generateName"], "rc2-compute-42-");
    assert_eq!(manifest["metadata"]["labels"]["rc2-session"], "42");
    assert_eq!(
        manifest["spec"]["containers"][0]["image"],
        "docker.rc2.io/compute:latest"
    );
    assert_eq!(
        manifest["spec"]["containers"][0]["ports"][0]["containerPort"],
        7714
    );
    Ok(())
}

#[tokio::test]
async fn rejected_launch_is_invalid_response() -> Result<()> {
    let cluster = Shared::default();
    cluster.lock().unwrap().create_status = Some(409);
    let base = start_cluster(cluster.clone()).await?;
    let (k8s, _token) = server(&base, 7714)?;

    match within(k8s.launch(100, 42)).await? {
        Err(OrchestrationError::InvalidResponse(msg)) => assert!(msg.contains("409")),
        other => panic!("wrong result {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_api_is_connection_failure() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    drop(listener);
    let (k8s, _token) = server(&base, 7714)?;

    assert!(matches!(
        within(k8s.status(1)).await?,
        Err(OrchestrationError::ConnectionFailed(_))
    ));
    Ok(())
}

#[test]
fn missing_token_is_configuration_error() -> Result<()> {
    let config = AppConfig::from_toml_str(
        r#"
        [orchestration]
        image = "compute"
        token_path = "/nonexistent/rc2/token"
        "#,
    )?;
    let orch = config.orchestration.expect("orchestration section");
    assert!(matches!(
        K8sServer::new(&orch),
        Err(OrchestrationError::InvalidConfiguration(_))
    ));
    Ok(())
}

#[tokio::test]
async fn worker_reaches_launched_pod() -> Result<()> {
    let mut engine = MockEngine::start().await?;
    let cluster = Shared::default();
    cluster.lock().unwrap().run_at = Some("127.0.0.1".to_string());
    let base = start_cluster(cluster.clone()).await?;
    let (k8s, _token) = server(&base, engine.port)?;

    let (worker, _events) = ComputeWorker::spawn(WorkerConfig {
        target: ComputeTarget::Orchestrated {
            orchestrator: Arc::new(k8s),
            poll_interval: Duration::from_millis(20),
        },
        wspace_id: ALICE_WSPACE,
        session_id: 9,
        connect_timeout: Some(Duration::from_secs(5)),
        max_frame_len: librc2::framing::DEFAULT_MAX_FRAME_LEN,
    });
    within(worker.wait_connected()).await??;
    assert_eq!(cluster.lock().unwrap().created.len(), 1);

    worker.send(bytes::Bytes::from_static(br#"{"msg":"help","topic":"plot"}"#))?;
    within(engine.expect("help")).await??;
    Ok(())
}
