//! Launching and locating compute pods through the Kubernetes API.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::{debug, info, warn};

use rc2_protocol::WorkspaceId;

use crate::config::OrchestrationConfig;
use crate::error::OrchestrationError;

/// Pod manifest used when no template path is configured.
pub const DEFAULT_POD_TEMPLATE: &str = r#"{
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "generateName": "rc2-compute-{{ session_id }}-",
    "labels": {
      "app": "rc2-compute",
      "{{ session_label }}": "{{ session_id }}",
      "rc2-workspace": "{{ wspace_id }}"
    }
  },
  "spec": {
    "restartPolicy": "Never",
    "containers": [
      {
        "name": "compute",
        "image": "{{ image }}",
        "ports": [{ "containerPort": {{ compute_port }} }],
        "env": [
          { "name": "RC2_WSPACE_ID", "value": "{{ wspace_id }}" },
          { "name": "RC2_SESSION_ID", "value": "{{ session_id }}" }
        ]
      }
    ]
  }
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Higher is a better candidate when several pods share a session label.
    fn rank(self) -> u8 {
        match self {
            PodPhase::Running => 4,
            PodPhase::Pending => 3,
            PodPhase::Unknown => 2,
            PodPhase::Succeeded => 1,
            PodPhase::Failed => 0,
        }
    }

    fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub phase: PodPhase,
    /// Pod IP, once one has been assigned.
    pub address: Option<String>,
    /// Failed pods carrying the same session label.
    pub failed_pods: u32,
}

/// Source of compute instances for orchestrated sessions.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// `Ok(None)` when no pod exists for the session.
    async fn status(&self, session_id: i64) -> Result<Option<PodStatus>, OrchestrationError>;

    async fn launch(
        &self,
        wspace_id: WorkspaceId,
        session_id: i64,
    ) -> Result<(), OrchestrationError>;

    /// Port the compute engine listens on inside a pod.
    fn compute_port(&self) -> u16;
}

/// Kubernetes API client scoped to one namespace.
pub struct K8sServer {
    client: reqwest::Client,
    pods_url: String,
    template: String,
    image: String,
    session_label: String,
    compute_port: u16,
}

impl K8sServer {
    pub fn new(config: &OrchestrationConfig) -> Result<Self, OrchestrationError> {
        let token = std::fs::read_to_string(&config.token_path).map_err(|e| {
            OrchestrationError::InvalidConfiguration(format!(
                "failed to read api token {}: {e}",
                config.token_path.display()
            ))
        })?;
        let template = match &config.manifest_template_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                OrchestrationError::InvalidConfiguration(format!(
                    "failed to read pod template {}: {e}",
                    path.display()
                ))
            })?,
            None => DEFAULT_POD_TEMPLATE.to_string(),
        };

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|e| OrchestrationError::InvalidConfiguration(e.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(ca_path) = &config.ca_cert_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                OrchestrationError::InvalidConfiguration(format!(
                    "failed to read ca certificate {}: {e}",
                    ca_path.display()
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| OrchestrationError::InvalidConfiguration(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| OrchestrationError::InvalidConfiguration(e.to_string()))?;

        Ok(Self {
            client,
            pods_url: format!(
                "{}/api/v1/namespaces/{}/pods",
                config.api_base_url.trim_end_matches('/'),
                config.namespace
            ),
            template,
            image: config.image.clone(),
            session_label: config.session_label.clone(),
            compute_port: config.compute_port,
        })
    }
}

#[async_trait]
impl Orchestrator for K8sServer {
    async fn status(&self, session_id: i64) -> Result<Option<PodStatus>, OrchestrationError> {
        let selector = format!("{}={}", self.session_label, session_id);
        let resp = self
            .client
            .get(&self.pods_url)
            .query(&[("labelSelector", selector.as_str())])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(OrchestrationError::InvalidResponse(format!(
                "pod list returned {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await?;
        let status = parse_pod_list(&body)?;
        debug!(session_id, ?status, "pod status");
        Ok(status)
    }

    async fn launch(
        &self,
        wspace_id: WorkspaceId,
        session_id: i64,
    ) -> Result<(), OrchestrationError> {
        let manifest = render_manifest(
            &self.template,
            &ManifestValues {
                wspace_id,
                session_id,
                image: &self.image,
                session_label: &self.session_label,
                compute_port: self.compute_port,
            },
        )?;
        let resp = self.client.post(&self.pods_url).json(&manifest).send().await?;
        if resp.status() != StatusCode::CREATED {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(session_id, %status, %body, "pod launch rejected");
            return Err(OrchestrationError::InvalidResponse(format!(
                "pod create returned {status}"
            )));
        }
        info!(session_id, wspace_id, "launched compute pod");
        Ok(())
    }

    fn compute_port(&self) -> u16 {
        self.compute_port
    }
}

pub struct ManifestValues<'a> {
    pub wspace_id: WorkspaceId,
    pub session_id: i64,
    pub image: &'a str,
    pub session_label: &'a str,
    pub compute_port: u16,
}

/// Render the pod template and parse the result as a JSON manifest.
pub fn render_manifest(
    template: &str,
    values: &ManifestValues<'_>,
) -> Result<serde_json::Value, OrchestrationError> {
    let env = minijinja::Environment::new();
    let rendered = env
        .render_str(
            template,
            minijinja::context! {
                wspace_id => values.wspace_id,
                session_id => values.session_id,
                image => values.image,
                session_label => values.session_label,
                compute_port => values.compute_port,
            },
        )
        .map_err(|e| OrchestrationError::InvalidConfiguration(format!("pod template: {e}")))?;
    serde_json::from_str(&rendered).map_err(|e| {
        OrchestrationError::InvalidConfiguration(format!("pod template is not valid JSON: {e}"))
    })
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    #[serde(default)]
    status: Option<PodStatusBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusBody {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    pod_ip: Option<String>,
}

/// Status of the most promising pod in a pod list response, `None` if the
/// list is empty.
pub fn parse_pod_list(body: &[u8]) -> Result<Option<PodStatus>, OrchestrationError> {
    let list: PodList = serde_json::from_slice(body)
        .map_err(|e| OrchestrationError::InvalidResponse(e.to_string()))?;
    let pods: Vec<(PodPhase, Option<String>)> = list
        .items
        .into_iter()
        .map(|pod| {
            let status = pod.status.unwrap_or(PodStatusBody {
                phase: None,
                pod_ip: None,
            });
            let phase = status
                .phase
                .as_deref()
                .map(PodPhase::parse)
                .unwrap_or(PodPhase::Pending);
            (phase, status.pod_ip.filter(|ip| !ip.is_empty()))
        })
        .collect();
    let failed_pods = pods.iter().filter(|(p, _)| *p == PodPhase::Failed).count() as u32;
    Ok(pods
        .into_iter()
        .max_by_key(|(phase, _)| phase.rank())
        .map(|(phase, address)| PodStatus {
            phase,
            address,
            failed_pods,
        }))
}
