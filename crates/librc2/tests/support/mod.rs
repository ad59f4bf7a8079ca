//! Shared fixtures: a scripted compute engine and a seeded data layer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use librc2::framing::{ComputeFrame, ComputeFrameCodec, FRAME_MAGIC};
use librc2::worker::ComputeTarget;
use librc2::{MemoryDao, SessionConfig};

pub const ALICE: i64 = 1;
pub const BOB: i64 = 2;
pub const ALICE_WSPACE: i64 = 100;
pub const BOB_WSPACE: i64 = 200;

/// Accepts compute connections and records every command received on them.
pub struct MockEngine {
    pub port: u16,
    received: mpsc::UnboundedReceiver<Value>,
    raw: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockEngine {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock engine")?;
        let port = listener.local_addr()?.port();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (raw, mut raw_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // one connection at a time; a new session may reconnect later
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let (read, mut write) = tcp.into_split();
                let mut frames = FramedRead::new(read, ComputeFrameCodec::default());
                loop {
                    tokio::select! {
                        frame = frames.next() => match frame {
                            Some(Ok(ComputeFrame::Payload(payload))) => {
                                if let Ok(value) = serde_json::from_slice(&payload) {
                                    let _ = received_tx.send(value);
                                }
                            }
                            Some(Ok(ComputeFrame::InvalidHeader { .. })) => {}
                            Some(Err(_)) | None => break,
                        },
                        bytes = raw_rx.recv() => match bytes {
                            Some(bytes) => {
                                if write.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        },
                    }
                }
            }
        });

        Ok(Self {
            port,
            received,
            raw,
        })
    }

    /// Next command from the broker.
    pub async fn recv(&mut self) -> Option<Value> {
        self.received.recv().await
    }

    /// Skip commands until one with the given `msg` arrives.
    pub async fn expect(&mut self, msg: &str) -> Result<Value> {
        while let Some(value) = self.received.recv().await {
            if value["msg"] == msg {
                return Ok(value);
            }
        }
        Err(anyhow!("engine stopped before {msg}"))
    }

    pub fn reply(&self, value: Value) {
        let payload = serde_json::to_vec(&value).unwrap_or_default();
        self.send_raw(frame(FRAME_MAGIC, &payload));
    }

    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.raw.send(bytes);
    }
}

pub fn frame(magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&magic.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn seeded_dao() -> Result<Arc<MemoryDao>> {
    let seed = serde_json::from_value(json!({
        "users": [
            {"id": ALICE, "version": 1, "login": "alice", "email": "alice@rc2.io"},
            {"id": BOB, "version": 1, "login": "bob", "email": "bob@rc2.io"}
        ],
        "projects": [
            {"id": 10, "version": 1, "userId": ALICE, "name": "analysis"},
            {"id": 20, "version": 1, "userId": BOB, "name": "thesis"}
        ],
        "workspaces": [
            {"id": ALICE_WSPACE, "version": 1, "name": "main", "userId": ALICE, "projectId": 10,
             "uniqueId": "w100", "lastAccessEpochMs": 0, "dateCreatedEpochMs": 0},
            {"id": BOB_WSPACE, "version": 1, "name": "main", "userId": BOB, "projectId": 20,
             "uniqueId": "w200", "lastAccessEpochMs": 0, "dateCreatedEpochMs": 0}
        ],
        "files": [
            {"wspaceId": ALICE_WSPACE, "name": "script.R", "content": "x <- rnorm(20)"}
        ]
    }))?;
    Ok(Arc::new(MemoryDao::from_seed(seed)))
}

pub fn session_config(port: u16, connect_timeout: Option<Duration>) -> SessionConfig {
    SessionConfig {
        target: ComputeTarget::Direct {
            host: "127.0.0.1".to_string(),
            port,
        },
        connect_timeout,
        start_timeout: None,
        max_frame_len: librc2::framing::DEFAULT_MAX_FRAME_LEN,
        max_file_bytes: 600 * 1024,
        db_host: "dbserver".to_string(),
        db_user: "rc2".to_string(),
        db_name: "rc2".to_string(),
        db_password: None,
    }
}

/// Next client message of the given `type`, with its exact bytes.
pub async fn next_of(rx: &mut mpsc::Receiver<Bytes>, kind: &str) -> Result<(Value, Bytes)> {
    while let Some(bytes) = rx.recv().await {
        let value: Value = serde_json::from_slice(&bytes)?;
        if value["type"] == kind {
            return Ok((value, bytes));
        }
    }
    Err(anyhow!("client queue closed before {kind}"))
}

/// Messages up to and including the first of the given `type`.
pub async fn drain_until(rx: &mut mpsc::Receiver<Bytes>, kind: &str) -> Result<Vec<Value>> {
    let mut seen = Vec::new();
    while let Some(bytes) = rx.recv().await {
        let value: Value = serde_json::from_slice(&bytes)?;
        let done = value["type"] == kind;
        seen.push(value);
        if done {
            return Ok(seen);
        }
    }
    Err(anyhow!("client queue closed before {kind}"))
}

/// The first message of each listed `type`, in whatever order they arrive.
pub async fn gather(
    rx: &mut mpsc::Receiver<Bytes>,
    kinds: &[&str],
) -> Result<HashMap<String, Value>> {
    let mut found = HashMap::new();
    while found.len() < kinds.len() {
        let bytes = rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("client queue closed while waiting for {kinds:?}"))?;
        let value: Value = serde_json::from_slice(&bytes)?;
        let Some(kind) = value["type"].as_str().map(str::to_string) else {
            continue;
        };
        if kinds.contains(&kind.as_str()) {
            found.entry(kind).or_insert(value);
        }
    }
    Ok(found)
}

pub async fn within<T>(fut: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .context("timed out")
}
