//! JSON protocol spoken with the compute engine.
//!
//! Commands that produce correlated output (`execScript`, `execFile`) are
//! assigned a query id; the engine echoes it back on every related response
//! and the coder maps it back to the client's transaction id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use bytes::Bytes;
use rc2_protocol::variable::{Variable, keyed_by_name};
use rc2_protocol::{ComputeErrorCode, FileId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::ComputeError;

pub type QueryId = i64;

/// Parameters of the `open` command sent once a connection is established.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub wspace_id: WorkspaceId,
    pub session_rec_id: i64,
    pub db_host: String,
    pub db_user: String,
    pub db_name: String,
    pub db_password: Option<String>,
}

/// A decoded compute engine response.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeResponse {
    Open {
        success: bool,
        error_message: Option<String>,
    },
    ExecComplete(ExecCompleteData),
    Results(ResultsData),
    ShowFile(ShowFileData),
    VariableValue(VariableData),
    Variables(ListVariablesData),
    Help {
        topic: String,
        paths: Vec<String>,
    },
    Error(ComputeErrorData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecCompleteData {
    pub transaction_id: String,
    pub batch_id: Option<i64>,
    pub expect_show_output: bool,
    pub image_ids: Vec<i64>,
    /// Set when the run was an `execFile`.
    pub file_id: Option<FileId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultsData {
    pub transaction_id: String,
    pub text: String,
    pub is_stderr: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShowFileData {
    pub transaction_id: String,
    pub file_id: FileId,
    pub file_version: i32,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableData {
    pub variable: Variable,
    /// The socket that asked for the value, if any.
    pub client_ident: Option<u64>,
    pub context_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListVariablesData {
    pub variables: BTreeMap<String, Variable>,
    pub removed: Vec<String>,
    pub delta: bool,
    pub context_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeErrorData {
    pub code: ComputeErrorCode,
    pub details: String,
    pub transaction_id: Option<String>,
}

#[derive(Default)]
struct Correlation {
    next_query_id: QueryId,
    by_transaction: HashMap<String, QueryId>,
    by_query: HashMap<QueryId, String>,
    /// Completed queries whose `showoutput` messages may still arrive.
    awaiting_output: Vec<QueryId>,
}

/// Encodes commands for and decodes responses from one compute engine.
pub struct ComputeCoder {
    correlation: Mutex<Correlation>,
}

impl Default for ComputeCoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeCoder {
    pub fn new() -> Self {
        Self {
            correlation: Mutex::new(Correlation {
                next_query_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn open(&self, params: &OpenParams) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::Open {
            argument: "",
            wspace_id: params.wspace_id,
            session_rec_id: params.session_rec_id,
            dbhost: &params.db_host,
            dbuser: &params.db_user,
            dbname: &params.db_name,
            dbpassword: params.db_password.as_deref(),
        })
    }

    pub fn execute_script(&self, transaction_id: &str, script: &str) -> Result<Bytes, ComputeError> {
        let query_id = self.create_query_id(transaction_id);
        encode(&WireCommand::ExecScript {
            query_id,
            argument: script,
            start_time: epoch_ms(),
        })
    }

    pub fn execute_file(
        &self,
        transaction_id: &str,
        file_id: FileId,
        file_version: Option<i32>,
    ) -> Result<Bytes, ComputeError> {
        let query_id = self.create_query_id(transaction_id);
        encode(&WireCommand::ExecFile {
            query_id,
            argument: file_id.to_string(),
            client_data: FileClientData {
                file_id,
                file_version,
            },
            start_time: epoch_ms(),
        })
    }

    /// `client_ident` is echoed back so the value can be sent to one socket.
    pub fn get_variable(&self, name: &str, client_ident: Option<u64>) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::GetVariable {
            argument: name,
            client_data: client_ident.map(|client_ident| VariableClientData { client_ident }),
        })
    }

    pub fn list_variables(&self, delta_only: bool) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::ListVariables {
            argument: "",
            delta: delta_only,
        })
    }

    pub fn toggle_variable_watch(&self, enable: bool) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::ToggleVariableWatch {
            argument: "",
            watch: enable,
        })
    }

    pub fn help(&self, topic: &str) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::Help { argument: topic })
    }

    pub fn save_environment(&self) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::SaveEnv { argument: "" })
    }

    pub fn clear_environment(&self, environment_id: i32) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::ClearEnvironment {
            argument: environment_id.to_string(),
        })
    }

    pub fn close(&self) -> Result<Bytes, ComputeError> {
        encode(&WireCommand::Close { argument: "" })
    }

    /// Parse one frame payload from the compute engine.
    pub fn decode(&self, data: &[u8]) -> Result<ComputeResponse, ComputeError> {
        let wire: WireResponse =
            serde_json::from_slice(data).map_err(|e| ComputeError::InvalidFormat(e.to_string()))?;
        match wire {
            WireResponse::OpenResponse {
                success,
                error_details,
            } => {
                if !success && error_details.is_none() {
                    return Err(ComputeError::InvalidFormat(
                        "failed openresponse without errorDetails".to_string(),
                    ));
                }
                Ok(ComputeResponse::Open {
                    success,
                    error_message: error_details,
                })
            }
            WireResponse::ExecComplete {
                query_id,
                expect_show_output,
                client_data,
                img_batch,
                images,
            } => {
                let transaction_id = self.complete_query(query_id, expect_show_output)?;
                let file_id = client_data
                    .as_ref()
                    .and_then(|data| data.get("fileId"))
                    .and_then(Value::as_i64);
                Ok(ComputeResponse::ExecComplete(ExecCompleteData {
                    transaction_id,
                    batch_id: img_batch,
                    expect_show_output,
                    image_ids: images,
                    file_id,
                }))
            }
            WireResponse::Results {
                query_id,
                stderr,
                string,
            } => Ok(ComputeResponse::Results(ResultsData {
                transaction_id: self.required_transaction(query_id)?,
                text: string,
                is_stderr: stderr,
            })),
            WireResponse::ShowOutput {
                query_id,
                file_id,
                file_version,
                file_name,
            } => Ok(ComputeResponse::ShowFile(ShowFileData {
                transaction_id: self.required_transaction(query_id)?,
                file_id,
                file_version,
                file_name,
            })),
            WireResponse::VariableUpdate {
                variables,
                removed,
                delta,
                context_id,
            } => Ok(ComputeResponse::Variables(ListVariablesData {
                variables: parse_variable_set(&variables)?,
                removed,
                delta,
                context_id,
            })),
            WireResponse::VariableValue {
                value,
                client_data,
                context_id,
            } => {
                let variable = Variable::from_legacy(&value)
                    .map_err(|e| ComputeError::InvalidFormat(e.to_string()))?;
                Ok(ComputeResponse::VariableValue(VariableData {
                    variable,
                    client_ident: client_data.and_then(|data| data.client_ident),
                    context_id,
                }))
            }
            WireResponse::Help { topic, paths } => Ok(ComputeResponse::Help { topic, paths }),
            WireResponse::Error {
                error_code,
                error_details,
                query_id,
            } => Ok(ComputeResponse::Error(ComputeErrorData {
                code: ComputeErrorCode(error_code),
                details: error_details,
                transaction_id: query_id.and_then(|qid| self.transaction_id(qid)),
            })),
        }
    }

    /// The active query id for a transaction.
    pub fn query_id(&self, transaction_id: &str) -> Option<QueryId> {
        self.lock().by_transaction.get(transaction_id).copied()
    }

    pub fn transaction_id(&self, query_id: QueryId) -> Option<String> {
        self.lock().by_query.get(&query_id).cloned()
    }

    fn create_query_id(&self, transaction_id: &str) -> QueryId {
        let mut table = self.lock();
        let query_id = table.next_query_id;
        table.next_query_id += 1;
        if let Some(previous) = table
            .by_transaction
            .insert(transaction_id.to_string(), query_id)
        {
            table.by_query.remove(&previous);
        }
        table.by_query.insert(query_id, transaction_id.to_string());
        query_id
    }

    fn required_transaction(&self, query_id: QueryId) -> Result<String, ComputeError> {
        self.transaction_id(query_id)
            .ok_or_else(|| ComputeError::InvalidFormat(format!("unknown queryId {query_id}")))
    }

    /// Looks up and releases the correlation for a finished query. When
    /// output files are still expected the query id stays resolvable so the
    /// trailing `showoutput` messages can be attributed, until a newer query
    /// completes.
    fn complete_query(
        &self,
        query_id: QueryId,
        expect_show_output: bool,
    ) -> Result<String, ComputeError> {
        let mut table = self.lock();
        let transaction_id = table
            .by_query
            .get(&query_id)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidFormat(format!("unknown queryId {query_id}")))?;
        if table.by_transaction.get(&transaction_id) == Some(&query_id) {
            table.by_transaction.remove(&transaction_id);
        }
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut table.awaiting_output)
            .into_iter()
            .partition(|&awaiting| awaiting < query_id);
        table.awaiting_output = kept;
        for stale in released {
            table.by_query.remove(&stale);
        }
        if expect_show_output {
            if !table.awaiting_output.contains(&query_id) {
                table.awaiting_output.push(query_id);
            }
        } else {
            table.by_query.remove(&query_id);
            table.awaiting_output.retain(|&awaiting| awaiting != query_id);
        }
        Ok(transaction_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Correlation> {
        // Every update leaves the table consistent, so poisoning is ignored.
        self.correlation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn encode(command: &WireCommand<'_>) -> Result<Bytes, ComputeError> {
    serde_json::to_vec(command)
        .map(Bytes::from)
        .map_err(|e| ComputeError::InvalidFormat(e.to_string()))
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `variables` arrives either as an object keyed by name or as an array.
fn parse_variable_set(value: &Value) -> Result<BTreeMap<String, Variable>, ComputeError> {
    let items: Vec<&Value> = match value {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(ComputeError::InvalidFormat(format!(
                "variables must be an object or array, got {other}"
            )));
        }
    };
    let parsed = items
        .into_iter()
        .map(Variable::from_legacy)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ComputeError::InvalidFormat(e.to_string()))?;
    Ok(keyed_by_name(parsed))
}

#[derive(Serialize)]
#[serde(tag = "msg", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum WireCommand<'a> {
    Open {
        argument: &'a str,
        wspace_id: WorkspaceId,
        session_rec_id: i64,
        dbhost: &'a str,
        dbuser: &'a str,
        dbname: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        dbpassword: Option<&'a str>,
    },
    ExecScript {
        query_id: QueryId,
        argument: &'a str,
        start_time: u64,
    },
    ExecFile {
        query_id: QueryId,
        argument: String,
        client_data: FileClientData,
        start_time: u64,
    },
    GetVariable {
        argument: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_data: Option<VariableClientData>,
    },
    ListVariables {
        argument: &'a str,
        delta: bool,
    },
    ToggleVariableWatch {
        argument: &'a str,
        watch: bool,
    },
    Help {
        argument: &'a str,
    },
    SaveEnv {
        argument: &'a str,
    },
    ClearEnvironment {
        argument: String,
    },
    Close {
        argument: &'a str,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileClientData {
    file_id: FileId,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_version: Option<i32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VariableClientData {
    client_ident: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariableValueClientData {
    #[serde(default)]
    client_ident: Option<u64>,
}

#[derive(Deserialize)]
#[serde(tag = "msg", rename_all_fields = "camelCase")]
enum WireResponse {
    #[serde(rename = "openresponse")]
    OpenResponse {
        success: bool,
        #[serde(default)]
        error_details: Option<String>,
    },
    #[serde(rename = "execComplete")]
    ExecComplete {
        query_id: QueryId,
        #[serde(default)]
        expect_show_output: bool,
        #[serde(default)]
        client_data: Option<Map<String, Value>>,
        #[serde(default)]
        img_batch: Option<i64>,
        #[serde(default)]
        images: Vec<i64>,
    },
    #[serde(rename = "results")]
    Results {
        query_id: QueryId,
        stderr: bool,
        string: String,
    },
    #[serde(rename = "showoutput")]
    ShowOutput {
        query_id: QueryId,
        file_id: FileId,
        file_version: i32,
        file_name: String,
    },
    #[serde(rename = "variableupdate")]
    VariableUpdate {
        variables: Value,
        #[serde(default)]
        removed: Vec<String>,
        #[serde(default)]
        delta: bool,
        #[serde(default)]
        context_id: Option<i32>,
    },
    #[serde(rename = "variablevalue")]
    VariableValue {
        value: Value,
        #[serde(default)]
        client_data: Option<VariableValueClientData>,
        #[serde(default)]
        context_id: Option<i32>,
    },
    #[serde(rename = "help")]
    Help { topic: String, paths: Vec<String> },
    #[serde(rename = "error")]
    Error {
        error_code: i32,
        error_details: String,
        #[serde(default)]
        query_id: Option<QueryId>,
    },
}
