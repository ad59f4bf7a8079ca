pub mod error;
pub mod model;
pub mod variable;

pub use error::{ComputeErrorCode, SessionError};
pub use model::{BulkUserInfo, File, FileId, Project, SessionImage, User, Workspace, WorkspaceId};
pub use variable::Variable;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Client-to-session commands, sent as JSON in binary or text WebSocket frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "cmd",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SessionCommand {
    Execute(ExecuteParams),
    ExecuteFile {
        transaction_id: String,
        file_id: FileId,
        #[serde(default)]
        file_version: Option<i32>,
    },
    FileOperation {
        transaction_id: String,
        operation: FileOperation,
        file_id: FileId,
        file_version: i32,
        #[serde(default)]
        new_name: Option<String>,
    },
    GetVariable {
        name: String,
        #[serde(default)]
        context_id: Option<i32>,
    },
    WatchVariables {
        watch: bool,
        #[serde(default)]
        context_id: Option<i32>,
    },
    Save {
        transaction_id: String,
        file_id: FileId,
        file_version: i32,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    Help {
        topic: String,
    },
    ClearEnvironment {
        environment_id: i32,
    },
    Info,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub transaction_id: String,
    pub source: String,
    #[serde(default = "default_true")]
    pub is_user_initiated: bool,
    #[serde(default)]
    pub context_id: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Rename,
    Remove,
    Duplicate,
}

/// Session-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionResponse {
    Connected(BulkUserInfo),
    Info(InfoData),
    EchoExecute(ExecuteData),
    EchoExecuteFile(ExecuteFileData),
    ExecComplete(ExecCompleteData),
    Results(ResultsData),
    ShowOutput(ShowOutputData),
    Variables(VariablesData),
    VariableValue(VariableValueData),
    FileOperation(FileOperationData),
    FileChanged(FileChangedData),
    Help(HelpData),
    Save(SaveData),
    Error(ErrorData),
    ComputeStatus(ComputeStatusData),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfoData {
    pub workspace: Workspace,
    pub files: Vec<File>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteData {
    pub transaction_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteFileData {
    pub transaction_id: String,
    pub file_id: FileId,
    #[serde(default)]
    pub file_version: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecCompleteData {
    pub transaction_id: String,
    pub batch_id: i64,
    pub expect_show_output: bool,
    pub images: Vec<SessionImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultsData {
    pub transaction_id: String,
    pub output: String,
    pub is_error: bool,
}

/// A file the compute engine wants displayed. `file_data` is omitted when the
/// file is larger than the configured WebSocket limit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShowOutputData {
    pub transaction_id: String,
    pub file: File,
    #[serde(default, with = "base64_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub file_data: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariablesData {
    pub variables: BTreeMap<String, Variable>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub delta: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableValueData {
    pub value: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationData {
    pub transaction_id: String,
    pub operation: FileOperation,
    pub success: bool,
    pub file_id: FileId,
    /// Set for a successful duplicate.
    #[serde(default)]
    pub file: Option<File>,
    #[serde(default)]
    pub error: Option<SessionError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileChangeType {
    Insert,
    Update,
    Delete,
}

/// A change to a file in the session's workspace, made by anyone.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileChangedData {
    pub change_type: FileChangeType,
    pub file_id: FileId,
    /// Absent for deletes.
    #[serde(default)]
    pub file: Option<File>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelpData {
    pub topic: String,
    /// Display title (`"print (base)"`) to help page path.
    pub items: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaveData {
    pub transaction_id: String,
    pub success: bool,
    #[serde(default)]
    pub file: Option<File>,
    #[serde(default)]
    pub error: Option<SessionError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub error: SessionError,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComputeStatusData {
    pub state: ComputeState,
}

/// Connection state of a session's compute engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ComputeState {
    Uninitialized,
    InitialHostSearch,
    Loading,
    Connecting,
    Connected,
    FailedToConnect,
    Unusable,
}

impl ComputeState {
    /// No further transitions happen from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ComputeState::FailedToConnect | ComputeState::Unusable)
    }
}

fn default_true() -> bool {
    true
}

/// Base64 encoding for byte arrays in JSON.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => STANDARD
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> File {
        File {
            id: 12,
            version: 3,
            wspace_id: 1,
            name: "plot.R".to_string(),
            date_created_epoch_ms: 1_500_000_000_000,
            last_modified_epoch_ms: 1_500_000_100_000,
            file_size: 42,
        }
    }

    #[test]
    fn execute_parses_with_defaults() {
        let json = r#"{"cmd":"execute","transactionId":"t1","source":"2*2"}"#;
        let cmd: SessionCommand = serde_json::from_str(json).unwrap();
        match cmd {
            SessionCommand::Execute(params) => {
                assert_eq!(params.transaction_id, "t1");
                assert_eq!(params.source, "2*2");
                assert!(params.is_user_initiated);
                assert!(params.context_id.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn command_tag_format() {
        let json = serde_json::to_string(&SessionCommand::Info).unwrap();
        assert_eq!(json, r#"{"cmd":"info"}"#);

        let json = serde_json::to_string(&SessionCommand::ClearEnvironment { environment_id: 2 })
            .unwrap();
        assert_eq!(json, r#"{"cmd":"clearEnvironment","environmentId":2}"#);
    }

    #[test]
    fn file_operation_parses() {
        let json = r#"{"cmd":"fileOperation","transactionId":"t2","operation":"duplicate","fileId":12,"fileVersion":3,"newName":"copy.R"}"#;
        let cmd: SessionCommand = serde_json::from_str(json).unwrap();
        match cmd {
            SessionCommand::FileOperation {
                operation,
                file_id,
                new_name,
                ..
            } => {
                assert_eq!(operation, FileOperation::Duplicate);
                assert_eq!(file_id, 12);
                assert_eq!(new_name.as_deref(), Some("copy.R"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn save_content_is_base64() {
        let json = r#"{"cmd":"save","transactionId":"t3","fileId":12,"fileVersion":3,"content":"aGVsbG8="}"#;
        let cmd: SessionCommand = serde_json::from_str(json).unwrap();
        match cmd {
            SessionCommand::Save { content, .. } => assert_eq!(content, b"hello"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        let json = r#"{"cmd":"launchMissiles"}"#;
        assert!(serde_json::from_str::<SessionCommand>(json).is_err());
    }

    #[test]
    fn results_response_format() {
        let resp = SessionResponse::Results(ResultsData {
            transaction_id: "t1".to_string(),
            output: "[1] 4".to_string(),
            is_error: false,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"results","transactionId":"t1","output":"[1] 4","isError":false}"#
        );
    }

    #[test]
    fn show_output_omits_missing_data() {
        let resp = SessionResponse::ShowOutput(ShowOutputData {
            transaction_id: "t1".to_string(),
            file: sample_file(),
            file_data: None,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("fileData"));

        let resp = SessionResponse::ShowOutput(ShowOutputData {
            transaction_id: "t1".to_string(),
            file: sample_file(),
            file_data: Some(b"hello".to_vec()),
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""fileData":"aGVsbG8=""#));
        let parsed: SessionResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            SessionResponse::ShowOutput(data) => {
                assert_eq!(data.file_data.as_deref(), Some(&b"hello"[..]));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_response_roundtrip() {
        let resp = SessionResponse::Error(ErrorData {
            transaction_id: None,
            error: SessionError::FailedToConnectToCompute,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("failedToConnectToCompute"));
        let parsed: SessionResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn compute_status_format() {
        let resp = SessionResponse::ComputeStatus(ComputeStatusData {
            state: ComputeState::InitialHostSearch,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"computeStatus","state":"initialHostSearch"}"#);
    }

    #[test]
    fn terminal_states() {
        assert!(ComputeState::Unusable.is_terminal());
        assert!(ComputeState::FailedToConnect.is_terminal());
        assert!(!ComputeState::Loading.is_terminal());
    }
}
