use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code reported by the compute engine in an `error` response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ComputeErrorCode(pub i32);

impl ComputeErrorCode {
    pub const UNKNOWN: ComputeErrorCode = ComputeErrorCode(101);
    pub const IMPOSSIBLE_SITUATION: ComputeErrorCode = ComputeErrorCode(102);
    pub const QUERY_FAILED: ComputeErrorCode = ComputeErrorCode(103);
    /// Raised by the broker when a compute run references a file it cannot find.
    pub const UNKNOWN_FILE: ComputeErrorCode = ComputeErrorCode(104);
}

impl std::fmt::Display for ComputeErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors reported to clients over the session protocol.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionError {
    #[error("invalid request")]
    InvalidRequest,

    #[error("permission denied")]
    PermissionDenied,

    #[error("duplicate")]
    Duplicate,

    #[error("file not found")]
    FileNotFound,

    #[error("file version mismatch")]
    FileVersionMismatch,

    #[error("database update failed")]
    DatabaseUpdateFailed,

    #[error("failed to connect to compute engine")]
    FailedToConnectToCompute,

    #[error("unknown file")]
    UnknownFile,

    #[error("unknown error")]
    Unknown,

    #[error("compute error {code}: {details}")]
    Compute {
        code: ComputeErrorCode,
        details: String,
        #[serde(default)]
        transaction_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_errors_serialize_as_strings() {
        let json = serde_json::to_string(&SessionError::FileVersionMismatch).unwrap();
        assert_eq!(json, "\"fileVersionMismatch\"");
        let parsed: SessionError = serde_json::from_str("\"permissionDenied\"").unwrap();
        assert_eq!(parsed, SessionError::PermissionDenied);
    }

    #[test]
    fn compute_error_roundtrip() {
        let err = SessionError::Compute {
            code: ComputeErrorCode::UNKNOWN_FILE,
            details: "foo.txt missing".to_string(),
            transaction_id: Some("t9".to_string()),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"transactionId\":\"t9\""));
        assert!(json.contains("\"code\":104"));
        let parsed: SessionError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }
}
