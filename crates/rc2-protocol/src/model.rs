use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type UserId = i64;
pub type ProjectId = i64;
pub type WorkspaceId = i64;
pub type FileId = i64;
pub type ImageId = i64;

/// A registered user. The password hash never leaves the data layer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub version: i32,
    pub login: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub version: i32,
    pub user_id: UserId,
    pub name: String,
}

/// The unit a session is scoped to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: WorkspaceId,
    pub version: i32,
    pub name: String,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub unique_id: String,
    pub last_access_epoch_ms: i64,
    pub date_created_epoch_ms: i64,
}

/// File metadata. Contents are fetched separately.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: FileId,
    pub version: i32,
    pub wspace_id: WorkspaceId,
    pub name: String,
    pub date_created_epoch_ms: i64,
    pub last_modified_epoch_ms: i64,
    pub file_size: u64,
}

/// An image produced by a compute run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionImage {
    pub id: ImageId,
    pub session_id: i64,
    pub batch_id: i64,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    pub date_created_epoch_ms: i64,
    #[serde(with = "crate::base64_bytes")]
    pub image_data: Vec<u8>,
}

/// Everything a client needs to render a user's projects, sent on connect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BulkUserInfo {
    pub user: User,
    pub projects: Vec<Project>,
    /// Workspaces keyed by project id.
    pub workspaces: BTreeMap<ProjectId, Vec<Workspace>>,
    /// Files keyed by workspace id.
    pub files: BTreeMap<WorkspaceId, Vec<File>>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_info_keys_survive_json() {
        let user = User {
            id: 101,
            version: 1,
            login: "test".to_string(),
            first_name: None,
            last_name: None,
            email: "test@rc2.io".to_string(),
            is_admin: false,
            is_enabled: true,
        };
        let wspace = Workspace {
            id: 7,
            version: 1,
            name: "w".to_string(),
            user_id: 101,
            project_id: 3,
            unique_id: "abc".to_string(),
            last_access_epoch_ms: 0,
            date_created_epoch_ms: 0,
        };
        let info = BulkUserInfo {
            user,
            projects: vec![],
            workspaces: BTreeMap::from([(3, vec![wspace])]),
            files: BTreeMap::new(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"3\":["));
        let parsed: BulkUserInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn user_defaults_enabled() {
        let json = r#"{"id":1,"version":1,"login":"a","email":"a@b.c"}"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert!(user.is_enabled);
        assert!(!user.is_admin);
    }
}
