use serde::{Deserialize, Serialize};

/// Where an uploaded file landed on the agent and what it holds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub full_path: String,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub hash: String,
    pub length: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadFileCommand {
    pub remote_path: String,
    pub data: Vec<u8>,
}

impl UploadFileCommand {
    pub fn new(remote_path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            remote_path: remote_path.into(),
            data: data.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadFileRequest {
    pub remote_path: String,
}

impl DownloadFileRequest {
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
        }
    }
}
