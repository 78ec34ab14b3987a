//! HTTP client for the Inkforge API

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use inkforge_core::{ParamType, WorkflowMetadata};

/// Client-side error with enough structure to pick an exit code
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with an error body
    #[error("{code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The server could not be reached
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body was not what we expected
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Map onto the CLI exit-code contract
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Api { code, .. } if code == "InvalidParams" || code == "InvalidRequest" => 2,
            Self::Api { code, .. } if code == "UnknownWorkflow" => 3,
            Self::Api { status, .. } if *status == 404 => 1,
            Self::Api { status, .. } if *status == 409 => 2,
            Self::Api { .. } | Self::Transport(_) | Self::Decode(_) => 4,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    pub status: String,
    pub current_step: Option<String>,
    pub progress: u8,
    pub workflow_type: String,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultRow {
    pub result_type: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResultResponse {
    pub task_id: Uuid,
    pub results: Vec<ResultRow>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// One declared workflow parameter, as served by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowDetail {
    pub metadata: WorkflowMetadata,
    pub params: Vec<ParamInfo>,
}

/// Thin reqwest wrapper
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn create_task(&self, body: Value) -> Result<CreateTaskResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/v1/tasks", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskStatusResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/tasks/{task_id}", self.base_url))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    pub async fn get_task_result(
        &self,
        task_id: Uuid,
    ) -> Result<TaskResultResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/tasks/{task_id}/result", self.base_url))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<CancelResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/v1/tasks/{task_id}/cancel", self.base_url))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowMetadata>, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/workflows", self.base_url))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    pub async fn get_workflow(&self, workflow_type: &str) -> Result<WorkflowDetail, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/workflows/{workflow_type}", self.base_url))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if (200..300).contains(&status) {
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
        } else {
            let body: ErrorBody = serde_json::from_slice(&bytes).unwrap_or(ErrorBody {
                error: format!("Http{status}"),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
            Err(ClientError::Api {
                status,
                code: body.error,
                message: body.message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16, code: &str) -> ClientError {
        ClientError::Api {
            status,
            code: code.to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn test_exit_code_contract() {
        assert_eq!(api_error(400, "InvalidParams").exit_code(), 2);
        assert_eq!(api_error(404, "UnknownWorkflow").exit_code(), 3);
        assert_eq!(api_error(404, "NotFound").exit_code(), 1);
        assert_eq!(api_error(409, "NotReady").exit_code(), 2);
        assert_eq!(api_error(500, "StorageError").exit_code(), 4);
        assert_eq!(
            ClientError::Transport("refused".into()).exit_code(),
            4
        );
    }
}
