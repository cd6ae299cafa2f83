//! The work-collaborator boundary: the broker only *delivers* a job payload
//! to whatever actually performs the purchased task and relays its answer
//! (§1). That collaborator — a hosting agent runtime — is explicitly an
//! external system; this module only defines the seam.

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::AgentPayError;

#[async_trait]
pub trait WorkCollaborator: Send + Sync {
    async fn run(&self, task_type: &str, input: Value) -> Result<Value, AgentPayError>;
}

/// Calls out to a local host-agent runtime endpoint to perform the task.
pub struct HttpWorkCollaborator {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpWorkCollaborator {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl WorkCollaborator for HttpWorkCollaborator {
    async fn run(&self, task_type: &str, input: Value) -> Result<Value, AgentPayError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&serde_json::json!({ "task_type": task_type, "input": input }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Returns the input unchanged under an `echo` key. Used in demos and tests
/// where no real hosting agent is wired up.
pub struct EchoWorkCollaborator;

#[async_trait]
impl WorkCollaborator for EchoWorkCollaborator {
    async fn run(&self, _task_type: &str, input: Value) -> Result<Value, AgentPayError> {
        Ok(serde_json::json!({ "echo": input }))
    }
}
