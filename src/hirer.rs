//! Client Hirer (§4.H): drives the 402 handshake from the paying side —
//! submit, observe the bill, pay it, resubmit with proof.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::Runtime;
use crate::error::AgentPayError;
use crate::payments::orchestrator;
use crate::resolver::NameResolver;
use crate::types::{AgentName, Bill, JobId, PathPreference, PaymentProof};

const INITIAL_POST_TIMEOUT: Duration = Duration::from_secs(30);
const PAID_POST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<&'a JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_data: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_proof: Option<&'a PaymentProof>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequiredBody {
    job_id: JobId,
    bill: Bill,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobAccepted {
    #[serde(default)]
    job_id: Option<JobId>,
    result: Value,
    #[serde(default)]
    status: String,
}

/// Hires a named worker for one task and returns its result, driving the
/// full 402 handshake and payment internally (§4.H).
pub struct Hirer {
    http: reqwest::Client,
    runtime: Runtime,
    resolver: NameResolver,
}

impl Hirer {
    pub fn new(runtime: Runtime, resolver_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            runtime,
            resolver: NameResolver::new(resolver_url),
        }
    }

    /// Resolves `worker_name`, submits `task_type`/`input_data`, pays the
    /// quoted bill over `path_preference`, and returns the collaborator's
    /// result (§4.H steps 1-6).
    pub async fn hire(
        &self,
        worker_name: &AgentName,
        task_type: &str,
        input_data: Value,
        path_preference: PathPreference,
    ) -> Result<Value, AgentPayError> {
        let agent = self.resolver.resolve(worker_name).await?;

        let first = self
            .post_job(
                &agent.endpoint,
                &JobRequest {
                    job_id: None,
                    task_type: Some(task_type),
                    input_data: Some(&input_data),
                    payment_proof: None,
                },
                INITIAL_POST_TIMEOUT,
            )
            .await?;

        let mut bill = match first {
            PostOutcome::Accepted(accepted) => return Ok(accepted.result),
            PostOutcome::PaymentRequired(body) => body,
        };

        loop {
            let proof = orchestrator::pay(&self.runtime, &bill.bill, agent.address, path_preference).await?;

            let retried = self
                .post_job(
                    &agent.endpoint,
                    &JobRequest {
                        job_id: Some(&bill.job_id),
                        task_type: None,
                        input_data: None,
                        payment_proof: Some(&proof),
                    },
                    PAID_POST_TIMEOUT,
                )
                .await?;

            match retried {
                PostOutcome::Accepted(accepted) => return Ok(accepted.result),
                PostOutcome::PaymentRequired(fresh) if fresh.reason == "bill_expired" => {
                    tracing::warn!(job_id = %fresh.job_id.0, "bill expired mid-payment, retrying with fresh bill");
                    bill = fresh;
                    continue;
                }
                PostOutcome::PaymentRequired(rejected) => {
                    return Err(AgentPayError::PaymentVerificationFailed(format!(
                        "worker rejected proof for job {}: {}",
                        rejected.job_id.0, rejected.reason
                    )));
                }
            }
        }
    }

    async fn post_job(
        &self,
        endpoint: &Url,
        body: &JobRequest<'_>,
        timeout: Duration,
    ) -> Result<PostOutcome, AgentPayError> {
        let response = self
            .http
            .post(endpoint.join("job").unwrap_or_else(|_| endpoint.clone()))
            .json(body)
            .timeout(timeout)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::PAYMENT_REQUIRED {
            let body: PaymentRequiredBody = response.json().await?;
            return Ok(PostOutcome::PaymentRequired(body));
        }
        let response = response.error_for_status()?;
        let accepted: JobAccepted = response.json().await?;
        Ok(PostOutcome::Accepted(accepted))
    }
}

enum PostOutcome {
    Accepted(JobAccepted),
    PaymentRequired(PaymentRequiredBody),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_request_omits_absent_fields() {
        let job_id = JobId("abc".to_string());
        let request = JobRequest {
            job_id: Some(&job_id),
            task_type: None,
            input_data: None,
            payment_proof: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jobId"], "abc");
        assert!(value.get("taskType").is_none());
    }
}
