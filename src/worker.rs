//! Worker Server (§4.G): the HTTP side of the 402 handshake. Quotes bills,
//! verifies proofs, invokes the work collaborator, and returns idempotent
//! results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::chain::SettlementChainClient;
use crate::clearing::ClearingClient;
use crate::config::Runtime;
use crate::error::AgentPayError;
use crate::status::{StatusSink, WorkerState};
use crate::timestamp::UnixTimestamp;
use crate::types::{Bill, JobId, PaymentProof};
use crate::work::WorkCollaborator;

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    AwaitingPayment,
    Completed,
}

#[derive(Debug, Clone)]
struct JobRecord {
    task_type: String,
    input_data: Value,
    bill: Bill,
    state: JobState,
    accepted_proof: Option<PaymentProof>,
    result: Option<Value>,
}

/// Axum-shared state for the worker server. Holds the in-memory job table
/// (guarded per-entry by `DashMap`'s shard locks — transitions are atomic,
/// §5) plus the collaborators the protocol calls out to.
pub struct WorkerApp {
    runtime: Runtime,
    jobs: DashMap<JobId, JobRecord>,
    collaborator: Arc<dyn WorkCollaborator>,
    status: Arc<dyn StatusSink>,
    price_table: DashMap<String, (u128, String)>,
    default_price: (u128, String),
    started_at: Instant,
}

impl WorkerApp {
    pub fn new(
        runtime: Runtime,
        collaborator: Arc<dyn WorkCollaborator>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            runtime,
            jobs: DashMap::new(),
            collaborator,
            status,
            price_table: DashMap::new(),
            default_price: (1_000_000, "ytest.usd".to_string()),
            started_at: Instant::now(),
        }
    }

    pub fn with_price(self, task_type: impl Into<String>, amount: u128, asset: impl Into<String>) -> Self {
        self.price_table.insert(task_type.into(), (amount, asset.into()));
        self
    }

    fn price_for(&self, task_type: &str) -> (u128, String) {
        self.price_table
            .get(task_type)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| self.default_price.clone())
    }

    fn open_job_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.state == JobState::AwaitingPayment)
            .count()
    }
}

pub fn routes(app: Arc<WorkerApp>) -> Router {
    Router::new()
        .route("/job", post(post_job))
        .route("/health", get(get_health))
        .with_state(app)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest {
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    input_data: Option<Value>,
    #[serde(default)]
    job_id: Option<JobId>,
    #[serde(default)]
    payment_proof: Option<PaymentProof>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobAccepted {
    job_id: JobId,
    result: Value,
    status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequired {
    job_id: JobId,
    bill: Bill,
    reason: &'static str,
}

enum WorkerError {
    BadRequest(String),
    NotFound,
    ProofMismatch,
    Overloaded,
    PaymentRequired(PaymentRequired),
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        match self {
            WorkerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            WorkerError::NotFound => (StatusCode::NOT_FOUND, "unknown job_id").into_response(),
            WorkerError::ProofMismatch => {
                (StatusCode::CONFLICT, "a different proof was already accepted for this job").into_response()
            }
            WorkerError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "too many outstanding jobs").into_response(),
            WorkerError::PaymentRequired(body) => (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response(),
        }
    }
}

#[instrument(skip_all)]
async fn get_health(State(app): State<Arc<WorkerApp>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "address": app.runtime.identity.address(),
        "open_jobs": app.open_job_count(),
        "uptime_seconds": app.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[instrument(skip_all, fields(job_id))]
async fn post_job(
    State(app): State<Arc<WorkerApp>>,
    Json(body): Json<JobRequest>,
) -> Result<Response, WorkerError> {
    if let Some(job_id) = body.job_id.clone() {
        tracing::Span::current().record("job_id", job_id.0.as_str());
        return handle_existing_job(&app, job_id, body.payment_proof).await;
    }
    handle_new_job(&app, body).await
}

async fn handle_new_job(app: &Arc<WorkerApp>, body: JobRequest) -> Result<Response, WorkerError> {
    let task_type = body
        .task_type
        .ok_or_else(|| WorkerError::BadRequest("task_type is required".to_string()))?;
    let input_data = body
        .input_data
        .ok_or_else(|| WorkerError::BadRequest("input_data is required".to_string()))?;

    if app.open_job_count() >= app.runtime.config.max_open_jobs {
        return Err(WorkerError::Overloaded);
    }

    let job_id = JobId::generate();
    let (amount, asset) = app.price_for(&task_type);
    let now = UnixTimestamp::try_now().map_err(|e| WorkerError::BadRequest(e.to_string()))?;
    let bill = Bill {
        job_id: job_id.clone(),
        worker_address: app.runtime.identity.address(),
        amount,
        asset,
        expires_at: now + 300,
        notes: None,
    };

    app.jobs.insert(
        job_id.clone(),
        JobRecord {
            task_type,
            input_data,
            bill: bill.clone(),
            state: JobState::AwaitingPayment,
            accepted_proof: None,
            result: None,
        },
    );
    app.status.publish(WorkerState::Offered);

    Ok(WorkerError::PaymentRequired(PaymentRequired {
        job_id,
        bill,
        reason: "payment_required",
    })
    .into_response())
}

async fn handle_existing_job(
    app: &Arc<WorkerApp>,
    job_id: JobId,
    payment_proof: Option<PaymentProof>,
) -> Result<Response, WorkerError> {
    let Some(mut record) = app.jobs.get_mut(&job_id) else {
        return Err(WorkerError::NotFound);
    };

    if record.state == JobState::Completed {
        return match (&record.accepted_proof, &payment_proof) {
            (Some(accepted), Some(submitted)) if accepted == submitted => Ok(Json(JobAccepted {
                job_id,
                result: record.result.clone().unwrap_or(Value::Null),
                status: "completed",
            })
            .into_response()),
            (Some(_), None) => Ok(Json(JobAccepted {
                job_id,
                result: record.result.clone().unwrap_or(Value::Null),
                status: "completed",
            })
            .into_response()),
            _ => Err(WorkerError::ProofMismatch),
        };
    }

    let Some(proof) = payment_proof else {
        return Ok(WorkerError::PaymentRequired(PaymentRequired {
            job_id,
            bill: record.bill.clone(),
            reason: "payment_required",
        })
        .into_response());
    };

    let now = UnixTimestamp::try_now().map_err(|e| WorkerError::BadRequest(e.to_string()))?;
    if record.bill.is_expired(now) {
        let (amount, asset) = app.price_for(&record.task_type);
        let fresh_bill = Bill {
            job_id: job_id.clone(),
            worker_address: app.runtime.identity.address(),
            amount,
            asset,
            expires_at: now + 300,
            notes: None,
        };
        record.bill = fresh_bill.clone();
        return Ok(WorkerError::PaymentRequired(PaymentRequired {
            job_id,
            bill: fresh_bill,
            reason: "bill_expired",
        })
        .into_response());
    }

    drop(record);
    let verified = verify_proof(app, &job_id, &proof).await;
    let Some(mut record) = app.jobs.get_mut(&job_id) else {
        return Err(WorkerError::NotFound);
    };

    match verified {
        Ok(true) => {
            app.status.publish(WorkerState::Working);
            let result = app
                .collaborator
                .run(&record.task_type, record.input_data.clone())
                .await
                .map_err(|e| WorkerError::BadRequest(e.to_string()))?;
            record.state = JobState::Completed;
            record.accepted_proof = Some(proof);
            record.result = Some(result.clone());
            app.status.publish(WorkerState::Completed);
            Ok(Json(JobAccepted {
                job_id,
                result,
                status: "completed",
            })
            .into_response())
        }
        Ok(false) | Err(_) => Ok(WorkerError::PaymentRequired(PaymentRequired {
            job_id,
            bill: record.bill.clone(),
            reason: "payment_verification_failed",
        })
        .into_response()),
    }
}

/// Verifies a proof against its bill without calling back to the client
/// (§3, §4.G): for `channel_close`, confirms the settlement-chain receipt;
/// for `app_session_state`, asks the clearing network for the session.
async fn verify_proof(app: &Arc<WorkerApp>, job_id: &JobId, proof: &PaymentProof) -> Result<bool, AgentPayError> {
    let Some(record) = app.jobs.get(job_id) else {
        return Ok(false);
    };
    let bill = record.bill.clone();
    drop(record);

    if proof.amount() < bill.amount || proof.worker_address() != bill.worker_address {
        return Ok(false);
    }

    match proof {
        PaymentProof::ChannelClose { reference, .. } => {
            let tx_hash = reference
                .parse()
                .map_err(|_| AgentPayError::PaymentVerificationFailed("malformed tx hash".to_string()))?;
            let chain = SettlementChainClient::connect(
                &app.runtime.config.rpc_url,
                app.runtime.identity.as_wallet(),
                app.runtime.config.custody_address,
                app.runtime.config.adjudicator_address,
                app.runtime.config.chain_id,
            )
            .await?;
            chain
                .confirm_transfer_receipt(tx_hash, bill.worker_address, bill.amount)
                .await
        }
        PaymentProof::AppSessionState { client_address, .. } => {
            let Some((session_id, version)) = proof.session_reference() else {
                return Ok(false);
            };
            let expires_at = UnixTimestamp::try_now()?.seconds_since_epoch() + 3600;
            let clearing = ClearingClient::connect(
                &app.runtime.config.clearing_url,
                &app.runtime.identity,
                "agentpay-verify",
                serde_json::json!({}),
                expires_at,
                "verify",
            )
            .await?;

            // Co-sign the client's already-submitted state (§4.E): the
            // client submits before this proof ever reaches the worker, so
            // this is always the quorum-completing second signature.
            let allocations = crate::payments::app_session::build_allocations(
                *client_address,
                bill.worker_address,
                &bill.asset,
                bill.amount,
            );
            crate::payments::app_session::submit_state_awaiting_quorum(
                &clearing,
                session_id,
                version,
                &allocations,
                Duration::from_secs(5),
            )
            .await?;

            let confirmed = crate::payments::app_session::confirm_session_credits(
                &clearing,
                session_id,
                version,
                bill.worker_address,
                &bill.asset,
                bill.amount,
            )
            .await;

            // Best-effort: the close race is tracked separately (§9), and a
            // lone `quorum not reached` here doesn't undo the credit already
            // confirmed above.
            let _ = crate::payments::app_session::close_session(&clearing, session_id, &allocations).await;
            clearing.close().await?;
            confirmed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_accepted_serializes_with_camel_case_job_id() {
        let body = JobAccepted {
            job_id: JobId("abc".to_string()),
            result: Value::Null,
            status: "completed",
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["jobId"], "abc");
    }
}
