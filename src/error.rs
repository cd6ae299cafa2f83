//! Unified error taxonomy for the broker, per the error-kind table in the protocol design.
//!
//! Fatal kinds (`IdentityUnavailable`, `ConfigInvalid`) should reach the operator.
//! Transient kinds (`ClearingTimeout`, `ClearingAuthRejected`, `ClearingProtocol`)
//! are retried by [`crate::payments::orchestrator::pay`]; `QuorumPending` is
//! consumed internally and never surfaced as a failure.

use std::time::SystemTimeError;

/// Top-level error type threaded through every broker subsystem.
#[derive(Debug, thiserror::Error)]
pub enum AgentPayError {
    #[error("identity key unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("name not found: {0}")]
    NameNotFound(String),

    #[error("name record missing: {record} for {name}")]
    RecordMissing { name: String, record: &'static str },

    #[error("clearing network rejected authentication: {0}")]
    ClearingAuthRejected(String),

    #[error("clearing network call timed out: {0}")]
    ClearingTimeout(String),

    #[error("clearing network protocol violation: {0}")]
    ClearingProtocol(String),

    /// Not a failure: the orchestrator's own signature on a quorum=2 state was
    /// accepted and it is waiting for the counterparty. Consumed internally by
    /// [`crate::payments::app_session`]; never surfaced past the orchestrator.
    #[error("quorum not yet reached, waiting for counterparty")]
    QuorumPending,

    #[error("payment verification failed: {0}")]
    PaymentVerificationFailed(String),

    #[error("bill expired at {expires_at}")]
    BillExpired { expires_at: u64 },

    #[error("on-chain operation failed: {0}")]
    OnChainFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket transport error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system clock error: {0}")]
    Clock(#[from] SystemTimeError),
}

impl AgentPayError {
    /// Whether the orchestrator should retry this error (spec.md §7 policy).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentPayError::ClearingTimeout(_)
                | AgentPayError::ClearingAuthRejected(_)
                | AgentPayError::OnChainFailed(_)
        )
    }
}
