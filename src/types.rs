//! Shared wire and domain types for the broker: identity addresses, bills,
//! payment proofs, and session records (§3 of the protocol design).

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timestamp::UnixTimestamp;

/// 20-byte account identifier derived from a public key.
pub type AgentAddress = Address;

/// A human-readable name bound to an [`AgentAddress`] via the name service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(pub String);

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque job identifier, generated by the worker on first `POST /job`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let bytes: [u8; 16] = rng.random();
        JobId(hex::encode(bytes))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker-issued quote referencing a job. Immutable once emitted (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    pub job_id: JobId,
    pub worker_address: AgentAddress,
    pub amount: u128,
    pub asset: String,
    pub expires_at: UnixTimestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Bill {
    /// `true` once `now` is at or past `expires_at` (spec.md §8 boundary case).
    pub fn is_expired(&self, now: UnixTimestamp) -> bool {
        now >= self.expires_at
    }
}

/// Evidence that funds have reached the worker. Verifiable without a callback
/// to the client (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PaymentProof {
    #[serde(rename = "channel_close")]
    ChannelClose {
        /// Transaction hash on the settlement chain.
        reference: String,
        amount: u128,
        worker_address: AgentAddress,
    },
    #[serde(rename = "app_session_state")]
    AppSessionState {
        /// `session:<id>:version:<n>`
        reference: String,
        amount: u128,
        worker_address: AgentAddress,
        /// The paying participant's address, so the worker can rebuild the
        /// identical per-participant allocation map and co-sign the same
        /// state (§4.E's two-party quorum: both sides compute the payload
        /// from shared inputs rather than exchanging it directly).
        client_address: AgentAddress,
    },
}

impl PaymentProof {
    pub fn amount(&self) -> u128 {
        match self {
            PaymentProof::ChannelClose { amount, .. } => *amount,
            PaymentProof::AppSessionState { amount, .. } => *amount,
        }
    }

    pub fn worker_address(&self) -> AgentAddress {
        match self {
            PaymentProof::ChannelClose { worker_address, .. } => *worker_address,
            PaymentProof::AppSessionState { worker_address, .. } => *worker_address,
        }
    }

    /// Parse a `session:<id>:version:<n>` reference, if this is an app-session proof.
    pub fn session_reference(&self) -> Option<(&str, u64)> {
        let PaymentProof::AppSessionState { reference, .. } = self else {
            return None;
        };
        let rest = reference.strip_prefix("session:")?;
        let (id, rest) = rest.split_once(":version:")?;
        let version = rest.parse().ok()?;
        Some((id, version))
    }
}

/// Status of a channel or app session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

/// Preferred settlement path for a hire, made explicit input per spec.md §9
/// (the source left the choice implicit behind an environment variable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathPreference {
    Channel,
    AppSession,
}

impl PathPreference {
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s {
            "channel" => Some(PathPreference::Channel),
            "app_session" | "yellow" => Some(PathPreference::AppSession),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bill_expiry_boundary_is_inclusive() {
        let bill = Bill {
            job_id: JobId("j1".into()),
            worker_address: Address::ZERO,
            amount: 1,
            asset: "ytest.usd".into(),
            expires_at: UnixTimestamp(100),
            notes: None,
        };
        assert!(!bill.is_expired(UnixTimestamp(99)));
        assert!(bill.is_expired(UnixTimestamp(100)));
        assert!(bill.is_expired(UnixTimestamp(101)));
    }

    #[test]
    fn app_session_reference_round_trips() {
        let proof = PaymentProof::AppSessionState {
            reference: "session:0xSID:version:2".to_string(),
            amount: 1_000_000,
            worker_address: Address::ZERO,
            client_address: Address::ZERO,
        };
        assert_eq!(proof.session_reference(), Some(("0xSID", 2)));
    }

    #[test]
    fn path_preference_recognises_yellow_alias() {
        assert_eq!(
            PathPreference::from_env_str("yellow"),
            Some(PathPreference::AppSession)
        );
        assert_eq!(PathPreference::from_env_str("bogus"), None);
    }
}
