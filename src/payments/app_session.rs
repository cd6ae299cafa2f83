//! App-Session Path (§4.E): bilateral off-chain state updates with 1- or
//! 2-party quorum, settled by closing the session.

use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::Address;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::clearing::ClearingClient;
use crate::error::AgentPayError;
use crate::timestamp::UnixTimestamp;

/// Per-participant, per-asset balances (§3's data model): outer key is the
/// participant address, inner key the asset.
pub type Allocation = HashMap<Address, HashMap<String, u128>>;

/// Builds the allocation both sides of a hire must submit byte-for-byte
/// identically: `amount` of `asset` credited to `worker`, debited from
/// `client` (§4.E). Both the paying orchestrator and the co-signing worker
/// call this from the same `(client, worker, asset, amount)` inputs so
/// neither ever transmits the allocation map to the other directly.
pub fn build_allocations(client: Address, worker: Address, asset: &str, amount: u128) -> Allocation {
    let mut allocations = Allocation::new();
    allocations.insert(client, HashMap::from([(asset.to_string(), 0u128)]));
    allocations.insert(worker, HashMap::from([(asset.to_string(), amount)]));
    allocations
}

#[derive(Debug, Clone)]
pub struct AppSession {
    pub app_session_id: String,
    pub participants: (Address, Address),
    pub quorum: u8,
    pub version: u64,
}

#[derive(Debug, Deserialize)]
struct CreateAppSessionResponse {
    app_session_id: String,
    version: u64,
}

/// Creates a bilateral session with zero initial allocations (§4.E).
///
/// `nonce` must be unique per session; callers pass `unix_seconds` from a
/// monotonically-advancing clock (or a random value) to satisfy that.
pub async fn create_session(
    clearing: &ClearingClient,
    application: &str,
    protocol_version: u8,
    client: Address,
    worker: Address,
    quorum: u8,
    challenge_duration: u64,
    nonce: u64,
) -> Result<AppSession, AgentPayError> {
    let definition = json!({
        "application": application,
        "protocol_version": protocol_version,
        "participants": [client, worker],
        "weights": [1, 1],
        "quorum": quorum,
        "challenge_duration": challenge_duration,
        "nonce": nonce,
    });
    let response = clearing
        .call("create_app_session", json!({ "definition": definition }))
        .await?;
    let parsed: CreateAppSessionResponse = serde_json::from_value(response)
        .map_err(|e| AgentPayError::ClearingProtocol(format!("create_app_session response malformed: {e}")))?;
    Ok(AppSession {
        app_session_id: parsed.app_session_id,
        participants: (client, worker),
        quorum,
        version: parsed.version,
    })
}

/// Outcome of submitting a state update against a `quorum=2` session (§4.C,
/// §4.E). `PartiallySigned` is not a failure: the caller's own signature was
/// accepted and it is waiting for the counterparty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    PartiallySigned,
}

/// Submits a state transition. `version` must equal `current + 1` (§3, §8).
pub async fn submit_state(
    clearing: &ClearingClient,
    app_session_id: &str,
    version: u64,
    allocations: &Allocation,
) -> Result<SubmitOutcome, AgentPayError> {
    let payload = json!({
        "app_session_id": app_session_id,
        "intent": "operate",
        "version": version,
        "allocations": allocations,
    });
    match clearing.call("submit_app_state", payload).await {
        Ok(_) => Ok(SubmitOutcome::Accepted),
        Err(AgentPayError::QuorumPending) => Ok(SubmitOutcome::PartiallySigned),
        Err(other) => Err(other),
    }
}

/// Drives the two-party quorum coordination described in §4.E/§9: both
/// participants compute the identical `(version, allocations)` from shared
/// inputs and each submits independently. Whichever arrives second observes
/// the success frame; the first observes `PartiallySigned` and this function
/// waits (via `asu` notifications, falling back to a short poll) for the
/// counterparty's signature to land.
pub async fn submit_state_awaiting_quorum(
    clearing: &ClearingClient,
    app_session_id: &str,
    version: u64,
    allocations: &Allocation,
    grace_period: Duration,
) -> Result<SubmitOutcome, AgentPayError> {
    let outcome = submit_state(clearing, app_session_id, version, allocations).await?;
    if outcome == SubmitOutcome::Accepted {
        return Ok(SubmitOutcome::Accepted);
    }

    let mut notifications = clearing.subscribe();
    let deadline = tokio::time::Instant::now() + grace_period;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, notifications.recv()).await {
            Ok(Ok(notification)) if notification.kind == crate::clearing::frames::NotificationKind::AppSessionUpdate => {
                if notification_matches(&notification.payload, app_session_id, version) {
                    return Ok(SubmitOutcome::Accepted);
                }
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    // Fallback: the clearing server sometimes omits an acknowledgement after
    // a two-party update; poll session status directly (§9 open question).
    if session_version_at_least(clearing, app_session_id, version).await? {
        Ok(SubmitOutcome::Accepted)
    } else {
        Ok(SubmitOutcome::PartiallySigned)
    }
}

fn notification_matches(payload: &Value, app_session_id: &str, version: u64) -> bool {
    payload.get("app_session_id").and_then(Value::as_str) == Some(app_session_id)
        && payload.get("version").and_then(Value::as_u64) == Some(version)
}

#[derive(Debug, Deserialize)]
struct AppSessionSummary {
    app_session_id: String,
    version: u64,
    status: String,
}

async fn session_version_at_least(
    clearing: &ClearingClient,
    app_session_id: &str,
    version: u64,
) -> Result<bool, AgentPayError> {
    let response = clearing.call("get_app_sessions", json!({})).await?;
    let sessions: Vec<AppSessionSummary> = serde_json::from_value(
        response.get("app_sessions").cloned().unwrap_or(Value::Array(vec![])),
    )
    .unwrap_or_default();
    Ok(sessions
        .iter()
        .any(|s| s.app_session_id == app_session_id && s.version >= version))
}

/// Closes the session, allocating all funds back to participants (§4.E,
/// §3's conservation invariant). For `quorum=2`, both sides send the same
/// payload; a `quorum not reached` on either leg means "my signature
/// accepted, waiting."
pub async fn close_session(
    clearing: &ClearingClient,
    app_session_id: &str,
    final_allocations: &Allocation,
) -> Result<SubmitOutcome, AgentPayError> {
    let payload = json!({
        "app_session_id": app_session_id,
        "allocations": final_allocations,
    });
    match clearing.call("close_app_session", payload).await {
        Ok(_) => Ok(SubmitOutcome::Accepted),
        Err(AgentPayError::QuorumPending) => Ok(SubmitOutcome::PartiallySigned),
        Err(other) => Err(other),
    }
}

/// Confirms a session has fully closed, per the polling fallback in §4.E.
pub async fn confirm_closed(clearing: &ClearingClient, app_session_id: &str) -> Result<bool, AgentPayError> {
    let response = clearing.call("get_app_sessions", json!({})).await?;
    let sessions: Vec<AppSessionSummary> = serde_json::from_value(
        response.get("app_sessions").cloned().unwrap_or(Value::Array(vec![])),
    )
    .unwrap_or_default();
    Ok(sessions
        .iter()
        .any(|s| s.app_session_id == app_session_id && s.status == "closed"))
}

/// Verifies that a given session version credits at least `amount` of
/// `asset` to `recipient` (§4.G: how the worker checks an `app_session_state`
/// proof without trusting the client's claim).
pub async fn confirm_session_credits(
    clearing: &ClearingClient,
    app_session_id: &str,
    version: u64,
    recipient: Address,
    asset: &str,
    amount: u128,
) -> Result<bool, AgentPayError> {
    let response = clearing
        .call(
            "get_app_session_state",
            json!({ "app_session_id": app_session_id }),
        )
        .await?;
    let observed_version = response.get("version").and_then(Value::as_u64);
    if observed_version != Some(version) {
        return Ok(false);
    }
    let recipient_hex = format!("{recipient:#x}");
    let credited = response
        .get("allocations")
        .and_then(|allocations| allocations.get(&recipient_hex))
        .and_then(|per_asset| per_asset.get(asset))
        .and_then(Value::as_u64)
        .map(u128::from)
        .unwrap_or(0);
    Ok(credited >= amount)
}

/// Checks the conservation invariant (§3): sum of allocations is unchanged
/// across every participant and asset.
pub fn conserves_allocations(initial: &Allocation, final_allocations: &Allocation) -> bool {
    let sum = |a: &Allocation| -> u128 { a.values().flat_map(|per_asset| per_asset.values()).sum() };
    sum(initial) == sum(final_allocations)
}

pub fn unix_nonce() -> u64 {
    UnixTimestamp::try_now().map(|t| t.seconds_since_epoch()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_holds_for_equal_sums() {
        let client = Address::repeat_byte(0x11);
        let worker = Address::repeat_byte(0x22);
        let initial = build_allocations(client, worker, "ytest.usd", 1_000_000);
        let final_allocations = build_allocations(client, worker, "ytest.usd", 1_000_000);
        assert!(conserves_allocations(&initial, &final_allocations));
    }

    #[test]
    fn conservation_fails_when_sums_diverge() {
        let client = Address::repeat_byte(0x11);
        let worker = Address::repeat_byte(0x22);
        let initial = build_allocations(client, worker, "ytest.usd", 1_000_000);
        let final_allocations = build_allocations(client, worker, "ytest.usd", 900_000);
        assert!(!conserves_allocations(&initial, &final_allocations));
    }

    #[test]
    fn build_allocations_splits_by_participant() {
        let client = Address::repeat_byte(0x11);
        let worker = Address::repeat_byte(0x22);
        let allocations = build_allocations(client, worker, "ytest.usd", 1_000_000);
        assert_eq!(allocations[&client]["ytest.usd"], 0);
        assert_eq!(allocations[&worker]["ytest.usd"], 1_000_000);
    }

    #[test]
    fn notification_match_requires_both_id_and_version() {
        let payload = json!({ "app_session_id": "0xSID", "version": 2 });
        assert!(notification_matches(&payload, "0xSID", 2));
        assert!(!notification_matches(&payload, "0xSID", 3));
        assert!(!notification_matches(&payload, "0xOTHER", 2));
    }
}
