//! Payment Orchestrator (§4.F): chooses a path, drives it to completion,
//! and emits a [`PaymentProof`].

use std::time::Duration;

use alloy_primitives::{Address, U256};
use serde_json::json;
use tokio::time::sleep;

use crate::chain::SettlementChainClient;
use crate::clearing::ClearingClient;
use crate::config::Runtime;
use crate::error::AgentPayError;
use crate::payments::{app_session, channel};
use crate::types::{Bill, PathPreference, PaymentProof};

const RETRY_BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(4)];

/// Drives a bill to a verifiable [`PaymentProof`] over the chosen path,
/// retrying transient failures up to twice with exponential backoff (§4.F
/// step 3, §7 policy).
pub async fn pay(
    runtime: &Runtime,
    bill: &Bill,
    worker_address: Address,
    path_preference: PathPreference,
) -> Result<PaymentProof, AgentPayError> {
    let mut attempt = 0;
    loop {
        let result = match path_preference {
            PathPreference::Channel => pay_via_channel(runtime, bill, worker_address).await,
            PathPreference::AppSession => pay_via_app_session(runtime, bill, worker_address).await,
        };
        match result {
            Ok(proof) => return Ok(proof),
            Err(e) if e.is_transient() && attempt < RETRY_BACKOFFS.len() => {
                tracing::warn!(error = %e, attempt, "payment step failed, retrying");
                sleep(RETRY_BACKOFFS[attempt]).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn pay_via_channel(
    runtime: &Runtime,
    bill: &Bill,
    worker_address: Address,
) -> Result<PaymentProof, AgentPayError> {
    let clearing = connect_clearing(runtime, "agentpay-channel").await?;
    let chain = connect_chain(runtime).await?;

    let asset_token = Address::ZERO; // resolved from `bill.asset` by a token registry out of scope here
    let ch = channel::ensure_channel(&clearing, &chain, runtime.config.chain_id, asset_token).await?;
    channel::transfer(
        &clearing,
        &chain,
        &ch,
        worker_address,
        &bill.asset,
        U256::from(bill.amount),
    )
    .await?;
    let tx_hash = channel::close(&clearing, &chain, &ch, runtime.identity.address()).await?;
    clearing.close().await?;

    Ok(PaymentProof::ChannelClose {
        reference: format!("{tx_hash:#x}"),
        amount: bill.amount,
        worker_address,
    })
}

/// Opens a `quorum=2` app session and submits the client's own signature on
/// the agreed `(version, allocations)`. This never waits for the
/// counterparty: the worker has no way to act on a session it doesn't know
/// exists yet, so the client submits once (expecting `PartiallySigned`, not
/// an error — §4.E's "my signature accepted, waiting" outcome) and hands the
/// session/version/`client_address` to the worker via the returned proof.
/// The worker completes quorum itself from that proof (src/worker.rs).
async fn pay_via_app_session(
    runtime: &Runtime,
    bill: &Bill,
    worker_address: Address,
) -> Result<PaymentProof, AgentPayError> {
    let clearing = connect_clearing(runtime, "agentpay-app-session").await?;

    let quorum = 2;
    let nonce = app_session::unix_nonce();
    let client_address = runtime.identity.address();
    let session = app_session::create_session(
        &clearing,
        "agentpay",
        1,
        client_address,
        worker_address,
        quorum,
        3600,
        nonce,
    )
    .await?;

    let next_version = session.version + 1;
    let allocations = app_session::build_allocations(client_address, worker_address, &bill.asset, bill.amount);

    app_session::submit_state(&clearing, &session.app_session_id, next_version, &allocations).await?;
    clearing.close().await?;

    Ok(PaymentProof::AppSessionState {
        reference: format!("session:{}:version:{}", session.app_session_id, next_version),
        amount: bill.amount,
        worker_address,
        client_address,
    })
}

async fn connect_clearing(runtime: &Runtime, application: &str) -> Result<ClearingClient, AgentPayError> {
    let expires_at = crate::timestamp::UnixTimestamp::try_now()?.seconds_since_epoch() + 3600;
    ClearingClient::connect(
        &runtime.config.clearing_url,
        &runtime.identity,
        application,
        json!({}),
        expires_at,
        "payments",
    )
    .await
}

async fn connect_chain(runtime: &Runtime) -> Result<SettlementChainClient, AgentPayError> {
    SettlementChainClient::connect(
        &runtime.config.rpc_url,
        runtime.identity.as_wallet(),
        runtime.config.custody_address,
        runtime.config.adjudicator_address,
        runtime.config.chain_id,
    )
    .await
}

