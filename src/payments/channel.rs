//! Channel Path (§4.D): on-chain create, off-chain unified-balance transfer,
//! on-chain close.

use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes, U256};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::chain::SettlementChainClient;
use crate::clearing::ClearingClient;
use crate::error::AgentPayError;

/// A payment channel between this identity and the clearing network.
#[derive(Debug, Clone)]
pub struct Channel {
    pub channel_id: B256,
    pub chain_id: u64,
    pub asset_token: Address,
    pub status: ChannelStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Open,
    Closed,
}

#[derive(Debug, Deserialize)]
struct ChannelsSnapshotEntry {
    channel_id: B256,
    chain_id: u64,
    asset_token: Address,
    status: String,
}

/// Ensures an open channel exists for this identity, reusing one if the
/// unsolicited post-auth `channels` push (§4.D step 1, §6) already showed one
/// open. The push arrives once, right after authentication, so this waits a
/// short grace period rather than issuing an RPC for it.
pub async fn ensure_channel(
    clearing: &ClearingClient,
    chain: &SettlementChainClient,
    chain_id: u64,
    asset_token: Address,
) -> Result<Channel, AgentPayError> {
    let snapshot = clearing
        .wait_for_channels_snapshot(Duration::from_secs(2))
        .await;
    if let Some(snapshot) = snapshot {
        if let Some(existing) = find_open_channel(&snapshot) {
            return Ok(existing);
        }
    }
    create_channel(clearing, chain, chain_id, asset_token).await
}

fn find_open_channel(snapshot: &Value) -> Option<Channel> {
    let entries: Vec<ChannelsSnapshotEntry> = serde_json::from_value(snapshot.get("channels")?.clone()).ok()?;
    entries
        .into_iter()
        .find(|entry| entry.status == "open")
        .map(|entry| Channel {
            channel_id: entry.channel_id,
            chain_id: entry.chain_id,
            asset_token: entry.asset_token,
            status: ChannelStatus::Open,
        })
}

/// Creates a fresh channel: asks the clearing server for an unsigned initial
/// state plus its countersignature, then submits that on-chain (§4.D step 1).
pub async fn create_channel(
    clearing: &ClearingClient,
    chain: &SettlementChainClient,
    chain_id: u64,
    asset_token: Address,
) -> Result<Channel, AgentPayError> {
    let response = clearing
        .call(
            "create_channel",
            json!({ "chain_id": chain_id, "asset_token": asset_token }),
        )
        .await?;
    let initial_state: Bytes = parse_field(&response, "unsigned_initial_state")?;
    let server_signature: Bytes = parse_field(&response, "server_signature")?;

    let (channel_id, _tx_hash) = chain.create_channel(initial_state, server_signature).await?;

    Ok(Channel {
        channel_id,
        chain_id,
        asset_token,
        status: ChannelStatus::Open,
    })
}

/// Transfers `amount` of `asset` to `destination` through the unified-balance
/// abstraction. Precondition: the channel carries zero on-chain balance
/// (§4.D step 2, §8 boundary case).
pub async fn transfer(
    clearing: &ClearingClient,
    chain: &SettlementChainClient,
    channel: &Channel,
    destination: Address,
    asset: &str,
    amount: U256,
) -> Result<(), AgentPayError> {
    let on_chain_balance = chain
        .channel_balance(channel.channel_id, channel.asset_token)
        .await?;
    if !on_chain_balance.is_zero() {
        return Err(AgentPayError::OnChainFailed(
            "channel carries non-zero on-chain balance; withdraw to unified balance or use the app-session path"
                .to_string(),
        ));
    }

    clearing
        .call(
            "transfer",
            json!({
                "destination": destination,
                "allocations": [{ "asset": asset, "amount": amount.to_string() }],
            }),
        )
        .await?;
    Ok(())
}

/// Closes the channel and returns the settling transaction hash — the
/// channel-path payment proof reference (§4.D step 3).
pub async fn close(
    clearing: &ClearingClient,
    chain: &SettlementChainClient,
    channel: &Channel,
    self_address: Address,
) -> Result<B256, AgentPayError> {
    let response = clearing
        .call(
            "close_channel",
            json!({ "channel_id": channel.channel_id, "destination": self_address }),
        )
        .await?;
    let final_state: Bytes = parse_field(&response, "final_state")?;
    let server_signature: Bytes = parse_field(&response, "server_signature")?;
    chain
        .close_channel(channel.channel_id, final_state, server_signature)
        .await
}

fn parse_field<T: serde::de::DeserializeOwned>(value: &Value, field: &str) -> Result<T, AgentPayError> {
    let raw = value
        .get(field)
        .ok_or_else(|| AgentPayError::ClearingProtocol(format!("response missing field `{field}`")))?;
    serde_json::from_value(raw.clone()).map_err(|e| {
        AgentPayError::ClearingProtocol(format!("response field `{field}` malformed: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_open_channel_in_snapshot() {
        let snapshot = json!({
            "channels": [
                { "channel_id": format!("0x{}", "11".repeat(32)), "chain_id": 84532, "asset_token": format!("0x{}", "22".repeat(20)), "status": "closed" },
                { "channel_id": format!("0x{}", "33".repeat(32)), "chain_id": 84532, "asset_token": format!("0x{}", "22".repeat(20)), "status": "open" },
            ]
        });
        let found = find_open_channel(&snapshot).expect("should find the open one");
        assert_eq!(found.status, ChannelStatus::Open);
    }

    #[test]
    fn no_open_channel_when_all_closed() {
        let snapshot = json!({
            "channels": [
                { "channel_id": format!("0x{}", "11".repeat(32)), "chain_id": 84532, "asset_token": format!("0x{}", "22".repeat(20)), "status": "closed" },
            ]
        });
        assert!(find_open_channel(&snapshot).is_none());
    }
}
