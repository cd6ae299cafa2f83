//! Settlement-chain client (§4.D, §6): submits the custody-contract calls the
//! clearing server hands back as unsigned calldata, and reads receipts/balances
//! to confirm channel state. Custody and adjudicator addresses are fixed
//! configuration, not a per-network registry — this system settles against a
//! single chain (§6), unlike the teacher's multi-network facilitator.

use std::sync::Arc;

use alloy_network::EthereumWallet;
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_provider::fillers::{ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller};
use alloy_provider::Identity as ProviderIdentity;
use alloy_rpc_client::RpcClient;
use alloy_sol_types::sol;
use url::Url;

use crate::error::AgentPayError;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface ICustody {
        function createChannel(bytes calldata initialState, bytes calldata serverSignature) external returns (bytes32 channelId);
        function closeChannel(bytes32 channelId, bytes calldata finalState, bytes calldata serverSignature) external;
        function channelBalance(bytes32 channelId, address asset) external view returns (uint256);

        event Transferred(address indexed asset, address indexed to, uint256 amount);
    }
}

type InnerFiller = JoinFill<GasFiller, JoinFill<NonceFiller, ChainIdFiller>>;
type InnerProvider = FillProvider<JoinFill<JoinFill<ProviderIdentity, InnerFiller>, WalletFiller<EthereumWallet>>, RootProvider>;

/// Thin wrapper around an Alloy Ethereum provider bound to the fixed
/// settlement chain and custody/adjudicator addresses.
#[derive(Clone)]
pub struct SettlementChainClient {
    provider: Arc<InnerProvider>,
    custody: Address,
    #[allow(dead_code)] // read via `adjudicator()`; no calls route through it yet
    adjudicator: Address,
    chain_id: u64,
}

impl SettlementChainClient {
    pub async fn connect(
        rpc_url: &Url,
        wallet: EthereumWallet,
        custody: Address,
        adjudicator: Address,
        chain_id: u64,
    ) -> Result<Self, AgentPayError> {
        let client = RpcClient::builder()
            .connect(rpc_url.as_str())
            .await
            .map_err(|e| AgentPayError::OnChainFailed(format!("rpc connect failed: {e}")))?;
        let filler = InnerFiller::default();
        let provider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);
        Ok(Self {
            provider: Arc::new(provider),
            custody,
            adjudicator,
            chain_id,
        })
    }

    pub fn adjudicator(&self) -> Address {
        self.adjudicator
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Submits the server-countersigned initial channel state on-chain and
    /// awaits the receipt (§4.D step 1).
    pub async fn create_channel(
        &self,
        initial_state: Bytes,
        server_signature: Bytes,
    ) -> Result<(B256, B256), AgentPayError> {
        let contract = ICustody::new(self.custody, &*self.provider);
        let pending = contract
            .createChannel(initial_state, server_signature)
            .send()
            .await
            .map_err(|e| AgentPayError::OnChainFailed(format!("createChannel failed: {e}")))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| AgentPayError::OnChainFailed(format!("createChannel receipt failed: {e}")))?;
        let channel_id = receipt
            .logs()
            .first()
            .map(|log| B256::from_slice(log.topics().get(1).map(|t| t.as_slice()).unwrap_or(&[0u8; 32])))
            .unwrap_or(B256::ZERO);
        Ok((channel_id, receipt.transaction_hash))
    }

    /// Submits the server-countersigned final channel state on-chain and
    /// returns the settling transaction hash — the channel-path payment proof
    /// reference (§4.D step 3).
    pub async fn close_channel(
        &self,
        channel_id: B256,
        final_state: Bytes,
        server_signature: Bytes,
    ) -> Result<B256, AgentPayError> {
        let contract = ICustody::new(self.custody, &*self.provider);
        let pending = contract
            .closeChannel(channel_id, final_state, server_signature)
            .send()
            .await
            .map_err(|e| AgentPayError::OnChainFailed(format!("closeChannel failed: {e}")))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| AgentPayError::OnChainFailed(format!("closeChannel receipt failed: {e}")))?;
        Ok(receipt.transaction_hash)
    }

    /// Reads the channel's on-chain balance for `asset`. The channel path
    /// requires this to be zero before a unified-balance transfer (§4.D).
    pub async fn channel_balance(&self, channel_id: B256, asset: Address) -> Result<U256, AgentPayError> {
        let contract = ICustody::new(self.custody, &*self.provider);
        contract
            .channelBalance(channel_id, asset)
            .call()
            .await
            .map_err(|e| AgentPayError::OnChainFailed(format!("channelBalance call failed: {e}")))
    }

    /// Confirms a transaction receipt shows a transfer of at least `amount`
    /// to `expected_recipient` (used by the worker to verify a
    /// `channel_close` proof without calling back to the client).
    pub async fn confirm_transfer_receipt(
        &self,
        tx_hash: B256,
        expected_recipient: Address,
        amount: u128,
    ) -> Result<bool, AgentPayError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| AgentPayError::OnChainFailed(format!("receipt lookup failed: {e}")))?
            .ok_or_else(|| AgentPayError::OnChainFailed(format!("no receipt for {tx_hash}")))?;
        if !receipt.status() {
            return Ok(false);
        }
        let required = U256::from(amount);
        let credited = receipt.logs().iter().any(|log| {
            let Ok(decoded) = log.log_decode::<ICustody::Transferred>() else {
                return false;
            };
            decoded.data.to == expected_recipient && decoded.data.amount >= required
        });
        Ok(credited)
    }
}
