//! Identity & Wallet (§4.A): the long-lived signing key, its derived address,
//! and ephemeral session-key generation for clearing-network authentication.

use alloy_network::EthereumWallet;
use alloy_primitives::{Address, B256, Signature};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;

use crate::error::AgentPayError;

/// The process's single long-lived identity. Holds the signing key; the key
/// itself never leaves this type — only signatures and the derived address do.
#[derive(Clone)]
pub struct Identity {
    name: String,
    signer: PrivateKeySigner,
}

impl Identity {
    /// Loads the identity key from a hex-encoded private key (`CLIENT_PRIVATE_KEY`).
    ///
    /// # Errors
    /// Returns [`AgentPayError::IdentityUnavailable`] if the key is missing or malformed.
    pub fn from_private_key(name: impl Into<String>, raw: &str) -> Result<Self, AgentPayError> {
        let raw = raw.trim().trim_start_matches("0x");
        let bytes: B256 = raw
            .parse()
            .map_err(|e| AgentPayError::IdentityUnavailable(format!("bad private key: {e}")))?;
        let signer = PrivateKeySigner::from_bytes(&bytes)
            .map_err(|e| AgentPayError::IdentityUnavailable(format!("bad private key: {e}")))?;
        Ok(Self {
            name: name.into(),
            signer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The 20-byte account identifier derived from the public key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Signs an arbitrary byte payload with the identity key.
    pub async fn sign(&self, bytes: &[u8]) -> Result<Signature, AgentPayError> {
        self.signer
            .sign_message(bytes)
            .await
            .map_err(|e| AgentPayError::IdentityUnavailable(format!("sign failed: {e}")))
    }

    /// Signs a precomputed EIP-712 signing hash (domain + struct digest) with
    /// the identity key. Callers derive `digest` via
    /// `typed_struct.eip712_signing_hash(&domain)` so this type stays agnostic
    /// of any one typed-data schema.
    pub async fn eip712_sign(&self, digest: B256) -> Result<Signature, AgentPayError> {
        self.signer
            .sign_hash(&digest)
            .await
            .map_err(|e| AgentPayError::IdentityUnavailable(format!("eip712 sign failed: {e}")))
    }

    /// Generates a fresh signing key scoped to a single clearing-network
    /// authentication. The returned signer is never persisted.
    pub fn ephemeral_keypair(&self) -> (PrivateKeySigner, Address) {
        let signer = PrivateKeySigner::random();
        let addr = signer.address();
        (signer, addr)
    }

    /// An `alloy` wallet wrapping the identity key, for submitting transactions
    /// through the settlement-chain client.
    pub fn as_wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> &'static str {
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
    }

    #[test]
    fn loads_identity_and_derives_address() {
        let id = Identity::from_private_key("alice.eth", test_key()).unwrap();
        assert_eq!(id.name(), "alice.eth");
        assert_ne!(id.address(), Address::ZERO);
    }

    #[test]
    fn rejects_malformed_key() {
        let err = Identity::from_private_key("alice.eth", "not-a-key").unwrap_err();
        assert!(matches!(err, AgentPayError::IdentityUnavailable(_)));
    }

    #[test]
    fn ephemeral_keys_are_distinct_each_call() {
        let id = Identity::from_private_key("alice.eth", test_key()).unwrap();
        let (_, a1) = id.ephemeral_keypair();
        let (_, a2) = id.ephemeral_keypair();
        assert_ne!(a1, a2);
    }
}
