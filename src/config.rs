//! Process-wide configuration and the [`Runtime`] value threaded through every
//! subsystem (§9 design note: no module-level globals).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use alloy_primitives::Address;
use clap::Parser;
use url::Url;

use crate::error::AgentPayError;
use crate::identity::Identity;
use crate::types::PathPreference;

/// Environment-derived configuration, recognized variables per §6.
#[derive(Parser, Debug, Clone)]
#[command(name = "agentpay")]
#[command(about = "Peer-to-peer agent payment broker")]
pub struct Config {
    /// Identity signing key (`CLIENT_PRIVATE_KEY`).
    #[arg(long, env = "CLIENT_PRIVATE_KEY")]
    pub client_private_key: String,

    /// Self-name override (`AGENTPAY_ENS_NAME`).
    #[arg(long, env = "AGENTPAY_ENS_NAME")]
    pub ens_name: String,

    /// Self-endpoint override (`AGENTPAY_ENDPOINT`).
    #[arg(long, env = "AGENTPAY_ENDPOINT")]
    pub endpoint: Url,

    /// Feed endpoint (`AGENTPAY_DEMO_FEED_URL`).
    #[arg(long, env = "AGENTPAY_DEMO_FEED_URL")]
    pub demo_feed_url: Option<Url>,

    /// `"channel"` or `"app_session"` (`AGENTPAY_PAYMENT_METHOD`).
    #[arg(long, env = "AGENTPAY_PAYMENT_METHOD", default_value = "app_session")]
    pub payment_method: String,

    /// Path to the status document (`AGENTPAY_STATUS_FILE`).
    #[arg(long, env = "AGENTPAY_STATUS_FILE")]
    pub status_file: Option<std::path::PathBuf>,

    /// Settlement-chain JSON-RPC endpoint (`RPC_URL`).
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Url,

    /// Clearing-network websocket endpoint.
    #[arg(long, env = "AGENTPAY_CLEARING_URL")]
    pub clearing_url: Url,

    /// Name-resolver HTTP endpoint.
    #[arg(long, env = "AGENTPAY_RESOLVER_URL")]
    pub resolver_url: Url,

    /// Custody contract address on the settlement chain.
    #[arg(long, env = "AGENTPAY_CUSTODY_ADDRESS")]
    pub custody_address: Address,

    /// Adjudicator contract address on the settlement chain.
    #[arg(long, env = "AGENTPAY_ADJUDICATOR_ADDRESS")]
    pub adjudicator_address: Address,

    /// Settlement-chain id (EIP-155).
    #[arg(long, env = "AGENTPAY_CHAIN_ID", default_value_t = 84532)]
    pub chain_id: u64,

    /// HTTP bind host for the worker server.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// HTTP bind port for the worker server.
    #[arg(long, env = "PORT", default_value_t = 9000)]
    pub port: u16,

    /// Maximum outstanding (awaiting-payment) jobs before `POST /job` returns 503.
    #[arg(long, env = "AGENTPAY_MAX_OPEN_JOBS", default_value_t = 64)]
    pub max_open_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_private_key: String::new(),
            ens_name: "agent.eth".to_string(),
            endpoint: Url::parse("http://127.0.0.1:9000").unwrap(),
            demo_feed_url: None,
            payment_method: "app_session".to_string(),
            status_file: None,
            rpc_url: Url::parse("http://127.0.0.1:8545").unwrap(),
            clearing_url: Url::parse("wss://127.0.0.1:8080/ws").unwrap(),
            resolver_url: Url::parse("http://127.0.0.1:8081").unwrap(),
            custody_address: Address::ZERO,
            adjudicator_address: Address::ZERO,
            chain_id: 84532,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            max_open_jobs: 64,
        }
    }
}

impl Config {
    /// Loads configuration from the environment (and `.env`, loaded first).
    ///
    /// Subcommand dispatch in `main` consumes `argv`; `Config` itself is
    /// environment-driven per spec.md §6, so this parses against an empty
    /// argument list and relies entirely on each field's `env` fallback.
    pub fn load() -> Result<Self, AgentPayError> {
        dotenvy::dotenv().ok();
        Config::try_parse_from(std::iter::once("agentpay"))
            .map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))
    }

    pub fn payment_method(&self) -> Option<PathPreference> {
        PathPreference::from_env_str(&self.payment_method)
    }
}

/// Process-wide state assembled once at startup and threaded explicitly
/// through every component — identity and config are never hidden behind
/// module-level statics (§9).
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<Config>,
    pub identity: Arc<Identity>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self, AgentPayError> {
        let identity = Identity::from_private_key(config.ens_name.clone(), &config.client_private_key)?;
        Ok(Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let config = Config::default();
        assert_eq!(config.port, 9000);
        assert_eq!(config.payment_method(), Some(PathPreference::AppSession));
    }
}
