//! Name Resolver (§4.B): resolves a human-readable agent name to its
//! endpoint, capabilities, price table, and wallet address via the external
//! name service's text/address records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::Address;
use dashmap::DashMap;
use serde::Deserialize;
use url::Url;

use crate::error::AgentPayError;
use crate::types::AgentName;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Resolved name-service records for one agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAgent {
    pub endpoint: Url,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub prices: serde_json::Value,
    pub address: Address,
}

#[derive(Clone)]
struct CacheEntry {
    value: ResolvedAgent,
    fetched_at: Instant,
}

/// Looks up the four `agentpay.*` text records and the canonical address
/// record for a name, caching results in memory with a short TTL.
pub struct NameResolver {
    http: reqwest::Client,
    base_url: Url,
    cache: Arc<DashMap<AgentName, CacheEntry>>,
}

impl NameResolver {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Resolves `name` to its endpoint, capabilities, price table, and address.
    ///
    /// # Errors
    /// [`AgentPayError::NameNotFound`] if the name isn't registered;
    /// [`AgentPayError::RecordMissing`] if a required record is absent from an
    /// otherwise-found registration.
    pub async fn resolve(&self, name: &AgentName) -> Result<ResolvedAgent, AgentPayError> {
        if let Some(entry) = self.cache.get(name) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return Ok(entry.value.clone());
            }
        }

        let url = self
            .base_url
            .join(&format!("names/{}", name.0))
            .map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))?;
        let response = self.http.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentPayError::NameNotFound(name.0.clone()));
        }
        let response = response.error_for_status()?;
        let record: PartialRecord = response.json().await?;
        let resolved = record.into_resolved(name)?;

        self.cache.insert(
            name.clone(),
            CacheEntry {
                value: resolved.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(resolved)
    }
}

/// Wire shape of the raw record set before required-field validation, so a
/// record missing one field can be distinguished from a name that doesn't
/// resolve at all.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialRecord {
    #[serde(rename = "agentpay.endpoint")]
    endpoint: Option<Url>,
    #[serde(rename = "agentpay.capabilities", default)]
    capabilities: Vec<String>,
    #[serde(rename = "agentpay.prices", default)]
    prices: serde_json::Value,
    address: Option<Address>,
}

impl PartialRecord {
    fn into_resolved(self, name: &AgentName) -> Result<ResolvedAgent, AgentPayError> {
        let endpoint = self.endpoint.ok_or_else(|| AgentPayError::RecordMissing {
            name: name.0.clone(),
            record: "agentpay.endpoint",
        })?;
        let address = self.address.ok_or_else(|| AgentPayError::RecordMissing {
            name: name.0.clone(),
            record: "address",
        })?;
        Ok(ResolvedAgent {
            endpoint,
            capabilities: self.capabilities,
            prices: self.prices,
            address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoint_is_distinguishable_from_missing_address() {
        let name = AgentName("alice.eth".into());
        let record = PartialRecord {
            endpoint: None,
            capabilities: vec![],
            prices: serde_json::Value::Null,
            address: Some(Address::ZERO),
        };
        let err = record.into_resolved(&name).unwrap_err();
        assert!(matches!(
            err,
            AgentPayError::RecordMissing { record: "agentpay.endpoint", .. }
        ));
    }
}
