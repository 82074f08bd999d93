//! Proxy providers - pluggable sources of proxy endpoints
//!
//! The manager is agnostic to provider wire formats; providers translate a
//! `(location, options)` request into a concrete [`ProxyConfig`]. The
//! residential provider demonstrates the gateway-username convention
//! `{apiKey}-country-{cc}[-state-{s}][-city-{c}][-session-{m}][-sessid-{id}]`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::proxy::{ProxyConfig, ProxyProtocol, ProxyType};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no provider supports location '{0}'")]
    NoProviderForLocation(String),
    #[error("no proxy available for location '{0}'")]
    NoProxyAvailable(String),
    #[error("proxy pool {0} not found")]
    PoolNotFound(String),
    #[error("proxy pool {0} is below its healthy minimum")]
    PoolUnhealthy(String),
    #[error("provider '{provider}' rejected the request: {message}")]
    Provider { provider: String, message: String },
}

/// Options accompanying a proxy request.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequestOptions {
    pub proxy_type: Option<ProxyType>,
    /// Sticky session length in minutes. 0 = rotating.
    pub session_duration_minutes: Option<u32>,
    /// Session identifier to pin the gateway exit, when supported.
    pub session_id: Option<String>,
}

/// A source of proxies the manager can resolve locations against.
#[async_trait]
pub trait ProxyProvider: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    async fn get_proxy_config(
        &self,
        location_id: &str,
        options: &ProxyRequestOptions,
    ) -> Result<ProxyConfig, ProxyError>;

    /// Cheap credential sanity check; providers without one return true.
    async fn validate_credentials(&self) -> Result<bool, ProxyError> {
        Ok(true)
    }

    fn get_available_locations(&self) -> Vec<String>;

    fn supports_location(&self, location_id: &str) -> bool {
        self.get_available_locations()
            .iter()
            .any(|l| l == location_id)
    }

    fn cost_per_gb(&self) -> f64;
}

/// Geographic targeting data for one location of a gateway provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayLocation {
    pub location_id: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// Residential gateway provider: one host:port, targeting encoded in the
/// username.
#[derive(Debug)]
pub struct ResidentialApiProvider {
    id: String,
    api_key: String,
    host: String,
    port: u16,
    protocol: ProxyProtocol,
    cost_per_gb: f64,
    /// Provider-side cap on sticky session minutes.
    max_session_minutes: u32,
    locations: HashMap<String, GatewayLocation>,
}

impl ResidentialApiProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        api_key: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cost_per_gb: f64,
        max_session_minutes: u32,
        locations: Vec<GatewayLocation>,
    ) -> Self {
        Self {
            id: id.into(),
            api_key: api_key.into(),
            host: host.into(),
            port,
            protocol: ProxyProtocol::Http,
            cost_per_gb,
            max_session_minutes,
            locations: locations
                .into_iter()
                .map(|l| (l.location_id.clone(), l))
                .collect(),
        }
    }

    /// Gateway username: `{apiKey}-country-{cc}` plus optional state, city,
    /// session length (minutes, capped) and session id segments.
    fn build_username(&self, location: &GatewayLocation, options: &ProxyRequestOptions) -> String {
        let mut username = format!("{}-country-{}", self.api_key, location.country);
        if let Some(state) = &location.state {
            username.push_str(&format!("-state-{state}"));
        }
        if let Some(city) = &location.city {
            username.push_str(&format!("-city-{city}"));
        }
        let minutes = options.session_duration_minutes.unwrap_or(0);
        if minutes > 0 {
            username.push_str(&format!("-session-{}", minutes.min(self.max_session_minutes)));
            if let Some(session_id) = &options.session_id {
                username.push_str(&format!("-sessid-{session_id}"));
            }
        }
        username
    }
}

#[async_trait]
impl ProxyProvider for ResidentialApiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_proxy_config(
        &self,
        location_id: &str,
        options: &ProxyRequestOptions,
    ) -> Result<ProxyConfig, ProxyError> {
        let location = self
            .locations
            .get(location_id)
            .ok_or_else(|| ProxyError::NoProxyAvailable(location_id.to_string()))?;

        let username = self.build_username(location, options);
        // One logical proxy identity per (gateway, username); health tracking
        // keys off it.
        let id = format!("{}:{}", self.id, username);

        Ok(ProxyConfig {
            id,
            proxy_type: ProxyType::Residential,
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            username: Some(username),
            password: Some(self.api_key.clone()),
            locations: vec![location_id.to_string()],
            cost_per_gb: self.cost_per_gb,
            enabled: true,
            metadata: HashMap::from([("provider".to_string(), self.id.clone())]),
        })
    }

    async fn validate_credentials(&self) -> Result<bool, ProxyError> {
        Ok(!self.api_key.is_empty())
    }

    fn get_available_locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self.locations.keys().cloned().collect();
        locations.sort();
        locations
    }

    fn cost_per_gb(&self) -> f64 {
        self.cost_per_gb
    }
}

/// Fixed inventory provider (datacenter lists, test fleets).
#[derive(Debug)]
pub struct StaticListProvider {
    id: String,
    proxies: Vec<ProxyConfig>,
    cost_per_gb: f64,
    cursor: std::sync::atomic::AtomicUsize,
}

impl StaticListProvider {
    pub fn new(id: impl Into<String>, proxies: Vec<ProxyConfig>, cost_per_gb: f64) -> Self {
        Self {
            id: id.into(),
            proxies,
            cost_per_gb,
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn proxies(&self) -> &[ProxyConfig] {
        &self.proxies
    }
}

#[async_trait]
impl ProxyProvider for StaticListProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_proxy_config(
        &self,
        location_id: &str,
        _options: &ProxyRequestOptions,
    ) -> Result<ProxyConfig, ProxyError> {
        let eligible: Vec<&ProxyConfig> = self
            .proxies
            .iter()
            .filter(|p| p.enabled && p.supports_location(location_id))
            .collect();
        if eligible.is_empty() {
            return Err(ProxyError::NoProxyAvailable(location_id.to_string()));
        }
        let cursor = self
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(eligible[cursor % eligible.len()].clone())
    }

    fn get_available_locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self
            .proxies
            .iter()
            .flat_map(|p| p.locations.iter().cloned())
            .collect();
        locations.sort();
        locations.dedup();
        locations
    }

    fn cost_per_gb(&self) -> f64 {
        self.cost_per_gb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ResidentialApiProvider {
        ResidentialApiProvider::new(
            "resi-one",
            "apikey123",
            "gw.resi.example",
            8000,
            4.0,
            30,
            vec![
                GatewayLocation {
                    location_id: "us-tx-austin".to_string(),
                    country: "us".to_string(),
                    state: Some("tx".to_string()),
                    city: Some("austin".to_string()),
                },
                GatewayLocation {
                    location_id: "de".to_string(),
                    country: "de".to_string(),
                    state: None,
                    city: None,
                },
            ],
        )
    }

    #[tokio::test]
    async fn username_encodes_geo_and_session_segments() {
        let provider = provider();
        let options = ProxyRequestOptions {
            proxy_type: None,
            session_duration_minutes: Some(10),
            session_id: Some("abc123".to_string()),
        };
        let config = provider
            .get_proxy_config("us-tx-austin", &options)
            .await
            .unwrap();
        assert_eq!(
            config.username.as_deref(),
            Some("apikey123-country-us-state-tx-city-austin-session-10-sessid-abc123")
        );
        assert_eq!(config.host, "gw.resi.example");
    }

    #[tokio::test]
    async fn zero_session_duration_means_rotating() {
        let provider = provider();
        let config = provider
            .get_proxy_config("de", &ProxyRequestOptions::default())
            .await
            .unwrap();
        assert_eq!(config.username.as_deref(), Some("apikey123-country-de"));
    }

    #[tokio::test]
    async fn session_minutes_cap_at_provider_max() {
        let provider = provider();
        let options = ProxyRequestOptions {
            session_duration_minutes: Some(500),
            ..ProxyRequestOptions::default()
        };
        let config = provider.get_proxy_config("de", &options).await.unwrap();
        assert_eq!(
            config.username.as_deref(),
            Some("apikey123-country-de-session-30")
        );
    }

    #[tokio::test]
    async fn static_list_round_robins_per_location() {
        let mk = |id: &str, loc: &str| ProxyConfig {
            id: id.to_string(),
            proxy_type: ProxyType::Datacenter,
            protocol: ProxyProtocol::Http,
            host: format!("{id}.dc.example"),
            port: 3128,
            username: None,
            password: None,
            locations: vec![loc.to_string()],
            cost_per_gb: 0.5,
            enabled: true,
            metadata: HashMap::new(),
        };
        let provider = StaticListProvider::new(
            "dc",
            vec![mk("p1", "us"), mk("p2", "us"), mk("p3", "de")],
            0.5,
        );

        let first = provider
            .get_proxy_config("us", &ProxyRequestOptions::default())
            .await
            .unwrap();
        let second = provider
            .get_proxy_config("us", &ProxyRequestOptions::default())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        assert!(provider
            .get_proxy_config("jp", &ProxyRequestOptions::default())
            .await
            .is_err());
        assert_eq!(provider.get_available_locations(), vec!["de", "us"]);
    }
}
