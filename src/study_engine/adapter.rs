//! Surface adapter contract
//!
//! Adapters are the external collaborators that actually talk to ChatGPT,
//! Google, Amazon and friends. The engine only sees this trait: metadata,
//! one query execution entry point, and session control. Adapter errors use
//! the shared taxonomy so retry classification works uniformly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::credential::Credential;
use crate::domain::error::EngineError;
use crate::domain::job::JobResult;
use crate::domain::manifest::EvidenceLevel;
use crate::domain::proxy::ProxyConfig;

/// Broad adapter family; drives auth and session expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceCategory {
    Api,
    WebChatbot,
    Search,
}

/// Everything an adapter needs to execute one query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub session_id: String,
    pub proxy: Option<ProxyConfig>,
    pub account_id: Option<String>,
    pub credential: Option<Credential>,
    pub timeout_ms: u64,
    pub evidence_level: EvidenceLevel,
}

/// Session health as reported by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub valid: bool,
    pub authenticated: bool,
    pub rate_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SessionStatus {
    pub fn healthy() -> Self {
        Self {
            valid: true,
            authenticated: true,
            rate_limited: false,
            cooldown_ms: None,
            warnings: Vec::new(),
        }
    }
}

/// One target AI system (API, web chatbot or search engine).
#[async_trait]
pub trait SurfaceAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn category(&self) -> SurfaceCategory;

    fn requires_auth(&self) -> bool {
        true
    }

    fn supports_anonymous(&self) -> bool {
        false
    }

    fn supports_geo_targeting(&self) -> bool {
        true
    }

    /// Execute one query. Errors must carry a taxonomy code.
    async fn execute_query(
        &self,
        text: &str,
        context: &QueryContext,
    ) -> Result<JobResult, EngineError>;

    async fn validate_session(&self) -> SessionStatus {
        SessionStatus::healthy()
    }

    async fn reset_session(&self) {}
}

/// Lookup table of adapters by surface id.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SurfaceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SurfaceAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, surface_id: &str) -> Option<Arc<dyn SurfaceAdapter>> {
        self.adapters.get(surface_id).cloned()
    }

    pub fn surface_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, surface_id: &str) -> bool {
        self.adapters.contains_key(surface_id)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("surfaces", &self.surface_ids())
            .finish()
    }
}
