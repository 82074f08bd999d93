//! Proxy management - provider-agnostic selection, sticky sessions, health

pub mod health;
pub mod manager;
pub mod pool;
pub mod provider;

pub use health::{HealthTracker, HealthTrackerConfig};
pub use manager::{ProxyLease, ProxyManager, ProxyManagerConfig, ProxyManagerStats, ProxyRequest};
pub use pool::{ProxyPool, ProxyPoolConfig, RotationStrategy};
pub use provider::{
    GatewayLocation, ProxyError, ProxyProvider, ProxyRequestOptions, ResidentialApiProvider,
    StaticListProvider,
};
