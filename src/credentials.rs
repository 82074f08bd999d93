//! Credential pooling - selection strategies, cooldowns, health

pub mod pool;
pub mod pool_manager;

pub use pool::{
    CredentialPool, CredentialPoolConfig, CredentialUsage, PoolEvent, PoolHealth, PoolStats,
    SelectionStrategy,
};
pub use pool_manager::CredentialPoolManager;
