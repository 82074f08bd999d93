//! Account management - checkout/checkin of tenant-owned surface identities

pub mod manager;

pub use manager::{AccountError, AccountManager, AccountManagerConfig, AccountManagerStats};
