//! Accounts - tenant-owned logical identities on a surface
//!
//! An account may wrap one or more credentials (a ChatGPT login, an API
//! organization). Checkouts reserve one concurrency slot until checkin or
//! expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::credential::CredentialRef;

/// Operational status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Invalid,
    Expired,
}

/// A tenant-scoped logical identity for one surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub surface_id: String,
    pub tenant_id: String,
    /// Login identifier (email, org id, phone number).
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub credentials: Vec<CredentialRef>,
    pub status: AccountStatus,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        surface_id: impl Into<String>,
        tenant_id: impl Into<String>,
        identifier: impl Into<String>,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            surface_id: surface_id.into(),
            tenant_id: tenant_id.into(),
            identifier: identifier.into(),
            name: name.into(),
            credentials: Vec::new(),
            status: AccountStatus::Active,
            enabled: true,
            max_concurrent: None,
            cooldown_seconds: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Mutable usage counters for an account, owned by the account manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountUsage {
    pub account_id: String,
    pub request_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub active_sessions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ends_at: Option<DateTime<Utc>>,
}

/// A reservation of one concurrency slot on an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCheckout {
    pub id: String,
    pub account_id: String,
    pub checked_out_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AccountCheckout {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Parameters of a checkout request.
#[derive(Debug, Clone, Default)]
pub struct CheckoutRequest {
    pub surface_id: String,
    pub tenant_id: String,
    pub pool_id: Option<String>,
    pub prefer: Vec<String>,
    pub exclude: Vec<String>,
    pub session_duration_secs: Option<u64>,
    pub purpose: Option<String>,
    pub session_id: Option<String>,
}

impl CheckoutRequest {
    pub fn new(surface_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }
}

/// A labeled subset of accounts for one surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPool {
    pub id: String,
    pub name: String,
    pub surface_id: String,
    pub account_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_expiry_uses_supplied_clock() {
        let now = Utc::now();
        let checkout = AccountCheckout {
            id: "c1".to_string(),
            account_id: "a1".to_string(),
            checked_out_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            purpose: None,
            session_id: None,
        };
        assert!(!checkout.is_expired(now));
        assert!(!checkout.is_expired(now + chrono::Duration::seconds(60)));
        assert!(checkout.is_expired(now + chrono::Duration::seconds(61)));
    }
}
