//! Credentials - authenticators for a surface
//!
//! A credential is a tagged sum type: shared base fields plus a
//! payload determined by the `type` discriminator. "Active" always means
//! `is_active && (expires_at == None || expires_at > now)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminator for the credential payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    BearerToken,
    SessionCookie,
    OauthToken,
    UsernamePassword,
}

impl CredentialType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::BearerToken => "bearer_token",
            Self::SessionCookie => "session_cookie",
            Self::OauthToken => "oauth_token",
            Self::UsernamePassword => "username_password",
        }
    }
}

/// Fields shared by every credential variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialBase {
    pub id: String,
    pub surface_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// One HTTP cookie of a session-cookie credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieEntry {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// A surface authenticator. Tagged union with discriminator field `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey {
        #[serde(flatten)]
        base: CredentialBase,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        organization: Option<String>,
    },
    BearerToken {
        #[serde(flatten)]
        base: CredentialBase,
        token: String,
    },
    SessionCookie {
        #[serde(flatten)]
        base: CredentialBase,
        cookies: Vec<CookieEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },
    OauthToken {
        #[serde(flatten)]
        base: CredentialBase,
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    UsernamePassword {
        #[serde(flatten)]
        base: CredentialBase,
        username: String,
        password: String,
    },
}

impl Credential {
    pub fn base(&self) -> &CredentialBase {
        match self {
            Self::ApiKey { base, .. }
            | Self::BearerToken { base, .. }
            | Self::SessionCookie { base, .. }
            | Self::OauthToken { base, .. }
            | Self::UsernamePassword { base, .. } => base,
        }
    }

    pub fn base_mut(&mut self) -> &mut CredentialBase {
        match self {
            Self::ApiKey { base, .. }
            | Self::BearerToken { base, .. }
            | Self::SessionCookie { base, .. }
            | Self::OauthToken { base, .. }
            | Self::UsernamePassword { base, .. } => base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn surface_id(&self) -> &str {
        &self.base().surface_id
    }

    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::ApiKey { .. } => CredentialType::ApiKey,
            Self::BearerToken { .. } => CredentialType::BearerToken,
            Self::SessionCookie { .. } => CredentialType::SessionCookie,
            Self::OauthToken { .. } => CredentialType::OauthToken,
            Self::UsernamePassword { .. } => CredentialType::UsernamePassword,
        }
    }

    /// Active means the flag is set and the expiry, if any, is in the future.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let base = self.base();
        base.is_active && base.expires_at.is_none_or(|exp| exp > now)
    }

    /// Build an API-key credential, the most common variant.
    pub fn api_key(
        surface_id: impl Into<String>,
        key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::ApiKey {
            base: CredentialBase {
                id: uuid::Uuid::new_v4().to_string(),
                surface_id: surface_id.into(),
                created_at: now,
                expires_at: None,
                is_active: true,
            },
            key: key.into(),
            organization: None,
        }
    }
}

/// Weak reference from an account to a credential it wraps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRef {
    pub credential_id: String,
    pub credential_type: CredentialType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_union_round_trips_with_type_discriminator() {
        let now = Utc::now();
        let credential = Credential::api_key("openai-api", "sk-test", now);
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["type"], "api_key");
        assert_eq!(json["surface_id"], "openai-api");

        let parsed: Credential = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.credential_type(), CredentialType::ApiKey);
        assert_eq!(parsed.surface_id(), "openai-api");
    }

    #[test]
    fn activity_combines_flag_and_expiry() {
        let now = Utc::now();
        let mut credential = Credential::api_key("s", "k", now);
        assert!(credential.is_active_at(now));

        credential.base_mut().expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!credential.is_active_at(now));

        credential.base_mut().expires_at = Some(now + chrono::Duration::hours(1));
        assert!(credential.is_active_at(now));

        credential.base_mut().is_active = false;
        assert!(!credential.is_active_at(now));
    }
}
