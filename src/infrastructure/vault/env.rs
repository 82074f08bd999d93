//! Environment-variable vault back-end (read-only)
//!
//! Credentials are enumerated from two sources:
//! 1. the naming convention `{PREFIX}_{SURFACE}_{TYPE}_{FIELD}`
//!    (e.g. `BENTHAM_CRED_OPENAI_API_API_KEY_KEY`), and
//! 2. a mapping table of well-known variables (`OPENAI_API_KEY`, ...).
//!
//! Entries missing a required field are skipped silently - an operator with
//! half-set variables gets fewer credentials, not a crash.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::domain::credential::{CookieEntry, Credential, CredentialBase, CredentialType};
use crate::infrastructure::vault::{CredentialVault, VaultError};
use crate::utils::SharedClock;

pub const DEFAULT_ENV_PREFIX: &str = "BENTHAM_CRED";

/// Well-known variables mapped to `(surface_id, type, field)`.
static WELL_KNOWN: Lazy<HashMap<&'static str, (&'static str, CredentialType, &'static str)>> =
    Lazy::new(|| {
        HashMap::from([
            ("OPENAI_API_KEY", ("openai-api", CredentialType::ApiKey, "KEY")),
            ("ANTHROPIC_API_KEY", ("anthropic-api", CredentialType::ApiKey, "KEY")),
            ("GOOGLE_API_KEY", ("google-search", CredentialType::ApiKey, "KEY")),
            ("PERPLEXITY_API_KEY", ("perplexity-api", CredentialType::ApiKey, "KEY")),
            ("BING_API_KEY", ("bing-search", CredentialType::ApiKey, "KEY")),
        ])
    });

/// Type tokens as they appear inside variable names, longest first so
/// `SESSION_COOKIE` wins over a surface that happens to end in `SESSION`.
const TYPE_TOKENS: &[(&str, CredentialType)] = &[
    ("USERNAME_PASSWORD", CredentialType::UsernamePassword),
    ("SESSION_COOKIE", CredentialType::SessionCookie),
    ("BEARER_TOKEN", CredentialType::BearerToken),
    ("OAUTH_TOKEN", CredentialType::OauthToken),
    ("API_KEY", CredentialType::ApiKey),
];

#[derive(Debug)]
pub struct EnvVault {
    credentials: Vec<Credential>,
    clock: SharedClock,
}

impl EnvVault {
    /// Scan the process environment with the default prefix.
    pub fn from_env(clock: SharedClock) -> Self {
        Self::from_env_with_prefix(DEFAULT_ENV_PREFIX, clock)
    }

    pub fn from_env_with_prefix(prefix: &str, clock: SharedClock) -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(prefix, &vars, clock)
    }

    /// Build from an explicit variable map (tests, container bootstrap).
    pub fn from_vars(
        prefix: &str,
        vars: &HashMap<String, String>,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        let mut credentials = Vec::new();

        credentials.extend(well_known_credentials(vars, now));
        credentials.extend(convention_credentials(prefix, vars, now));

        debug!(count = credentials.len(), "environment vault loaded");
        Self { credentials, clock }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

fn well_known_credentials(
    vars: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Vec<Credential> {
    let mut out = Vec::new();
    for (var, (surface_id, credential_type, field)) in WELL_KNOWN.iter() {
        let Some(value) = vars.get(*var).filter(|v| !v.is_empty()) else {
            continue;
        };
        let fields = HashMap::from([(field.to_string(), value.clone())]);
        if let Some(credential) =
            build_credential(surface_id, *credential_type, &fields, now, &format!("env-{}", var.to_lowercase()))
        {
            out.push(credential);
        }
    }
    out
}

fn convention_credentials(
    prefix: &str,
    vars: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Vec<Credential> {
    // Group FIELD values per (surface, type).
    let mut grouped: HashMap<(String, CredentialType), HashMap<String, String>> = HashMap::new();
    let prefix_us = format!("{prefix}_");

    for (name, value) in vars {
        let Some(rest) = name.strip_prefix(&prefix_us) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let Some((surface, credential_type, field)) = split_convention_name(rest) else {
            debug!(var = %name, "skipping env var that does not match the credential convention");
            continue;
        };
        grouped
            .entry((surface, credential_type))
            .or_default()
            .insert(field, value.clone());
    }

    let mut out = Vec::new();
    for ((surface, credential_type), fields) in grouped {
        let id = format!("env-{}-{}", surface, credential_type.as_str());
        match build_credential(&surface, credential_type, &fields, now, &id) {
            Some(credential) => out.push(credential),
            None => debug!(
                surface = %surface,
                credential_type = credential_type.as_str(),
                "skipping incomplete env credential"
            ),
        }
    }
    out.sort_by(|a, b| a.id().cmp(b.id()));
    out
}

/// Split `SURFACE_TYPE_FIELD` by locating a known type token. The surface
/// part keeps its own underscores (rendered as dashes in the surface id).
fn split_convention_name(rest: &str) -> Option<(String, CredentialType, String)> {
    for (token, credential_type) in TYPE_TOKENS {
        let marker = format!("_{token}_");
        if let Some(pos) = rest.find(&marker) {
            let surface = rest[..pos].to_lowercase().replace('_', "-");
            let field = rest[pos + marker.len()..].to_string();
            if surface.is_empty() || field.is_empty() {
                return None;
            }
            return Some((surface, *credential_type, field));
        }
    }
    None
}

fn build_credential(
    surface_id: &str,
    credential_type: CredentialType,
    fields: &HashMap<String, String>,
    now: DateTime<Utc>,
    id: &str,
) -> Option<Credential> {
    let base = CredentialBase {
        id: id.to_string(),
        surface_id: surface_id.to_string(),
        created_at: now,
        expires_at: None,
        is_active: true,
    };

    match credential_type {
        CredentialType::ApiKey => Some(Credential::ApiKey {
            base,
            key: fields.get("KEY")?.clone(),
            organization: fields.get("ORG").cloned(),
        }),
        CredentialType::BearerToken => Some(Credential::BearerToken {
            base,
            token: fields.get("TOKEN")?.clone(),
        }),
        CredentialType::OauthToken => Some(Credential::OauthToken {
            base,
            access_token: fields.get("ACCESS")?.clone(),
            refresh_token: fields.get("REFRESH").cloned(),
            scope: fields.get("SCOPE").cloned(),
        }),
        CredentialType::UsernamePassword => Some(Credential::UsernamePassword {
            base,
            username: fields.get("USERNAME")?.clone(),
            password: fields.get("PASSWORD")?.clone(),
        }),
        CredentialType::SessionCookie => {
            // COOKIES holds a JSON array of {name, value, domain?}.
            let raw = fields.get("COOKIES")?;
            let cookies: Vec<CookieEntry> = serde_json::from_str(raw).ok()?;
            Some(Credential::SessionCookie {
                base,
                cookies,
                user_agent: fields.get("USER_AGENT").cloned(),
            })
        }
    }
}

#[async_trait]
impl CredentialVault for EnvVault {
    async fn store(&self, _credential: Credential) -> Result<(), VaultError> {
        Err(VaultError::ReadOnly)
    }

    async fn update(&self, _credential: Credential) -> Result<(), VaultError> {
        Err(VaultError::ReadOnly)
    }

    async fn delete(&self, _credential_id: &str) -> Result<bool, VaultError> {
        Err(VaultError::ReadOnly)
    }

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, VaultError> {
        Ok(self
            .credentials
            .iter()
            .find(|c| c.id() == credential_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Credential>, VaultError> {
        Ok(self.credentials.clone())
    }

    async fn get_active_by_surface(&self, surface_id: &str) -> Result<Vec<Credential>, VaultError> {
        let now = self.clock.now();
        Ok(self
            .credentials
            .iter()
            .filter(|c| c.surface_id() == surface_id && c.is_active_at(now))
            .cloned()
            .collect())
    }
}
