//! API-key authentication and webhook-secret verification. Keys are parsed
//! from the live config on each request so a PATCH takes effect
//! immediately.

use crate::config::Config;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// 401: no X-API-Key header.
    MissingKey,
    /// 403: unknown key.
    InvalidKey,
    /// 403: key valid but not admin.
    AdminRequired,
    /// 401: webhook secret configured but header absent.
    MissingSecret,
    /// 403: wrong webhook secret.
    InvalidSecret,
}

impl AuthError {
    pub fn message(&self) -> &'static str {
        match self {
            AuthError::MissingKey => "API key required. Provide X-API-Key header.",
            AuthError::InvalidKey => "Invalid API key",
            AuthError::AdminRequired => "Admin access required",
            AuthError::MissingSecret => "Webhook secret required",
            AuthError::InvalidSecret => "Invalid webhook secret",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            AuthError::MissingKey | AuthError::MissingSecret => 401,
            _ => 403,
        }
    }
}

pub struct ApiKeyAuth {
    keys: HashMap<String, Role>,
    require_auth: bool,
    webhook_secret: Option<String>,
}

impl ApiKeyAuth {
    /// Parse `key1,key2` or `admin:key1,readonly:key2` entries; entries
    /// without a role prefix default to admin.
    pub fn from_config(config: &Config) -> Self {
        let mut keys = HashMap::new();
        for entry in config.api_keys.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((role, key)) => {
                    let role = match role.trim() {
                        "admin" => Role::Admin,
                        "readonly" => Role::ReadOnly,
                        other => {
                            warn!("Unknown API key role '{other}', treating as readonly");
                            Role::ReadOnly
                        }
                    };
                    keys.insert(key.trim().to_string(), role);
                }
                None => {
                    keys.insert(entry.to_string(), Role::Admin);
                }
            }
        }

        if config.require_api_auth && keys.is_empty() {
            warn!("API authentication required but no keys configured! Set API_KEYS.");
        }

        Self {
            keys,
            require_auth: config.require_api_auth,
            webhook_secret: if config.webhook_secret.is_empty() {
                None
            } else {
                Some(config.webhook_secret.clone())
            },
        }
    }

    /// Resolve the caller's role. With auth disabled everyone is admin.
    pub fn authenticate(&self, api_key: Option<&str>) -> Result<Role, AuthError> {
        if !self.require_auth {
            return Ok(Role::Admin);
        }
        let key = api_key.ok_or(AuthError::MissingKey)?;
        match self.keys.get(key) {
            Some(role) => Ok(*role),
            None => {
                let prefix: String = key.chars().take(8).collect();
                warn!("Invalid API key attempt: {prefix}...");
                Err(AuthError::InvalidKey)
            }
        }
    }

    pub fn require_admin(&self, api_key: Option<&str>) -> Result<Role, AuthError> {
        let role = self.authenticate(api_key)?;
        if role != Role::Admin {
            return Err(AuthError::AdminRequired);
        }
        Ok(role)
    }

    /// No configured secret means the webhook is open.
    pub fn verify_webhook_secret(&self, header: Option<&str>) -> Result<(), AuthError> {
        let Some(ref secret) = self.webhook_secret else {
            return Ok(());
        };
        match header {
            None => Err(AuthError::MissingSecret),
            Some(value) if value == secret => Ok(()),
            Some(_) => {
                warn!("Invalid webhook secret attempt");
                Err(AuthError::InvalidSecret)
            }
        }
    }
}
