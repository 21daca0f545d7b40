//! Authorization of identified connections.
//!
//! A connection becomes authorized (or not) once, when it calls
//! `connection.identify`.  Privileged operations check that flag.

use std::collections::HashSet;

use crate::domain::config::AuthorizationConfig;

/// Identity a client declares with `connection.identify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_name: String,
    pub version: String,
    /// Declared role, e.g. `"web"`, `"mobile"`, `"agent"`.
    pub client_type: String,
    pub url: Option<String>,
}

/// Decides whether an identified client may perform privileged calls.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, identity: &ClientIdentity, access_token: Option<&str>) -> bool;
}

/// Authorizes clients whose name is trusted or that present the API key.
#[derive(Debug, Clone, Default)]
pub struct ConfigAuthorizer {
    trusted_clients: HashSet<String>,
    api_key: Option<String>,
}

impl ConfigAuthorizer {
    pub fn new(config: &AuthorizationConfig) -> Self {
        Self {
            trusted_clients: config.trusted_clients.iter().cloned().collect(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

impl Authorizer for ConfigAuthorizer {
    fn authorize(&self, identity: &ClientIdentity, access_token: Option<&str>) -> bool {
        if self.trusted_clients.contains(&identity.client_name) {
            return true;
        }
        match (&self.api_key, access_token) {
            (Some(key), Some(token)) => key == token,
            _ => false,
        }
    }
}
