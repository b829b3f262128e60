//! Principal (User/Role) Document Handling
//!
//! User and role documents live on the same feed as regular documents and
//! consume sequence numbers like everything else. The cache does not care
//! about their contents - it only needs their sequence so the watermark
//! does not stall on the slot they occupy. They are admitted as synthetic
//! entries with a `_user/<name>` or `_role/<name>` doc id and no channels.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Key prefix for user documents on the feed.
pub const USER_KEY_PREFIX: &str = "_sync:user:";
/// Key prefix for role documents on the feed.
pub const ROLE_KEY_PREFIX: &str = "_sync:role:";

/// The cache-relevant subset of a principal document.
#[derive(Debug, Clone, Deserialize)]
pub struct Principal {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sequence: u64,
}

/// Collaborator that parses principal documents.
pub trait Authenticator: Send + Sync {
    fn unmarshal_principal(&self, raw: &[u8], is_user: bool) -> Result<Principal>;
}

/// Default authenticator: principals are plain JSON documents.
#[derive(Debug, Default)]
pub struct JsonAuthenticator;

impl Authenticator for JsonAuthenticator {
    fn unmarshal_principal(&self, raw: &[u8], _is_user: bool) -> Result<Principal> {
        let principal: Principal = serde_json::from_slice(raw)?;
        if principal.name.is_empty() {
            return Err(Error::InvalidPrincipal("missing name".to_string()));
        }
        Ok(principal)
    }
}
