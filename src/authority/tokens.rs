//! Auth token validation.

use crate::config::TokenConfig;
use crate::error::ErrorCode;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Validates the opaque token attached to every render batch.
pub trait TokenValidator: Send + Sync {
    /// `Ok` when the holder may render previews, otherwise the batch-level
    /// error code to answer with.
    fn validate(&self, token: &str) -> Result<(), ErrorCode>;
}

/// In-memory token table.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, bool>>,
}

impl TokenRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured tokens.
    #[must_use]
    pub fn from_config(tokens: &[TokenConfig]) -> Self {
        let registry = Self::new();
        for t in tokens {
            registry.insert(&t.token, t.can_customize);
        }
        registry
    }

    /// Issue a fresh random token.
    pub fn issue(&self, can_customize: bool) -> String {
        let token = Uuid::new_v4().to_string();
        self.insert(&token, can_customize);
        token
    }

    pub fn insert(&self, token: &str, can_customize: bool) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.to_owned(), can_customize);
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token)
            .is_some()
    }
}

impl TokenValidator for TokenRegistry {
    fn validate(&self, token: &str) -> Result<(), ErrorCode> {
        if token.is_empty() {
            return Err(ErrorCode::BadNonce);
        }
        match self
            .tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
        {
            None => Err(ErrorCode::BadNonce),
            Some(false) => Err(ErrorCode::CustomizeNotAllowed),
            Some(true) => Ok(()),
        }
    }
}
