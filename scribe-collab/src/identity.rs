//! Identity verification for connections and requests.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use scribe_core::OriginId;

use crate::error::CollabError;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// The editing client (browser tab, device). Used as operation origin.
    pub client_id: String,
    /// The account behind it. Used for document ownership.
    pub user_id: String,
}

impl Identity {
    pub fn new(client_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn origin(&self) -> OriginId {
        OriginId::new(self.client_id.as_str())
    }
}

/// Resolves bearer tokens to identities.
pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify_token(&self, token: &str) -> Result<Identity, CollabError>;
}

/// JWT claims accepted by [`JwtVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub client_id: String,
    /// Expiration (seconds since epoch). Tokens without one never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// HS256 verifier with a shared secret.
pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign a token for `claims`.
    pub fn issue(&self, claims: &Claims) -> Result<String, CollabError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| CollabError::Unauthorized(format!("cannot sign token: {e}")))
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify_token(&self, token: &str) -> Result<Identity, CollabError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            log::debug!("Token rejected: {e}");
            CollabError::Unauthorized(e.to_string())
        })?;
        let claims = data.claims;
        if claims.sub.is_empty() || claims.client_id.is_empty() {
            return Err(CollabError::Unauthorized("token is missing sub or client_id".into()));
        }
        Ok(Identity::new(claims.client_id, claims.sub))
    }
}

/// Fixed token table.
#[derive(Debug, Default)]
pub struct StaticIdentities {
    tokens: RwLock<HashMap<String, Identity>>,
}

impl StaticIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }

    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), identity);
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .write()
            .map(|mut tokens| tokens.remove(token).is_some())
            .unwrap_or(false)
    }
}

impl IdentityVerifier for StaticIdentities {
    fn verify_token(&self, token: &str) -> Result<Identity, CollabError> {
        let tokens = self
            .tokens
            .read()
            .map_err(|e| CollabError::Unauthorized(e.to_string()))?;
        tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CollabError::Unauthorized("unknown token".into()))
    }
}
