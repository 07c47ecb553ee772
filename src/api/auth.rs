use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ExchangeResult;

pub const QUERY_HASH_ALG: &str = "SHA512";

/// Source of single-use nonces for signed requests
pub trait NonceSource: Send + Sync {
    fn next_nonce(&self) -> String;
}

/// Random UUID v4 nonce per request
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidNonce;

impl NonceSource for UuidNonce {
    fn next_nonce(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// JWT payload carried by every private call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub access_key: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_hash_alg: Option<String>,
}

/// Canonical form of a parameter set: sorted by key, form-urlencoded.
///
/// Repeated keys keep their relative order.
pub fn canonical_query<K, V>(params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut sorted: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_ref(), v.as_ref()))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(sorted)
        .finish()
}

/// Lowercase hex SHA-512 of a canonical query string
pub fn query_hash(query: &str) -> String {
    hex::encode(Sha512::digest(query.as_bytes()))
}

/// Builds bearer tokens for private endpoints
#[derive(Clone)]
pub struct Signer {
    access_key: String,
    secret_key: String,
    nonce: Arc<dyn NonceSource>,
}

impl Signer {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self::with_nonce_source(access_key, secret_key, Arc::new(UuidNonce))
    }

    pub fn with_nonce_source(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        nonce: Arc<dyn NonceSource>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            nonce,
        }
    }

    /// Claims for a request with the given parameters (empty = no hash claims)
    pub fn claims<K, V>(&self, params: &[(K, V)]) -> Claims
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let (query_hash, query_hash_alg) = if params.is_empty() {
            (None, None)
        } else {
            let query = canonical_query(params);
            (
                Some(self::query_hash(&query)),
                Some(QUERY_HASH_ALG.to_string()),
            )
        };

        Claims {
            access_key: self.access_key.clone(),
            nonce: self.nonce.next_nonce(),
            query_hash,
            query_hash_alg,
        }
    }

    /// `Authorization` header value: `Bearer <HS256 JWT>`
    pub fn authorization<K, V>(&self, params: &[(K, V)]) -> ExchangeResult<String>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let claims = self.claims(params);
        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret_key.as_bytes()),
        )?;
        Ok(format!("Bearer {}", token))
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
