// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OIDC token verification.
//!
//! Tokens are signed JWTs validated against the issuer's published JWKS.
//! Keys are cached by `kid`; a miss triggers exactly one refresh before the
//! lookup fails. Signature, expiry, issuer (exact match) and audience
//! (containment) are all enforced by the decoder.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Principal;

/// Upper bound on a JWKS fetch.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from OIDC verification.
#[derive(Debug, Error)]
pub enum OidcError {
    /// Token header names no key id.
    #[error("token header carries no kid")]
    MissingKeyId,

    /// Key id is absent from the JWKS even after a refresh.
    #[error("unknown key id '{0}'")]
    UnknownKeyId(String),

    /// Token is signed with an algorithm outside the allow-list.
    #[error("algorithm {0:?} is not allowed")]
    DisallowedAlgorithm(Algorithm),

    /// Signature, expiry, issuer or audience check failed.
    #[error("token validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// JWKS endpoint could not be fetched or parsed.
    #[error("jwks fetch failed: {0}")]
    Jwks(String),

    /// The org_id claim is not a UUID.
    #[error("invalid org_id claim: {0}")]
    InvalidOrg(String),
}

/// OIDC provider configuration.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// Expected `iss` claim, matched exactly.
    pub issuer: String,
    /// Value the `aud` claim must contain.
    pub audience: String,
    /// OAuth client id, surfaced via `GetServerInfo`.
    pub client_id: String,
    /// JWKS endpoint.
    pub jwks_url: String,
    /// Device-authorization endpoint, surfaced via `GetServerInfo`.
    pub device_authorization_endpoint: String,
    /// Token endpoint, surfaced via `GetServerInfo`.
    pub token_endpoint: String,
    /// Scopes a client should request.
    pub scopes: Vec<String>,
    /// Allow-listed signature algorithms.
    pub allowed_algorithms: Vec<Algorithm>,
}

impl OidcConfig {
    /// Default allow-list: the RSA and ECDSA families over SHA-256/384/512.
    pub fn default_algorithms() -> Vec<Algorithm> {
        vec![
            Algorithm::RS256,
            Algorithm::RS384,
            Algorithm::RS512,
            Algorithm::ES256,
            Algorithm::ES384,
        ]
    }

    /// Parse a comma-separated algorithm list, e.g. `RS256,ES256`.
    pub fn parse_algorithms(list: &str) -> Vec<Algorithm> {
        list.split(',')
            .filter_map(|name| {
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                match Algorithm::from_str(name) {
                    Ok(alg) => Some(alg),
                    Err(_) => {
                        warn!(algorithm = name, "ignoring unknown algorithm");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Claims the engine extracts from a verified token.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Verifies OIDC bearer tokens against a cached JWKS.
pub struct OidcVerifier {
    config: OidcConfig,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl OidcVerifier {
    /// Create a verifier. No network traffic happens until the first
    /// verification needs a key.
    pub fn new(config: OidcConfig) -> Result<Self, OidcError> {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .map_err(|err| OidcError::Jwks(err.to_string()))?;

        Ok(Self {
            config,
            http,
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// The verifier's configuration.
    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// Verify a token and derive its [`Principal`].
    pub async fn verify(&self, token: &str) -> Result<Principal, OidcError> {
        let header = decode_header(token)?;

        if !self.config.allowed_algorithms.contains(&header.alg) {
            return Err(OidcError::DisallowedAlgorithm(header.alg));
        }

        let kid = header.kid.ok_or(OidcError::MissingKeyId)?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.algorithms = self.config.allowed_algorithms.clone();
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let data = decode::<Claims>(token, &key, &validation)?;
        principal_from_claims(data.claims)
    }

    /// Look up a decoding key by kid. On a cache miss, refresh the JWKS once
    /// and retry before failing.
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, OidcError> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        debug!(kid, "kid missing from cache, refreshing jwks");
        self.refresh_jwks().await?;

        self.keys
            .read()
            .await
            .get(kid)
            .cloned()
            .ok_or_else(|| OidcError::UnknownKeyId(kid.to_string()))
    }

    /// Fetch the JWKS and rebuild the key cache.
    async fn refresh_jwks(&self) -> Result<(), OidcError> {
        let jwks: JwkSet = self
            .http
            .get(&self.config.jwks_url)
            .send()
            .await
            .map_err(|err| OidcError::Jwks(err.to_string()))?
            .error_for_status()
            .map_err(|err| OidcError::Jwks(err.to_string()))?
            .json()
            .await
            .map_err(|err| OidcError::Jwks(err.to_string()))?;

        let mut fresh = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    fresh.insert(kid, key);
                }
                Err(err) => {
                    warn!(%kid, error = %err, "skipping unusable jwk");
                }
            }
        }

        debug!(keys = fresh.len(), "jwks refreshed");
        *self.keys.write().await = fresh;
        Ok(())
    }
}

/// Derive a [`Principal`] from verified claims.
fn principal_from_claims(claims: Claims) -> Result<Principal, OidcError> {
    let org_id = match claims.org_id {
        Some(raw) => Some(Uuid::parse_str(&raw).map_err(|_| OidcError::InvalidOrg(raw))?),
        None => None,
    };

    let scopes = claims
        .scope
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    Ok(Principal {
        subject: claims.sub,
        email: claims.email,
        username: claims.preferred_username,
        org_id,
        roles: claims.roles,
        scopes,
    })
}
