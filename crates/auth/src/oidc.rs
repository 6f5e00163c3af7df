//! Bearer-token authentication against an OIDC issuer's signing keys.
//!
//! Only RS256 tokens with a `kid` are accepted. The verified claims are mapped
//! onto a [`Principal`] through a [`ClaimMapping`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{AuthError, Principal, name_list};

/// Claim paths for the principal id, its roles and its authorities. A path is
/// first looked up as a literal claim name, then as a dotted path into nested
/// objects (`realm_access.roles`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMapping {
    pub principal_id: String,
    pub roles: String,
    pub authorities: String,
}

impl Default for ClaimMapping {
    fn default() -> Self {
        Self {
            principal_id: "sub".to_string(),
            roles: "roles".to_string(),
            authorities: "permissions".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: Option<String>,
    pub jwks_url: Option<String>,
    pub jwks_json: Option<String>,
    pub jwks_timeout: Duration,
    pub jwks_refresh_ttl: Duration,
    pub clock_skew: Duration,
    pub claims: ClaimMapping,
}

#[derive(Clone)]
pub struct OidcAuthenticator {
    config: Arc<OidcConfig>,
    http: reqwest::Client,
    keys: Arc<RwLock<KeyCache>>,
}

struct KeyCache {
    keys: JwkSet,
    fetched_at: Instant,
}

impl OidcAuthenticator {
    /// Loads the signing keys up front; fails when they cannot be loaded.
    pub async fn new(config: OidcConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "oidc issuer must be non-empty",
            ));
        }
        if config.claims.principal_id.trim().is_empty() {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "oidc principal id claim must be non-empty",
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.jwks_timeout)
            .build()
            .map_err(|_| AuthError::new("ERR_INTERNAL", "failed to initialize oidc http client"))?;
        let keys = KeyCache::fetch(&http, &config).await?;

        Ok(Self {
            config: Arc::new(config),
            http,
            keys: Arc::new(RwLock::new(keys)),
        })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;
        let claims = self.verify(token).await?;
        principal_from_claims(&claims, &self.config.claims)
    }

    async fn verify(&self, token: &str) -> Result<Value, AuthError> {
        let header = decode_header(token)
            .map_err(|_| AuthError::new("ERR_AUTH_INVALID", "invalid JWT header"))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::new(
                "ERR_AUTH_INVALID",
                "unsupported JWT alg (expected RS256)",
            ));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::new("ERR_AUTH_INVALID", "JWT header missing kid"))?;

        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(std::slice::from_ref(&self.config.issuer));
        if let Some(audience) = self.config.audience.as_ref() {
            validation.set_audience(std::slice::from_ref(audience));
        }
        validation.leeway = self.config.clock_skew.as_secs();

        decode::<Value>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::new("ERR_AUTH_INVALID", "JWT validation failed"))
    }

    /// An unknown `kid` refetches the key set at most once per refresh TTL.
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(key) = self.keys.read().await.decoding_key(kid) {
            return key;
        }

        let mut cache = self.keys.write().await;
        if cache.fetched_at.elapsed() > self.config.jwks_refresh_ttl {
            *cache = KeyCache::fetch(&self.http, &self.config).await?;
        }
        cache
            .decoding_key(kid)
            .unwrap_or_else(|| Err(AuthError::new("ERR_AUTH_INVALID", "JWT kid not found in JWKS")))
    }
}

impl KeyCache {
    async fn fetch(http: &reqwest::Client, config: &OidcConfig) -> Result<Self, AuthError> {
        let keys = match (config.jwks_json.as_ref(), config.jwks_url.as_ref()) {
            (Some(json), _) => serde_json::from_str::<JwkSet>(json).map_err(|_| {
                AuthError::new(
                    "ERR_INVALID_CONFIG",
                    "EXTAPI_OIDC_JWKS_JSON is not valid JWKS JSON",
                )
            })?,
            (None, Some(url)) => http
                .get(url)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|_| AuthError::new("ERR_AUTH_UNAVAILABLE", "failed to fetch JWKS"))?
                .json::<JwkSet>()
                .await
                .map_err(|_| AuthError::new("ERR_AUTH_UNAVAILABLE", "failed to parse JWKS JSON"))?,
            (None, None) => {
                return Err(AuthError::new(
                    "ERR_INVALID_CONFIG",
                    "oidc requires a JWKS URL or inline JWKS JSON",
                ));
            }
        };

        Ok(Self {
            keys,
            fetched_at: Instant::now(),
        })
    }

    fn decoding_key(&self, kid: &str) -> Option<Result<DecodingKey, AuthError>> {
        let jwk = self.keys.find(kid)?;
        Some(DecodingKey::from_jwk(jwk).map_err(|_| {
            AuthError::new("ERR_AUTH_INVALID", "failed to parse JWK decoding key")
        }))
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::new("ERR_AUTH_REQUIRED", "missing Authorization header"))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(AuthError::new(
            "ERR_AUTH_INVALID",
            "Authorization must be a non-empty Bearer token",
        )),
    }
}

fn principal_from_claims(claims: &Value, mapping: &ClaimMapping) -> Result<Principal, AuthError> {
    let principal_id = claim_at(claims, &mapping.principal_id)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AuthError::new(
                "ERR_AUTH_INVALID",
                format!(
                    "required claim `{}` is missing or not a string",
                    mapping.principal_id
                ),
            )
        })?
        .to_string();

    Ok(Principal {
        principal_id,
        roles: claim_names(claims, &mapping.roles)?,
        authorities: claim_names(claims, &mapping.authorities)?,
    })
}

fn claim_at<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = claims.get(path) {
        return Some(value);
    }
    path.split('.')
        .try_fold(claims, |value, segment| value.get(segment))
}

/// A string array, or a single string holding space or comma separated names
/// (the `scope` claim shape). A missing claim maps to no names.
fn claim_names(claims: &Value, path: &str) -> Result<Vec<String>, AuthError> {
    match claim_at(claims, path) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(raw)) => Ok(name_list(
            raw.split(|c: char| c == ',' || c.is_whitespace()),
        )),
        Some(Value::Array(items)) => {
            let names = items
                .iter()
                .map(|item| {
                    item.as_str().ok_or_else(|| {
                        AuthError::new(
                            "ERR_AUTH_INVALID",
                            format!("claim `{}` must be a string array", path),
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(name_list(names))
        }
        Some(_) => Err(AuthError::new(
            "ERR_AUTH_INVALID",
            format!("claim `{}` must be a string or a string array", path),
        )),
    }
}
