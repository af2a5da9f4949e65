//! JWT validation against a remote JWKS.
//!
//! The signing-key set is fetched from the configured JWKS URL and cached in
//! memory keyed by `kid`. A background task refreshes the cache every ten
//! minutes; a token carrying an unknown `kid` triggers an on-demand refetch,
//! serialized through a mutex so concurrent misses coalesce into a single
//! request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header, jwk::JwkSet};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{AuthError, AuthMethod, CallerIdentity, Role};

/// Allowed clock skew for `exp` and `iat`, in seconds.
const LEEWAY_SECS: u64 = 60;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Claims the gateway understands. Unknown claims are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Map validated claims to a caller identity. Org resolution falls back
/// `org` -> `org_id` -> configured default.
pub fn identity_from_claims(
    claims: &JwtClaims,
    default_org: Option<&str>,
    raw_credential: &str,
) -> CallerIdentity {
    let org_id = claims
        .org
        .clone()
        .or_else(|| claims.org_id.clone())
        .or_else(|| default_org.map(str::to_owned))
        .unwrap_or_else(|| "default".to_owned());
    CallerIdentity {
        user_id: claims.sub.clone(),
        org_id,
        email: claims.email.clone(),
        display_name: claims.name.clone(),
        role: claims.role.as_deref().map_or(Role::Member, Role::parse),
        is_platform_admin: false,
        auth_method: AuthMethod::Jwt,
        raw_credential: raw_credential.to_owned(),
    }
}

pub struct JwtValidator {
    jwks_url: String,
    issuer: Option<String>,
    default_org: Option<String>,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("jwks_url", &self.jwks_url)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl JwtValidator {
    pub fn new(jwks_url: String, issuer: Option<String>, default_org: Option<String>) -> Self {
        Self {
            jwks_url,
            issuer,
            default_org,
            client: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Fetch the JWKS and replace the cached key map.
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let jwks: JwkSet = self
            .client
            .get(&self.jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

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
                    tracing::warn!(kid = %kid, error = %err, "skipping unusable JWK");
                }
            }
        }

        let count = fresh.len();
        *self.keys.write().await = fresh;
        tracing::debug!(keys = count, "JWKS refreshed");
        Ok(count)
    }

    /// Look up a `kid`, refetching the set once on a miss. Concurrent misses
    /// for the same set coalesce behind the refresh lock.
    async fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Some(key.clone());
        }
        let _refresh = self.refresh_lock.lock().await;
        // Another waiter may have refreshed while this one queued.
        if let Some(key) = self.keys.read().await.get(kid) {
            return Some(key.clone());
        }
        if let Err(err) = self.refresh().await {
            tracing::warn!(error = %err, "JWKS refetch failed");
        }
        self.keys.read().await.get(kid).cloned()
    }

    pub async fn validate(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::SignatureInvalid)?;
        let kid = header.kid.ok_or(AuthError::SignatureInvalid)?;
        let key = self
            .key_for(&kid)
            .await
            .ok_or(AuthError::SignatureInvalid)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = LEEWAY_SECS;
        validation.validate_aud = false;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<JwtClaims>(token, &key, &validation).map_err(|err| {
            use jsonwebtoken::errors::ErrorKind;
            match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::SignatureInvalid,
            }
        })?;

        // jsonwebtoken validates exp; iat gets the same skew window by hand.
        if let Some(iat) = data.claims.iat {
            if iat > Utc::now().timestamp() + LEEWAY_SECS as i64 {
                return Err(AuthError::SignatureInvalid);
            }
        }

        Ok(identity_from_claims(
            &data.claims,
            self.default_org.as_deref(),
            token,
        ))
    }

    /// Background refresh every [`REFRESH_INTERVAL`].
    pub fn spawn_refresh(self: &Arc<Self>, shutdown: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = this.refresh().await {
                    tracing::warn!(error = %err, "scheduled JWKS refresh failed");
                }
            }
        });
    }
}
