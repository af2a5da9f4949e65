//! Authentication middleware.
//!
//! Extracts the bearer credential, resolves it through the chain, and
//! injects the resulting [`CallerIdentity`] as a request extension. Failures
//! render the standard error envelope and emit an `auth_fail` audit record.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{AuthError, CallerIdentity};
use crate::AppState;
use crate::error::GatewayError;

/// Extract the credential from `Authorization: Bearer <credential>`, the
/// only accepted shape.
pub fn bearer_credential(headers: &axum::http::HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;
    let credential = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MalformedHeader)?
        .trim();
    if credential.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(credential)
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let credential = match bearer_credential(request.headers()) {
        Ok(credential) => credential.to_owned(),
        Err(err) => return reject(&state, err),
    };

    match state.authenticator.resolve(&credential).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => reject(&state, err),
    }
}

fn reject(state: &AppState, err: AuthError) -> Response {
    tracing::debug!(reason = err.code(), "request rejected at auth");
    state.audit.record_auth_failure();
    GatewayError::Unauthorized(err).into_response()
}

/// Gate for platform-admin-only endpoints.
pub fn require_platform_admin(identity: &CallerIdentity) -> Result<(), GatewayError> {
    if identity.is_platform_admin {
        Ok(())
    } else {
        Err(GatewayError::Forbidden(
            "platform admin privileges required".to_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn missing_header_is_distinct_from_malformed() {
        let headers = HeaderMap::new();
        assert_eq!(
            bearer_credential(&headers).unwrap_err(),
            AuthError::MissingHeader
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(
            bearer_credential(&headers).unwrap_err(),
            AuthError::MalformedHeader
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(
            bearer_credential(&headers).unwrap_err(),
            AuthError::MalformedHeader
        );
    }

    #[test]
    fn bearer_credential_extracts_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer dev-key-1"),
        );
        assert_eq!(bearer_credential(&headers).unwrap(), "dev-key-1");
    }
}
