//! Cookie session auth for the three caller kinds.
//!
//! Each middleware:
//! 1. Reads the side's session cookie (`app_session` / `chair_session` /
//!    `owner_session`)
//! 2. Resolves the access token to its entity, through the token cache for
//!    the hot user/chair paths
//! 3. Stores the entity in request extensions for the handlers
//!
//! Missing cookie or unknown token is a 401; the request never reaches the
//! handler.

use std::sync::Arc;

use axum::extract::{Extension, Request};
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::domains::chair::Chair;
use crate::domains::owner::Owner;
use crate::domains::user::User;
use crate::kernel::AppKernel;
use crate::server::error::ApiError;

/// Value of a named cookie across all `Cookie` headers, if present.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
        .find(|value| !value.is_empty())
}

pub async fn app_auth_middleware(
    Extension(kernel): Extension<Arc<AppKernel>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = cookie_value(request.headers(), "app_session")
        .ok_or_else(|| ApiError::Unauthorized("app_session cookie is required".into()))?;

    let cached = kernel
        .caches
        .user_tokens
        .get(&token)
        .map(|u| u.value().clone());
    let user = match cached {
        Some(user) => user,
        None => {
            let user = User::find_by_access_token(&kernel.pool, &token)
                .await?
                .ok_or_else(|| ApiError::Unauthorized("invalid access token".into()))?;
            kernel.caches.user_tokens.insert(token, user.clone());
            user
        }
    };

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

pub async fn chair_auth_middleware(
    Extension(kernel): Extension<Arc<AppKernel>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = cookie_value(request.headers(), "chair_session")
        .ok_or_else(|| ApiError::Unauthorized("chair_session cookie is required".into()))?;

    let cached = kernel
        .caches
        .chair_tokens
        .get(&token)
        .map(|c| c.value().clone());
    let chair = match cached {
        Some(chair) => chair,
        None => {
            let chair = Chair::find_by_access_token(&kernel.pool, &token)
                .await?
                .ok_or_else(|| ApiError::Unauthorized("invalid access token".into()))?;
            kernel.caches.chair_tokens.insert(token, chair.clone());
            chair
        }
    };

    request.extensions_mut().insert(chair);
    Ok(next.run(request).await)
}

pub async fn owner_auth_middleware(
    Extension(kernel): Extension<Arc<AppKernel>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = cookie_value(request.headers(), "owner_session")
        .ok_or_else(|| ApiError::Unauthorized("owner_session cookie is required".into()))?;

    let owner = Owner::find_by_access_token(&kernel.pool, &token)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid access token".into()))?;

    request.extensions_mut().insert(owner);
    Ok(next.run(request).await)
}

/// `Set-Cookie` value for a freshly issued session token.
pub fn session_cookie(name: &str, token: &str) -> String {
    format!("{name}={token}; Path=/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_cookie_value_finds_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("foo=1; app_session=abc123; bar=2"),
        );
        assert_eq!(
            cookie_value(&headers, "app_session"),
            Some("abc123".to_string())
        );
        assert_eq!(cookie_value(&headers, "chair_session"), None);
    }

    #[test]
    fn test_cookie_value_ignores_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("app_session="));
        assert_eq!(cookie_value(&headers, "app_session"), None);
    }
}
