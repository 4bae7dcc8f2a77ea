// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Request authentication: API token verification (X-API-Token header with
//! Authorization Bearer fallback), admin basic auth against bcrypt hashes,
//! and the runner version gate. All token comparisons are constant-time.

use axum::http::{header, HeaderMap, StatusCode};
use base64::Engine;
use config::ManagerConfig;
use models::version::{parse_major_minor, MANAGER_VERSION};
use subtle::ConstantTimeEq;

use crate::web::WebError;

pub const API_TOKEN_HEADER: &str = "x-api-token";
pub const RUNNER_VERSION_HEADER: &str = "x-runner-version";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Token from the request: `X-API-Token` wins over `Authorization: Bearer`.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = header_str(headers, API_TOKEN_HEADER) {
        return Some(token.to_string());
    }
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn token_is_authorized(token: &str, cfg: &ManagerConfig) -> bool {
    let mut authorized = false;
    for value in cfg.authorized_tokens.values() {
        // No early exit: every configured token is compared.
        authorized |= bool::from(value.as_bytes().ct_eq(token.as_bytes()));
    }
    authorized
}

/// Shortened form of a token for logs.
fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "<empty>".to_string();
    }
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

/// Verify the caller's API token. Returns the token itself: registration
/// stores it as the runner's credential, and task submission forwards it as
/// the client token on notify callbacks.
pub fn verify_token(headers: &HeaderMap, cfg: &ManagerConfig) -> Result<String, WebError> {
    let Some(token) = extract_token(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            "Missing authentication token".to_string(),
        ));
    };

    if !token_is_authorized(&token, cfg) {
        tracing::info!(token = %mask_token(&token), "unauthorized token attempt");
        return Err((
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token".to_string(),
        ));
    }

    Ok(token)
}

/// Verify admin basic-auth credentials against the configured bcrypt hashes.
pub fn verify_admin(headers: &HeaderMap, cfg: &ManagerConfig) -> Result<String, WebError> {
    let unauthorized = || (StatusCode::UNAUTHORIZED, "Invalid credentials".to_string());

    let raw = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or_else(unauthorized)?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| unauthorized())?;
    let decoded = String::from_utf8(decoded).map_err(|_| unauthorized())?;
    let (username, password) = decoded.split_once(':').ok_or_else(unauthorized)?;

    let stored_hash = cfg.admin_users.get(username).ok_or_else(unauthorized)?;
    match bcrypt::verify(password, stored_hash) {
        Ok(true) => Ok(username.to_string()),
        _ => {
            tracing::info!(username, "invalid admin credentials");
            Err(unauthorized())
        }
    }
}

/// Enforce the MAJOR.MINOR compatibility gate on `X-Runner-Version`.
/// Returns the runner's version string when it is acceptable.
pub fn verify_runner_version(headers: &HeaderMap) -> Result<String, WebError> {
    let Some(runner_version) = header_str(headers, RUNNER_VERSION_HEADER) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "Missing X-Runner-Version header. Runner must send its version.".to_string(),
        ));
    };
    let runner_version = runner_version.trim().to_string();

    let (runner_major, runner_minor) = parse_major_minor(&runner_version).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "Invalid X-Runner-Version format. Expected something like 'MAJOR.MINOR.PATCH' (e.g. 0.9.0)."
                .to_string(),
        )
    })?;

    let (manager_major, manager_minor) =
        parse_major_minor(MANAGER_VERSION).expect("MANAGER_VERSION is a valid version string");

    if (runner_major, runner_minor) != (manager_major, manager_minor) {
        tracing::warn!(
            runner_version,
            manager_version = MANAGER_VERSION,
            "version mismatch"
        );
        return Err((
            StatusCode::CONFLICT,
            format!(
                "Version mismatch: Runner version {runner_version} does not match Manager version {MANAGER_VERSION} (expected {manager_major}.{manager_minor}.x)"
            ),
        ));
    }

    Ok(runner_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::collections::HashMap;

    fn cfg_with_token(token: &str) -> ManagerConfig {
        let mut cfg = ManagerConfig::from_env();
        cfg.authorized_tokens = HashMap::from([("CLIENT".to_string(), token.to_string())]);
        cfg
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn api_token_header_has_priority_over_bearer() {
        let cfg = cfg_with_token("good");
        let h = headers(&[("x-api-token", "good"), ("authorization", "Bearer bad")]);
        assert_eq!(verify_token(&h, &cfg).unwrap(), "good");
    }

    #[test]
    fn bearer_fallback_works() {
        let cfg = cfg_with_token("good");
        let h = headers(&[("authorization", "Bearer good")]);
        assert_eq!(verify_token(&h, &cfg).unwrap(), "good");
    }

    #[test]
    fn missing_and_invalid_tokens_are_unauthorized() {
        let cfg = cfg_with_token("good");
        assert_eq!(
            verify_token(&headers(&[]), &cfg).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            verify_token(&headers(&[("x-api-token", "bad")]), &cfg)
                .unwrap_err()
                .0,
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn runner_version_gate() {
        // Same MAJOR.MINOR, any patch: accepted.
        let h = headers(&[("x-runner-version", "0.9.7")]);
        assert_eq!(verify_runner_version(&h).unwrap(), "0.9.7");

        // Different minor: 409.
        let h = headers(&[("x-runner-version", "0.8.5")]);
        assert_eq!(verify_runner_version(&h).unwrap_err().0, StatusCode::CONFLICT);

        // Missing or malformed: 400.
        assert_eq!(
            verify_runner_version(&headers(&[])).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
        let h = headers(&[("x-runner-version", "not-a-version")]);
        assert_eq!(
            verify_runner_version(&h).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn admin_basic_auth_against_bcrypt_hash() {
        let mut cfg = ManagerConfig::from_env();
        let hash = bcrypt::hash("s3cret", 4).unwrap();
        cfg.admin_users = HashMap::from([("admin".to_string(), hash)]);

        let credentials =
            base64::engine::general_purpose::STANDARD.encode("admin:s3cret".as_bytes());
        let h = headers(&[("authorization", &format!("Basic {credentials}"))]);
        assert_eq!(verify_admin(&h, &cfg).unwrap(), "admin");

        let bad = base64::engine::general_purpose::STANDARD.encode("admin:wrong".as_bytes());
        let h = headers(&[("authorization", &format!("Basic {bad}"))]);
        assert_eq!(verify_admin(&h, &cfg).unwrap_err().0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn token_masking_hides_the_middle() {
        assert_eq!(mask_token(""), "<empty>");
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token("abcdefghijkl"), "abcd...ijkl");
    }
}
