//! Request authentication.
//!
//! When enabled, every protected route requires either
//! `Authorization: Bearer <token>` or HTTP Basic credentials matching the
//! configured user and token. An empty configured token always rejects.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use warp::{Filter, Rejection};

use super::{with_ctx, ApiContext, ApiError};
use crate::config::AuthConfig;

/// Filter rejecting unauthenticated requests with 401 when auth is enabled;
/// a no-op otherwise.
pub(crate) fn required(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_ctx(ctx))
        .and_then(|header: Option<String>, ctx: Arc<ApiContext>| async move {
            if !ctx.auth.enable || check(header.as_deref(), &ctx.auth) {
                Ok(())
            } else {
                Err(warp::reject::custom(ApiError::Unauthorized))
            }
        })
        .untuple_one()
}

fn check(header: Option<&str>, auth: &AuthConfig) -> bool {
    let token = auth.token.trim();
    if token.is_empty() {
        return false;
    }

    let Some(header) = header.map(str::trim) else {
        return false;
    };

    if let Some(bearer) = header.strip_prefix("Bearer ") {
        return bearer.trim() == token;
    }

    if let Some(basic) = header.strip_prefix("Basic ") {
        let Ok(decoded) = STANDARD.decode(basic.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, password)) = decoded.split_once(':') else {
            return false;
        };
        return user == auth.user.trim() && password == token;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(user: &str, token: &str) -> AuthConfig {
        AuthConfig {
            enable: true,
            user: user.to_owned(),
            token: token.to_owned(),
        }
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[test]
    fn bearer_token_matches() {
        let auth = auth("admin", "hunter2");
        assert!(check(Some("Bearer hunter2"), &auth));
        assert!(check(Some("  Bearer hunter2  "), &auth));
        assert!(!check(Some("Bearer wrong"), &auth));
    }

    #[test]
    fn basic_credentials_match() {
        let auth = auth("admin", "hunter2");
        assert!(check(Some(&basic("admin", "hunter2")), &auth));
        assert!(!check(Some(&basic("admin", "wrong")), &auth));
        assert!(!check(Some(&basic("other", "hunter2")), &auth));
        assert!(!check(Some("Basic not-base64!!!"), &auth));
    }

    #[test]
    fn missing_header_or_empty_token_rejects() {
        assert!(!check(None, &auth("admin", "hunter2")));
        assert!(!check(Some("Bearer anything"), &auth("admin", "")));
        assert!(!check(Some("Digest abc"), &auth("admin", "hunter2")));
    }
}
