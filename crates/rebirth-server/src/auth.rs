//! Bearer-token auth via an HttpOnly cookie. A token embeds the user's
//! email and token_version; bumping the version invalidates every token
//! issued before (single-session policy).

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use rebirth::config::Settings;
use rebirth::storage::User;

use crate::errors::ApiError;
use crate::state::AppState;

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User email.
    sub: String,
    /// Token version at issue time.
    ver: i64,
    exp: i64,
}

pub fn mint_access_token(settings: &Settings, user: &User) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user.email.clone(),
        ver: user.token_version,
        exp: (Utc::now() + chrono::Duration::minutes(settings.access_token_expire_minutes))
            .timestamp(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.secret_key.as_bytes()),
    )?;
    Ok(token)
}

fn cookie_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    let header = parts.headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Authenticated caller, resolved from the access-token cookie.
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let credentials_error = || ApiError::Unauthorized("无法验证凭证".into());

        let token = cookie_value(parts, ACCESS_TOKEN_COOKIE).ok_or_else(credentials_error)?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.settings.secret_key.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| credentials_error())?;

        let user = state
            .store
            .get_user_by_email(&data.claims.sub)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(credentials_error)?;

        if user.token_version != data.claims.ver {
            return Err(ApiError::Unauthorized(
                "登录状态已失效：你的账号在其他位置登录，当前会话已登出".into(),
            ));
        }

        Ok(CurrentUser(user))
    }
}
