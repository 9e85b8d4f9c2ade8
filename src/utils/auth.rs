use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{self, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::state::AppState;

const ISSUER: &str = "tablegate";

#[derive(Deserialize, Serialize, Debug)]
pub(crate) struct Claims {
    pub(crate) exp: i64,
    pub(crate) iat: i64,
    pub(crate) sub: String,
    pub(crate) iss: String,
}

/// Issues and verifies HS256 bearer tokens with a fixed lifetime.
#[derive(Clone)]
pub(crate) struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub(crate) fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    pub(crate) fn issue(&self, username: &str) -> Result<String, Error> {
        let current_time = Utc::now();
        let expiration_time = current_time
            .checked_add_signed(self.ttl)
            .ok_or(Error::Internal)?;

        let claims = Claims {
            exp: expiration_time.timestamp(),
            iat: current_time.timestamp(),
            sub: username.to_owned(),
            iss: ISSUER.into(),
        };

        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    /// Returns the subject of a valid token.
    pub(crate) fn verify(&self, token: &str) -> Result<String, Error> {
        let claims = match jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
        {
            Ok(token_data) => token_data.claims,
            Err(e) => {
                return match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(Error::TokenExpired),
                    _ => Err(Error::TokenInvalid),
                };
            }
        };

        // The library only rejects `exp < now`; a token is dead at `exp` itself.
        if claims.exp <= Utc::now().timestamp() {
            return Err(Error::TokenExpired);
        }

        if claims.sub.is_empty() {
            return Err(Error::TokenInvalid);
        }

        Ok(claims.sub)
    }
}

/// Pulls the token out of `Authorization: Bearer <token>`.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str, Error> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(Error::Unauthenticated)?
        .to_str()
        .map_err(|_| Error::Unauthenticated)?;

    let mut parts = value.split_whitespace();

    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(Error::Unauthenticated),
    }
}

pub(crate) async fn active_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let token = bearer_token(request.headers())?;
    let user = state.guard.active_user(token).await?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

pub(crate) async fn admin_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let token = bearer_token(request.headers())?;
    let user = state.guard.admin_user(token).await?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}
