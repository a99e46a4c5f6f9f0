use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use time::OffsetDateTime;
use tracing::warn;

use super::{
    claims::{Claims, TokenKind},
    jwt::JwtKeys,
};
use crate::{
    access::identity::{Identity, IdentitySource},
    error::ApiError,
};

/// Extracts and validates the access token, yielding the signed-in identity.
pub struct AuthUser(pub Identity);

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        let source = match claims.challenge {
            Some(_) => IdentitySource::PinChallenge,
            None => IdentitySource::Provider,
        };
        Identity {
            id: claims.sub,
            source,
            challenge_code: claims.challenge,
            expires_at: OffsetDateTime::from_unix_timestamp(claims.exp as i64).ok(),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(ApiError::Unauthorized("missing Authorization header"))?;

        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or(ApiError::Unauthorized("invalid auth scheme"))?;

        let claims = JwtKeys::from_ref(state).verify(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            ApiError::Unauthorized("invalid or expired token")
        })?;

        if claims.kind != TokenKind::Access {
            return Err(ApiError::Unauthorized("access token required"));
        }

        Ok(AuthUser(claims.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn claims(challenge: Option<&str>) -> Claims {
        Claims {
            sub: Uuid::new_v4(),
            iat: 1_700_000_000,
            exp: 1_700_003_600,
            iss: "iss".into(),
            aud: "aud".into(),
            kind: TokenKind::Access,
            challenge: challenge.map(str::to_string),
        }
    }

    #[test]
    fn provider_identity_from_plain_token() {
        let c = claims(None);
        let id = c.sub;
        let identity = Identity::from(c);
        assert_eq!(identity.id, id);
        assert_eq!(identity.source, IdentitySource::Provider);
        assert_eq!(identity.challenge_code, None);
        assert_eq!(
            identity.expires_at.map(|t| t.unix_timestamp()),
            Some(1_700_003_600)
        );
    }

    #[test]
    fn pin_identity_keeps_challenge_code() {
        let identity = Identity::from(claims(Some("AB12CD34")));
        assert_eq!(identity.source, IdentitySource::PinChallenge);
        assert_eq!(identity.challenge_code.as_deref(), Some("AB12CD34"));
    }
}
