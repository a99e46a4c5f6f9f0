use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use super::claims::{Claims, TokenKind};
use crate::{config::JwtConfig, state::AppState};

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        Self::from_config(&state.config.jwt)
    }
}

impl JwtKeys {
    pub fn from_config(config: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl: Duration::from_secs((config.ttl_minutes.max(0) as u64) * 60),
            refresh_ttl: Duration::from_secs((config.refresh_ttl_minutes.max(0) as u64) * 60),
        }
    }

    fn sign(&self, user_id: Uuid, kind: TokenKind, challenge: Option<&str>) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        let claims = Claims {
            sub: user_id,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind,
            challenge: challenge.map(str::to_string),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user_id, kind = ?kind, pin = challenge.is_some(), "jwt signed");
        Ok(token)
    }

    pub fn sign_access(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.sign(user_id, TokenKind::Access, None)
    }

    /// Access token for an identity that passed the PIN challenge `code`.
    pub fn sign_challenge(&self, user_id: Uuid, code: &str) -> anyhow::Result<String> {
        self.sign(user_id, TokenKind::Access, Some(code))
    }

    pub fn sign_refresh(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.sign(user_id, TokenKind::Refresh, None)
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        debug!(user_id = %data.claims.sub, kind = ?data.claims.kind, "jwt verified");
        Ok(data.claims)
    }

    pub fn verify_refresh(&self, token: &str) -> anyhow::Result<Claims> {
        let claims = self.verify(token)?;
        if claims.kind != TokenKind::Refresh {
            anyhow::bail!("not a refresh token");
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(issuer: &str, audience: &str) -> JwtKeys {
        JwtKeys::from_config(&JwtConfig {
            secret: "same-secret".into(),
            issuer: issuer.into(),
            audience: audience.into(),
            ttl_minutes: 5,
            refresh_ttl_minutes: 60,
        })
    }

    #[tokio::test]
    async fn keys_come_from_state_config() {
        let keys = JwtKeys::from_ref(&AppState::fake());
        assert_eq!(keys.issuer, "farmgate-test");
        assert_eq!(keys.audience, "farmgate-test-users");
        assert_eq!(keys.access_ttl, Duration::from_secs(300));
    }

    #[test]
    fn access_token_round_trips_claims() {
        let keys = keys("iss", "aud");
        let user_id = Uuid::new_v4();
        let token = keys.sign_access(user_id).expect("sign access");
        let claims = keys.verify(&token).expect("verify token");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(claims.challenge, None);
    }

    #[test]
    fn challenge_token_carries_its_code() {
        let keys = keys("iss", "aud");
        let token = keys.sign_challenge(Uuid::new_v4(), "K7Q2XM4A").unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(claims.challenge.as_deref(), Some("K7Q2XM4A"));
    }

    #[test]
    fn verify_refresh_rejects_access_token() {
        let keys = keys("iss", "aud");
        let token = keys.sign_access(Uuid::new_v4()).expect("sign access");
        let err = keys.verify_refresh(&token).unwrap_err();
        assert!(err.to_string().contains("not a refresh token"));
        let refresh = keys.sign_refresh(Uuid::new_v4()).unwrap();
        assert!(keys.verify_refresh(&refresh).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_issuer_or_audience() {
        let token = keys("good-iss", "good-aud").sign_access(Uuid::new_v4()).unwrap();
        assert!(keys("bad-iss", "good-aud").verify(&token).is_err());
        assert!(keys("good-iss", "bad-aud").verify(&token).is_err());
    }
}
