use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Account record change notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Pause before re-reading after a failed read or listener error.
    pub retry_ms: u64,
}

impl FeedConfig {
    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { retry_ms: 2_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub feed: FeedConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "farmgate".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "farmgate-users".into()),
            ttl_minutes: env_or("JWT_TTL_MINUTES", 60),
            refresh_ttl_minutes: env_or("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 14),
        };
        let feed = FeedConfig {
            retry_ms: env_or("ACCOUNT_FEED_RETRY_MS", FeedConfig::default().retry_ms),
        };
        Ok(Self {
            database_url,
            jwt,
            feed,
        })
    }
}
