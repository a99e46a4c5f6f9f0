use thiserror::Error;

/// Failures the access engine can observe. None of them ever grants access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// Transport or read error from the account store.
    #[error("account feed unavailable: {0}")]
    FeedUnavailable(String),
    /// The record exists but is missing a field the policy needs.
    #[error("malformed account record: missing {0}")]
    MalformedRecord(&'static str),
    /// The signed-in identity went away while a guard was listening.
    #[error("identity lost")]
    IdentityLost,
}
