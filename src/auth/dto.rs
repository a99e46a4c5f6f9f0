use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Request body for token refresh.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Request body for the PIN challenge.
#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub email: String,
    pub pin: String,
}

#[derive(Debug, Deserialize)]
pub struct PinEnrollRequest {
    pub pin: String,
}

/// Response returned after login, register or refresh.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: PublicUser,
}

/// A PIN sign-in gets an access token only; it cannot be refreshed.
#[derive(Debug, Serialize)]
pub struct PinResponse {
    pub access_token: String,
    pub challenge_code: String,
    pub user: PublicUser,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
}
