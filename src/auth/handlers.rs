use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use super::{
    dto::{
        AuthResponse, LoginRequest, PinEnrollRequest, PinRequest, PinResponse, PublicUser,
        RefreshRequest, RegisterRequest,
    },
    extractors::AuthUser,
    jwt::JwtKeys,
    repo::User,
    secret::{
        challenge_code, hash_secret, is_valid_email, is_valid_pin, normalize_email, verify_secret,
    },
};
use crate::{error::ApiError, state::AppState};

const MIN_PASSWORD_LEN: usize = 8;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/pin", post(pin_challenge))
        .route("/auth/pin/enroll", post(enroll_pin))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn checked_email(raw: &str) -> Result<String, ApiError> {
    let email = normalize_email(raw);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(ApiError::BadRequest("invalid email"));
    }
    Ok(email)
}

fn token_pair(state: &AppState, user: User) -> Result<Json<AuthResponse>, ApiError> {
    let keys = JwtKeys::from_ref(state);
    Ok(Json(AuthResponse {
        access_token: keys.sign_access(user.id)?,
        refresh_token: keys.sign_refresh(user.id)?,
        user: PublicUser {
            id: user.id,
            email: user.email,
        },
    }))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = checked_email(&payload.email)?;
    if payload.password.len() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(ApiError::BadRequest("password too short"));
    }
    if User::find_by_email(&state.db, &email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(ApiError::Conflict);
    }

    let hash = hash_secret(&payload.password)?;
    let user = User::create(&state.db, &email, &hash).await?;
    info!(user_id = %user.id, email = %user.email, "user registered");
    token_pair(&state, user)
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = checked_email(&payload.email)?;
    let Some(user) = User::find_by_email(&state.db, &email).await? else {
        warn!(email = %email, "login unknown email");
        return Err(ApiError::Unauthorized("invalid credentials"));
    };
    if !verify_secret(&payload.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::Unauthorized("invalid credentials"));
    }

    info!(user_id = %user.id, "user logged in");
    token_pair(&state, user)
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let claims = JwtKeys::from_ref(&state)
        .verify_refresh(&payload.refresh_token)
        .map_err(|e| {
            warn!(error = %e, "refresh rejected");
            ApiError::Unauthorized("invalid refresh token")
        })?;
    let user = User::find_by_id(&state.db, claims.sub)
        .await?
        .ok_or(ApiError::Unauthorized("user not found"))?;
    token_pair(&state, user)
}

/// A user without a PIN fails the same way as a wrong PIN.
fn check_pin(user: &User, pin: &str) -> Result<(), ApiError> {
    let Some(pin_hash) = user.pin_hash.as_deref() else {
        warn!(user_id = %user.id, "pin challenge without enrolled pin");
        return Err(ApiError::Unauthorized("invalid credentials"));
    };
    if !verify_secret(pin, pin_hash)? {
        warn!(user_id = %user.id, "pin challenge failed");
        return Err(ApiError::Unauthorized("invalid credentials"));
    }
    Ok(())
}

/// Secondary sign-in path: email plus a short numeric PIN.
#[instrument(skip(state, payload))]
pub async fn pin_challenge(
    State(state): State<AppState>,
    Json(payload): Json<PinRequest>,
) -> Result<Json<PinResponse>, ApiError> {
    let email = checked_email(&payload.email)?;
    if !is_valid_pin(&payload.pin) {
        return Err(ApiError::BadRequest("pin must be 4 to 8 digits"));
    }
    let Some(user) = User::find_by_email(&state.db, &email).await? else {
        warn!(email = %email, "pin challenge unknown email");
        return Err(ApiError::Unauthorized("invalid credentials"));
    };
    check_pin(&user, &payload.pin)?;

    let code = challenge_code();
    let access_token = JwtKeys::from_ref(&state).sign_challenge(user.id, &code)?;
    info!(user_id = %user.id, "pin challenge passed");
    Ok(Json(PinResponse {
        access_token,
        challenge_code: code,
        user: PublicUser {
            id: user.id,
            email: user.email,
        },
    }))
}

#[instrument(skip(state, payload))]
pub async fn enroll_pin(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(payload): Json<PinEnrollRequest>,
) -> Result<StatusCode, ApiError> {
    if !is_valid_pin(&payload.pin) {
        return Err(ApiError::BadRequest("pin must be 4 to 8 digits"));
    }
    let hash = hash_secret(&payload.pin)?;
    User::set_pin_hash(&state.db, identity.id, &hash).await?;
    info!(user_id = %identity.id, "pin enrolled");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<PublicUser>, ApiError> {
    let user = User::find_by_id(&state.db, identity.id)
        .await?
        .ok_or(ApiError::Unauthorized("user not found"))?;
    Ok(Json(PublicUser {
        id: user.id,
        email: user.email,
    }))
}
