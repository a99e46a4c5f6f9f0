//! Subscription and trial access control for the protected farm dashboard.

pub mod error;
pub mod feed;
pub mod guard;
pub mod handlers;
pub mod identity;
pub mod pg_feed;
pub mod policy;
pub mod record;
pub mod report;

use crate::state::AppState;
use axum::Router;

pub use error::AccessError;
pub use policy::{evaluate, evaluate_for, AccessDecision, GuardRole, TRIAL_WINDOW};

pub fn router() -> Router<AppState> {
    handlers::access_routes()
}
