//! Pure mapping from an account record and the current time to an access decision.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::record::{AccountRecord, SubscriptionStatus};

/// How long an unpaid trial account keeps access after `trial_started_at`.
// Fixed for every plan for now; a per-plan window would be read from the record.
pub const TRIAL_WINDOW: Duration = Duration::days(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Grant,
    RedirectToPayment,
    /// Payment surface only: the account is already entitled.
    RedirectToDashboard,
    /// No usable data yet. Show loading and decide nothing.
    Indeterminate,
}

/// Which page a guard protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardRole {
    #[serde(rename = "dashboard")]
    Dashboard,
    #[serde(rename = "payment")]
    PaymentSurface,
    #[serde(rename = "subscription")]
    GeneralSubscription,
}

impl GuardRole {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardRole::Dashboard => "dashboard",
            GuardRole::PaymentSurface => "payment",
            GuardRole::GeneralSubscription => "subscription",
        }
    }

    fn paid_rule(self) -> PaidRule {
        match self {
            GuardRole::GeneralSubscription => PaidRule::NotPending,
            GuardRole::Dashboard | GuardRole::PaymentSurface => PaidRule::ActiveOnly,
        }
    }
}

/// When a record with `is_paid == true` counts as entitled.
///
/// The dashboard requires `active`; general subscription pages accept anything
/// that is not `pending_payment`. The two rules disagree for paid records in
/// `trial` or an unknown status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaidRule {
    ActiveOnly,
    NotPending,
}

impl PaidRule {
    fn entitles(self, status: &SubscriptionStatus) -> bool {
        match self {
            PaidRule::ActiveOnly => *status == SubscriptionStatus::Active,
            PaidRule::NotPending => *status != SubscriptionStatus::PendingPayment,
        }
    }
}

/// Dashboard-context evaluation.
pub fn evaluate(record: Option<&AccountRecord>, now: OffsetDateTime) -> AccessDecision {
    evaluate_with(record, now, PaidRule::ActiveOnly)
}

/// Evaluation as seen by a guard of the given role.
pub fn evaluate_for(
    role: GuardRole,
    record: Option<&AccountRecord>,
    now: OffsetDateTime,
) -> AccessDecision {
    match evaluate_with(record, now, role.paid_rule()) {
        AccessDecision::Grant if role == GuardRole::PaymentSurface => {
            AccessDecision::RedirectToDashboard
        }
        decision => decision,
    }
}

fn evaluate_with(
    record: Option<&AccountRecord>,
    now: OffsetDateTime,
    paid_rule: PaidRule,
) -> AccessDecision {
    let Some(record) = record else {
        return AccessDecision::Indeterminate;
    };

    if record.is_paid && paid_rule.entitles(&record.subscription_status) {
        return AccessDecision::Grant;
    }
    if record.in_trial() && !record.trial_expired(now) {
        return AccessDecision::Grant;
    }
    // expired trial, pending payment, or nothing entitling
    AccessDecision::RedirectToPayment
}
