use std::fmt;

use sqlx::FromRow;
use time::OffsetDateTime;

use super::error::AccessError;
use super::policy::TRIAL_WINDOW;

/// Billing state written into the account record by the billing integration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PendingPayment,
    /// Any value the policy does not know about.
    Other(String),
    Unset,
}

impl SubscriptionStatus {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::Unset,
            Some("trial") => Self::Trial,
            Some("active") => Self::Active,
            Some("pending_payment") => Self::PendingPayment,
            Some(other) => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PendingPayment => "pending_payment",
            Self::Other(s) => s,
            Self::Unset => "",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated account record. Only ever read by this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub is_paid: bool,
    pub subscription_status: SubscriptionStatus,
    pub trial_started_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

impl AccountRecord {
    pub fn in_trial(&self) -> bool {
        self.subscription_status == SubscriptionStatus::Trial
    }

    /// End of the trial window, if the record is on a trial with a known start.
    pub fn trial_ends_at(&self) -> Option<OffsetDateTime> {
        if !self.in_trial() {
            return None;
        }
        self.trial_started_at.map(|started| started + TRIAL_WINDOW)
    }

    /// Elapsed time is measured from the stored trial start, never from a cached value.
    pub fn trial_expired(&self, now: OffsetDateTime) -> bool {
        match self.trial_started_at {
            Some(started) if self.in_trial() => now - started > TRIAL_WINDOW,
            _ => false,
        }
    }
}

/// One immutable read of an account record as the store delivered it.
///
/// Fields are optional because the store is schemaless from our point of view;
/// [`AccountSnapshot::into_record`] decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub exists: bool,
    pub is_paid: Option<bool>,
    pub subscription_status: Option<String>,
    pub trial_started_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

impl AccountSnapshot {
    /// Snapshot for an identity that has no record at all.
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn trial(started_at: OffsetDateTime) -> Self {
        Self {
            exists: true,
            is_paid: Some(false),
            subscription_status: Some("trial".into()),
            trial_started_at: Some(started_at),
            paid_at: None,
        }
    }

    pub fn with_status(is_paid: bool, status: &str) -> Self {
        Self {
            exists: true,
            is_paid: Some(is_paid),
            subscription_status: Some(status.into()),
            trial_started_at: None,
            paid_at: None,
        }
    }

    /// `Ok(None)` when the record does not exist.
    pub fn into_record(self) -> Result<Option<AccountRecord>, AccessError> {
        if !self.exists {
            return Ok(None);
        }
        let is_paid = self
            .is_paid
            .ok_or(AccessError::MalformedRecord("is_paid"))?;
        Ok(Some(AccountRecord {
            is_paid,
            subscription_status: SubscriptionStatus::parse(self.subscription_status.as_deref()),
            trial_started_at: self.trial_started_at,
            paid_at: self.paid_at,
        }))
    }
}

/// Row shape of the `accounts` table.
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub is_paid: Option<bool>,
    pub subscription_status: Option<String>,
    pub trial_started_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

impl From<AccountRow> for AccountSnapshot {
    fn from(row: AccountRow) -> Self {
        Self {
            exists: true,
            is_paid: row.is_paid,
            subscription_status: row.subscription_status,
            trial_started_at: row.trial_started_at,
            paid_at: row.paid_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn missing_snapshot_has_no_record() {
        assert_eq!(AccountSnapshot::missing().into_record(), Ok(None));
    }

    #[test]
    fn snapshot_without_paid_flag_is_malformed() {
        let snapshot = AccountSnapshot {
            exists: true,
            subscription_status: Some("active".into()),
            ..AccountSnapshot::default()
        };
        assert_eq!(
            snapshot.into_record(),
            Err(AccessError::MalformedRecord("is_paid"))
        );
    }

    #[test]
    fn unknown_status_is_kept_as_other() {
        let record = AccountSnapshot::with_status(false, "cancelled")
            .into_record()
            .unwrap()
            .unwrap();
        assert_eq!(
            record.subscription_status,
            SubscriptionStatus::Other("cancelled".into())
        );
        assert_eq!(SubscriptionStatus::parse(Some("  ")), SubscriptionStatus::Unset);
    }

    #[test]
    fn trial_end_is_two_days_after_start() {
        let started = datetime!(2024-03-01 08:00 UTC);
        let record = AccountSnapshot::trial(started).into_record().unwrap().unwrap();
        assert_eq!(record.trial_ends_at(), Some(datetime!(2024-03-03 08:00 UTC)));
        assert!(!record.trial_expired(datetime!(2024-03-03 08:00 UTC)));
        assert!(record.trial_expired(datetime!(2024-03-03 08:00:01 UTC)));
    }

    #[test]
    fn trial_without_start_never_expires() {
        let record = AccountSnapshot::with_status(false, "trial")
            .into_record()
            .unwrap()
            .unwrap();
        assert_eq!(record.trial_ends_at(), None);
        assert!(!record.trial_expired(datetime!(2030-01-01 00:00 UTC)));
    }
}
