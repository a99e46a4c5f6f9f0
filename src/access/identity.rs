//! Who is signed in, shared with every guard mounted under one session root.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;
use uuid::Uuid;

/// Which path produced the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Provider,
    PinChallenge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: Uuid,
    pub source: IdentitySource,
    /// Code of the secondary challenge this identity came through, if any.
    pub challenge_code: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl Identity {
    pub fn provider(id: Uuid) -> Self {
        Self {
            id,
            source: IdentitySource::Provider,
            challenge_code: None,
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStatus {
    /// The identity provider has not answered yet.
    Pending,
    SignedOut,
    SignedIn(Identity),
}

impl IdentityStatus {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            IdentityStatus::SignedIn(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Single writer, many readers. Built at a session root and torn down with it.
pub struct IdentityState {
    tx: Arc<watch::Sender<IdentityStatus>>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl IdentityState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(IdentityStatus::Pending);
        Self {
            tx: Arc::new(tx),
            expiry: Mutex::new(None),
        }
    }

    pub fn current(&self) -> IdentityStatus {
        self.tx.borrow().clone()
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.tx.borrow().identity().cloned()
    }

    /// Readers see the current status immediately and every change after it.
    pub fn subscribe(&self) -> watch::Receiver<IdentityStatus> {
        self.tx.subscribe()
    }

    pub fn sign_in(&self, identity: Identity) {
        self.cancel_expiry();
        debug!(user_id = %identity.id, source = ?identity.source, "identity signed in");
        self.tx.send_replace(IdentityStatus::SignedIn(identity));
    }

    pub fn sign_out(&self) {
        self.cancel_expiry();
        let previous = self.tx.send_replace(IdentityStatus::SignedOut);
        if let Some(identity) = previous.identity() {
            debug!(user_id = %identity.id, "identity signed out");
        }
    }

    /// Signs the current identity out at `deadline`, unless a different
    /// identity has signed in by then. Must be called inside a tokio runtime.
    pub fn expire_at(&self, deadline: OffsetDateTime) {
        let Some(identity) = self.current_identity() else {
            return;
        };
        let wait = std::time::Duration::try_from(deadline - OffsetDateTime::now_utc())
            .unwrap_or_default();
        let tx = Arc::clone(&self.tx);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            tx.send_if_modified(|status| match status.identity() {
                Some(current) if current.id == identity.id => {
                    debug!(user_id = %identity.id, "identity expired");
                    *status = IdentityStatus::SignedOut;
                    true
                }
                _ => false,
            });
        });
        if let Some(old) = self.expiry.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn teardown(&self) {
        self.sign_out();
    }

    fn cancel_expiry(&self) {
        if let Some(handle) = self.expiry.lock().take() {
            handle.abort();
        }
    }
}

impl Default for IdentityState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IdentityState {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn starts_pending_and_tracks_sign_in() {
        let state = IdentityState::new();
        assert_eq!(state.current(), IdentityStatus::Pending);

        let identity = Identity::provider(Uuid::new_v4());
        state.sign_in(identity.clone());
        assert_eq!(state.current_identity(), Some(identity));

        state.sign_out();
        assert_eq!(state.current(), IdentityStatus::SignedOut);
    }

    #[tokio::test]
    async fn readers_observe_changes() {
        let state = IdentityState::new();
        let mut rx = state.subscribe();
        let id = Uuid::new_v4();
        state.sign_in(Identity::provider(id));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().identity().map(|i| i.id), Some(id));
    }

    #[tokio::test]
    async fn drop_signs_out_readers() {
        let state = IdentityState::new();
        state.sign_in(Identity::provider(Uuid::new_v4()));
        let rx = state.subscribe();
        drop(state);
        assert_eq!(*rx.borrow(), IdentityStatus::SignedOut);
    }

    #[tokio::test]
    async fn expiry_signs_out_only_the_expiring_identity() {
        let state = IdentityState::new();
        let mut rx = state.subscribe();
        state.sign_in(Identity::provider(Uuid::new_v4()));
        state.expire_at(OffsetDateTime::now_utc() - Duration::seconds(1));
        rx.changed().await.unwrap();
        loop {
            if *rx.borrow_and_update() == IdentityStatus::SignedOut {
                break;
            }
            rx.changed().await.unwrap();
        }

        let next = Identity::provider(Uuid::new_v4());
        state.sign_in(next.clone());
        state.expire_at(OffsetDateTime::now_utc() + Duration::hours(1));
        assert_eq!(state.current_identity(), Some(next));
    }
}
