//! Account feed backed by the `accounts` table and Postgres LISTEN/NOTIFY.
//!
//! A trigger on `accounts` sends the changed `user_id` on [`ACCOUNT_CHANNEL`].
//! One listener task per process fans those ids out; each subscription re-reads
//! its row whenever its id shows up, and after every listener reconnect.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    error::AccessError,
    feed::{AccountFeed, FeedEvent, FeedSubscription},
    record::{AccountRow, AccountSnapshot},
};
use crate::config::FeedConfig;

/// NOTIFY channel of the `accounts` trigger in `migrations/`.
pub const ACCOUNT_CHANNEL: &str = "account_changed";

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Account(Uuid),
    /// The listener (re)connected; notifications may have been missed.
    Resync,
}

/// Maps one listener read to a change. `None` payload means the connection dropped.
fn change_for(payload: Option<&str>) -> Option<Change> {
    let Some(payload) = payload else {
        return Some(Change::Resync);
    };
    match Uuid::parse_str(payload) {
        Ok(id) => Some(Change::Account(id)),
        Err(_) => {
            warn!(payload, "ignoring bad account notification");
            None
        }
    }
}

pub struct PgAccountFeed {
    pool: PgPool,
    changes: broadcast::Sender<Change>,
    retry: Duration,
}

impl PgAccountFeed {
    /// Builds the feed and spawns its listener task.
    pub fn start(pool: PgPool, config: &FeedConfig) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let feed = Arc::new(Self {
            pool: pool.clone(),
            changes: changes.clone(),
            retry: config.retry(),
        });
        tokio::spawn(listen_loop(pool, changes, config.retry()));
        feed
    }
}

async fn listen_loop(pool: PgPool, changes: broadcast::Sender<Change>, retry: Duration) {
    loop {
        if let Err(e) = listen(&pool, &changes).await {
            error!(error = %e, channel = ACCOUNT_CHANNEL, "account listener failed; reconnecting");
        }
        tokio::time::sleep(retry).await;
    }
}

async fn listen(pool: &PgPool, changes: &broadcast::Sender<Change>) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(ACCOUNT_CHANNEL).await?;
    info!(channel = ACCOUNT_CHANNEL, "listening for account changes");
    let _ = changes.send(Change::Resync);

    loop {
        // try_recv surfaces a dropped connection as Ok(None) and reconnects on the next call
        let notification = listener.try_recv().await?;
        if notification.is_none() {
            warn!(channel = ACCOUNT_CHANNEL, "account listener connection lost");
        }
        // no receivers just means no open guards
        if let Some(change) = change_for(notification.as_ref().map(|n| n.payload())) {
            let _ = changes.send(change);
        }
    }
}

pub(crate) async fn read_snapshot(
    pool: &PgPool,
    identity: Uuid,
) -> Result<AccountSnapshot, AccessError> {
    let row = sqlx::query_as::<_, AccountRow>(
        r#"
        SELECT is_paid, subscription_status, trial_started_at, paid_at
        FROM accounts
        WHERE user_id = $1
        "#,
    )
    .bind(identity)
    .fetch_optional(pool)
    .await
    .map_err(|e| AccessError::FeedUnavailable(e.to_string()))?;

    Ok(row.map(AccountSnapshot::from).unwrap_or_else(AccountSnapshot::missing))
}

/// Read, send, wait for a reason to read again. Returns when either side goes away.
async fn follow<R, Fut>(
    identity: Uuid,
    mut read: R,
    mut changes: broadcast::Receiver<Change>,
    events: mpsc::UnboundedSender<FeedEvent>,
    retry: Duration,
) where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<AccountSnapshot, AccessError>>,
{
    loop {
        let event = match read().await {
            Ok(snapshot) => FeedEvent::Snapshot(snapshot),
            Err(e) => FeedEvent::Failed(e),
        };
        let failed = matches!(event, FeedEvent::Failed(_));
        if events.send(event).is_err() {
            return;
        }
        if failed {
            tokio::time::sleep(retry).await;
            continue;
        }

        loop {
            match changes.recv().await {
                Ok(Change::Account(id)) if id == identity => break,
                Ok(Change::Account(_)) => continue,
                Ok(Change::Resync) | Err(broadcast::error::RecvError::Lagged(_)) => break,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[async_trait]
impl AccountFeed for PgAccountFeed {
    fn subscribe(&self, identity: Uuid, epoch: u64) -> FeedSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // subscribe before the first read so no change slips in between
        let changes = self.changes.subscribe();
        let pool = self.pool.clone();
        let read = move || {
            let pool = pool.clone();
            async move { read_snapshot(&pool, identity).await }
        };
        let task = tokio::spawn(follow(identity, read, changes, tx, self.retry));

        debug!(user_id = %identity, epoch, "account feed subscribed");
        let abort = task.abort_handle();
        FeedSubscription::new(epoch, rx, move || {
            abort.abort();
            debug!(user_id = %identity, epoch, "account feed unsubscribed");
        })
    }

    async fn fetch(&self, identity: Uuid) -> Result<AccountSnapshot, AccessError> {
        read_snapshot(&self.pool, identity).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use tokio::task::JoinHandle;

    use super::*;

    const RETRY: Duration = Duration::from_secs(2);

    type Reads = Arc<Mutex<VecDeque<Result<AccountSnapshot, AccessError>>>>;

    /// Starts `follow` over scripted reads. Once the script runs out every read is an active account.
    fn start(
        identity: Uuid,
        script: Vec<Result<AccountSnapshot, AccessError>>,
        capacity: usize,
    ) -> (
        broadcast::Sender<Change>,
        mpsc::UnboundedReceiver<FeedEvent>,
        Reads,
        JoinHandle<()>,
    ) {
        let reads: Reads = Arc::new(Mutex::new(script.into()));
        let (changes, receiver) = broadcast::channel(capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        let source = reads.clone();
        let read = move || {
            let next = source
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(AccountSnapshot::with_status(true, "active")));
            async move { next }
        };
        let task = tokio::spawn(follow(identity, read, receiver, tx, RETRY));
        (changes, rx, reads, task)
    }

    fn snapshot(paid: bool, status: &str) -> FeedEvent {
        FeedEvent::Snapshot(AccountSnapshot::with_status(paid, status))
    }

    #[tokio::test]
    async fn rereads_only_for_its_own_account() {
        let id = Uuid::new_v4();
        let (changes, mut rx, _, _task) = start(
            id,
            vec![
                Ok(AccountSnapshot::with_status(false, "pending_payment")),
                Ok(AccountSnapshot::with_status(true, "active")),
            ],
            16,
        );
        assert_eq!(rx.recv().await, Some(snapshot(false, "pending_payment")));

        changes.send(Change::Account(Uuid::new_v4())).unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        changes.send(Change::Account(id)).unwrap();
        assert_eq!(rx.recv().await, Some(snapshot(true, "active")));
    }

    #[tokio::test]
    async fn rereads_after_listener_resync() {
        let id = Uuid::new_v4();
        let (changes, mut rx, _, _task) = start(
            id,
            vec![Ok(AccountSnapshot::trial(time::OffsetDateTime::UNIX_EPOCH))],
            16,
        );
        rx.recv().await.unwrap();

        changes.send(Change::Resync).unwrap();
        assert_eq!(rx.recv().await, Some(snapshot(true, "active")));
    }

    #[tokio::test]
    async fn rereads_when_it_fell_behind() {
        let id = Uuid::new_v4();
        let (changes, mut rx, _, _task) = start(
            id,
            vec![Ok(AccountSnapshot::with_status(false, "pending_payment"))],
            1,
        );
        rx.recv().await.unwrap();

        // both land before the task runs, so the first is overwritten
        changes.send(Change::Account(Uuid::new_v4())).unwrap();
        changes.send(Change::Account(Uuid::new_v4())).unwrap();
        assert_eq!(rx.recv().await, Some(snapshot(true, "active")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_is_retried_after_the_interval() {
        let id = Uuid::new_v4();
        let (_changes, mut rx, reads, _task) = start(
            id,
            vec![
                Err(AccessError::FeedUnavailable("connection refused".into())),
                Ok(AccountSnapshot::with_status(true, "active")),
            ],
            16,
        );
        let started = tokio::time::Instant::now();
        assert_eq!(
            rx.recv().await,
            Some(FeedEvent::Failed(AccessError::FeedUnavailable(
                "connection refused".into()
            )))
        );
        assert_eq!(rx.recv().await, Some(snapshot(true, "active")));
        assert!(started.elapsed() >= RETRY);
        assert!(reads.lock().is_empty());
    }

    #[tokio::test]
    async fn stops_when_the_listener_is_gone() {
        let (changes, mut rx, _, task) = start(Uuid::new_v4(), Vec::new(), 16);
        rx.recv().await.unwrap();
        drop(changes);
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn stops_when_the_subscription_is_dropped() {
        let id = Uuid::new_v4();
        let (changes, rx, _, task) = start(id, Vec::new(), 16);
        drop(rx);
        changes.send(Change::Account(id)).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn dropped_connection_means_resync() {
        let id = Uuid::new_v4();
        assert_eq!(change_for(None), Some(Change::Resync));
        assert_eq!(
            change_for(Some(id.to_string().as_str())),
            Some(Change::Account(id))
        );
        assert_eq!(change_for(Some("not-a-uuid")), None);
    }

    #[test]
    fn trigger_notifies_on_the_listened_channel() {
        let migration = include_str!("../../migrations/0001_users_and_accounts.sql");
        let notify = format!("pg_notify('{ACCOUNT_CHANNEL}'");
        assert_eq!(migration.matches(&notify).count(), 2);
        assert_eq!(migration.matches("pg_notify(").count(), 2);
    }
}
