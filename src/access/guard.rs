//! One guard state machine, configured per page role.
//!
//! The controller itself is synchronous: it is fed identity changes and feed
//! events and answers with [`GuardFrame`]s. [`GuardController::run`] drives it
//! from a live identity watch and account subscription.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    error::AccessError,
    feed::{AccountFeed, FeedEvent, FeedSubscription},
    identity::IdentityStatus,
    policy::{evaluate_for, AccessDecision, GuardRole},
    record::{AccountRecord, AccountSnapshot},
    report::ErrorReporter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Dashboard,
    Payment,
    Login,
}

impl Route {
    pub fn path(self) -> &'static str {
        match self {
            Route::Dashboard => "/dashboard",
            Route::Payment => "/payment",
            Route::Login => "/login",
        }
    }
}

pub trait Navigator: Send + Sync {
    fn navigate(&self, route: Route);
}

/// Records navigations in the log; the frame itself carries the route to the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNavigator;

impl Navigator for TracingNavigator {
    fn navigate(&self, route: Route) {
        info!(route = route.path(), "guard navigation");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "decision", rename_all = "snake_case")]
pub enum GuardPhase {
    /// No identity yet.
    Unresolved,
    /// Subscribed, waiting for the first snapshot.
    Loading,
    Decided(AccessDecision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardView {
    Loading,
    Children,
    Nothing,
}

/// What the last decision was based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Basis {
    Nothing,
    SignedOut,
    Record,
    /// Snapshot arrived and there is no usable record.
    Absent,
    /// The feed failed.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardFrame {
    pub role: GuardRole,
    pub epoch: u64,
    pub phase: GuardPhase,
    pub view: GuardView,
    pub navigate: Option<Route>,
}

struct Reading {
    basis: Basis,
    record: Option<AccountRecord>,
    error: Option<AccessError>,
}

impl From<FeedEvent> for Reading {
    fn from(event: FeedEvent) -> Self {
        let (basis, record, error) = match event {
            FeedEvent::Snapshot(snapshot) => match snapshot.into_record() {
                Ok(Some(record)) => (Basis::Record, Some(record), None),
                Ok(None) => (Basis::Absent, None, None),
                Err(e) => (Basis::Absent, None, Some(e)),
            },
            FeedEvent::Failed(e) => (Basis::Unavailable, None, Some(e)),
        };
        Self {
            basis,
            record,
            error,
        }
    }
}

fn outcome(role: GuardRole, phase: GuardPhase, basis: Basis) -> (GuardView, Option<Route>) {
    match phase {
        GuardPhase::Unresolved if basis == Basis::SignedOut => {
            (GuardView::Nothing, Some(Route::Login))
        }
        GuardPhase::Unresolved | GuardPhase::Loading => (GuardView::Loading, None),
        GuardPhase::Decided(decision) => match decision {
            // never-provisioned identities are sent home instead of waiting forever
            AccessDecision::Indeterminate
                if role == GuardRole::GeneralSubscription && basis == Basis::Absent =>
            {
                (GuardView::Nothing, Some(Route::Dashboard))
            }
            AccessDecision::Indeterminate => (GuardView::Loading, None),
            AccessDecision::Grant => (GuardView::Children, None),
            AccessDecision::RedirectToDashboard => (GuardView::Nothing, Some(Route::Dashboard)),
            AccessDecision::RedirectToPayment if role == GuardRole::PaymentSurface => {
                (GuardView::Children, None)
            }
            AccessDecision::RedirectToPayment => (GuardView::Nothing, Some(Route::Payment)),
        },
    }
}

/// Decides once from a single read, for callers that do not keep listening.
pub fn settle(
    role: GuardRole,
    read: Result<AccountSnapshot, AccessError>,
    reporter: &dyn ErrorReporter,
    now: OffsetDateTime,
) -> GuardFrame {
    let event = match read {
        Ok(snapshot) => FeedEvent::Snapshot(snapshot),
        Err(e) => FeedEvent::Failed(e),
    };
    let reading = Reading::from(event);
    if let Some(error) = &reading.error {
        reporter.report_error(role.as_str(), error);
    }
    let phase = GuardPhase::Decided(evaluate_for(role, reading.record.as_ref(), now));
    let (view, navigate) = outcome(role, phase, reading.basis);
    GuardFrame {
        role,
        epoch: 0,
        phase,
        view,
        navigate,
    }
}

pub struct GuardController {
    role: GuardRole,
    feed: Arc<dyn AccountFeed>,
    reporter: Arc<dyn ErrorReporter>,
    epoch: u64,
    identity: Option<Uuid>,
    subscription: Option<FeedSubscription>,
    phase: GuardPhase,
    basis: Basis,
    record: Option<AccountRecord>,
    last_route: Option<Route>,
}

impl GuardController {
    pub fn new(
        role: GuardRole,
        feed: Arc<dyn AccountFeed>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            role,
            feed,
            reporter,
            epoch: 0,
            identity: None,
            subscription: None,
            phase: GuardPhase::Unresolved,
            basis: Basis::Nothing,
            record: None,
            last_route: None,
        }
    }

    pub fn phase(&self) -> GuardPhase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn identity(&self) -> Option<Uuid> {
        self.identity
    }

    pub fn is_listening(&self) -> bool {
        self.subscription.is_some()
    }

    /// Closes the feed of the previous identity before opening one for the next.
    pub fn handle_identity(&mut self, status: &IdentityStatus) -> Option<GuardFrame> {
        let next = status.identity().map(|identity| identity.id);
        if next.is_some() && next == self.identity && self.subscription.is_some() {
            return None;
        }
        if next != self.identity {
            self.last_route = None;
        }
        if next.is_none() && self.subscription.is_some() {
            self.reporter
                .report_error(self.role.as_str(), &AccessError::IdentityLost);
        }

        self.close_feed();
        match next {
            Some(id) => {
                self.subscription = Some(self.feed.subscribe(id, self.epoch));
                self.identity = Some(id);
                self.phase = GuardPhase::Loading;
                self.basis = Basis::Nothing;
            }
            None => {
                self.phase = GuardPhase::Unresolved;
                self.basis = match status {
                    IdentityStatus::SignedOut => Basis::SignedOut,
                    _ => Basis::Nothing,
                };
            }
        }
        debug!(role = self.role.as_str(), epoch = self.epoch, identity = ?self.identity, "guard identity changed");
        Some(self.frame())
    }

    /// Events from any epoch but the current one are dropped.
    pub fn handle_event(
        &mut self,
        epoch: u64,
        event: FeedEvent,
        now: OffsetDateTime,
    ) -> Option<GuardFrame> {
        if epoch != self.epoch || self.subscription.is_none() {
            debug!(role = self.role.as_str(), epoch, current = self.epoch, "dropping stale account event");
            return None;
        }

        let reading = Reading::from(event);
        if let Some(error) = &reading.error {
            self.reporter.report_error(self.role.as_str(), error);
        }
        self.basis = reading.basis;
        self.record = reading.record;
        self.phase = GuardPhase::Decided(evaluate_for(self.role, self.record.as_ref(), now));
        Some(self.frame())
    }

    /// Re-runs the policy against the last record. Returns a frame only if the decision moved.
    pub fn reevaluate(&mut self, now: OffsetDateTime) -> Option<GuardFrame> {
        let GuardPhase::Decided(previous) = self.phase else {
            return None;
        };
        let decision = evaluate_for(self.role, self.record.as_ref(), now);
        if decision == previous {
            return None;
        }
        self.phase = GuardPhase::Decided(decision);
        Some(self.frame())
    }

    /// Next instant the decision can change without a new snapshot: just past the trial end.
    pub fn next_deadline(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        if !matches!(self.phase, GuardPhase::Decided(_)) {
            return None;
        }
        let ends = self.record.as_ref()?.trial_ends_at()?;
        (ends >= now).then_some(ends + Duration::seconds(1))
    }

    pub fn teardown(&mut self) {
        self.close_feed();
        self.phase = GuardPhase::Unresolved;
        self.basis = Basis::Nothing;
        self.last_route = None;
    }

    /// Drives the controller until the frame receiver goes away or the identity root is torn down.
    pub async fn run(
        mut self,
        mut identities: watch::Receiver<IdentityStatus>,
        navigator: Arc<dyn Navigator>,
        frames: mpsc::Sender<GuardFrame>,
    ) {
        let status = identities.borrow_and_update().clone();
        let mut pending = self.handle_identity(&status);

        loop {
            if let Some(frame) = pending.take() {
                if let Some(route) = frame.navigate {
                    navigator.navigate(route);
                }
                if frames.send(frame).await.is_err() {
                    break;
                }
            }

            let wait = self
                .next_deadline(OffsetDateTime::now_utc())
                .map(until);
            tokio::select! {
                changed = identities.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = identities.borrow_and_update().clone();
                    pending = self.handle_identity(&status);
                }
                Some((epoch, event)) = next_event(&mut self.subscription) => {
                    pending = self.handle_event(epoch, event, OffsetDateTime::now_utc());
                }
                _ = sleep_for(wait) => {
                    pending = self.reevaluate(OffsetDateTime::now_utc());
                }
                _ = frames.closed() => break,
            }
        }

        self.teardown();
        debug!(role = self.role.as_str(), "guard stopped");
    }

    fn close_feed(&mut self) {
        // dropping the subscription unsubscribes before anything new is opened
        self.subscription = None;
        self.identity = None;
        self.record = None;
        self.epoch += 1;
    }

    fn frame(&mut self) -> GuardFrame {
        let (view, route) = outcome(self.role, self.phase, self.basis);
        let navigate = match route {
            Some(route) if self.last_route == Some(route) => None,
            other => other,
        };
        self.last_route = route;
        GuardFrame {
            role: self.role,
            epoch: self.epoch,
            phase: self.phase,
            view,
            navigate,
        }
    }
}

async fn next_event(subscription: &mut Option<FeedSubscription>) -> Option<(u64, FeedEvent)> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_for(wait: Option<std::time::Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

fn until(deadline: OffsetDateTime) -> std::time::Duration {
    std::time::Duration::try_from(deadline - OffsetDateTime::now_utc()).unwrap_or_default()
}
