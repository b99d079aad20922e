//! Container lifecycle tracker.
//!
//! Holds the client's belief about whether the current user has a live
//! container for the displayed challenge, keeps it aligned with the server
//! through a periodic reconciliation poll, and drives a one-second
//! countdown to the container's expiry.
//!
//! Phases: `NoContainer -> Starting -> Active -> Stopping -> NoContainer`.
//! `Active` also falls back to `NoContainer` when the countdown reaches
//! zero or a poll reports no matching container; that transition is
//! idempotent and cancels both timers.

use crate::api::{ChallengeInfo, ContainerReport, FlagVerdict, PlatformApi};
use crate::clock::{Clock, SystemClock};
use crate::config::TrackerSettings;
use crate::error::{ApiError, TrackerError};
use crate::session::{ChallengeKey, Classification, ContainerSession, Phase};
use crate::timestamp::Countdown;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// User-initiated tracker actions, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Load,
    Start,
    Stop,
    Extend,
    Submit,
}

/// Why an active container went away without a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Expired,
    GoneOnServer,
}

/// Notifications for whoever renders the tracker. Each start, stop,
/// extend and flag submission yields exactly one outcome event.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Loaded {
        key: ChallengeKey,
        classification: Classification,
    },
    /// A running container for this challenge was found by a poll.
    Resumed(ContainerSession),
    Started(ContainerSession),
    Extended(ContainerSession),
    Stopped,
    Ended {
        key: ChallengeKey,
        reason: EndReason,
    },
    Tick {
        remaining: Countdown,
    },
    FlagChecked(FlagVerdict),
    Failed {
        action: Action,
        message: String,
    },
}

/// Result of one reconciliation poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Another poll was in flight, nothing is loaded, or the reply
    /// belonged to a challenge that is no longer displayed.
    Skipped,
    /// The request failed; state is unchanged.
    Failed,
    Present(ContainerSession),
    Absent,
}

/// Point-in-time view of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub challenge: Option<ChallengeKey>,
    pub classification: Classification,
    pub phase: Phase,
    pub session: Option<ContainerSession>,
    #[serde(skip)]
    pub remaining: Option<Countdown>,
}

#[derive(Debug, Default)]
struct TrackerState {
    key: Option<ChallengeKey>,
    classification: Classification,
    phase: Phase,
    session: Option<ContainerSession>,
    /// Bumped whenever the displayed challenge changes; replies carrying an
    /// older generation are discarded.
    generation: u64,
}

impl TrackerState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

#[derive(Debug, Default)]
struct Timers {
    poll: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
}

impl Timers {
    fn cancel(&mut self) {
        if let Some(handle) = self.poll.take() {
            handle.abort();
        }
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
    }

    fn armed(&self) -> bool {
        self.poll.is_some() || self.countdown.is_some()
    }
}

/// Clears the poll in-flight flag even if the poll future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner<A> {
    api: Arc<A>,
    clock: Arc<dyn Clock>,
    settings: TrackerSettings,
    state: Mutex<TrackerState>,
    timers: Mutex<Timers>,
    poll_in_flight: AtomicBool,
    events: broadcast::Sender<TrackerEvent>,
}

impl<A> Drop for Inner<A> {
    fn drop(&mut self) {
        self.timers.get_mut().cancel();
    }
}

/// Tracks the container of the currently displayed challenge.
///
/// Cloning yields another handle to the same tracker. Timers are cancelled
/// on `load` of another challenge, on `shutdown`, and when the last handle
/// is dropped.
pub struct ContainerTracker<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for ContainerTracker<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: PlatformApi> ContainerTracker<A> {
    pub fn new(api: Arc<A>, clock: Arc<dyn Clock>, settings: TrackerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                clock,
                settings,
                state: Mutex::new(TrackerState::default()),
                timers: Mutex::new(Timers::default()),
                poll_in_flight: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn with_system_clock(api: Arc<A>, settings: TrackerSettings) -> Self {
        Self::new(api, Arc::new(SystemClock), settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn snapshot(&self) -> TrackerSnapshot {
        self.inner.settle_expiry().await;
        let now = self.inner.clock.now();
        let state = self.inner.state.lock().await;
        TrackerSnapshot {
            challenge: state.key.clone(),
            classification: state.classification,
            phase: state.phase,
            session: state.session.clone(),
            remaining: state
                .session
                .as_ref()
                .map(|s| Countdown::between(now, s.end_time)),
        }
    }

    /// Whether the poll or countdown task is currently scheduled.
    pub async fn timers_armed(&self) -> bool {
        self.inner.timers.lock().await.armed()
    }

    /// Display a challenge: resets all state, fetches its metadata and, for
    /// dynamic challenges, reconciles once with the server.
    pub async fn load(&self, key: ChallengeKey) -> Result<ChallengeInfo, TrackerError> {
        let result = self.inner.load(key).await;
        if let Err(e) = &result {
            self.inner.fail(Action::Load, e);
        }
        result
    }

    pub async fn start(&self) -> Result<ContainerSession, TrackerError> {
        let result = self.inner.start().await;
        match &result {
            Ok(session) => self.inner.publish(TrackerEvent::Started(session.clone())),
            Err(e) => self.inner.fail(Action::Start, e),
        }
        result
    }

    /// Stop the container. Local state is only cleared once the server
    /// confirms.
    pub async fn stop(&self) -> Result<(), TrackerError> {
        let result = self.inner.stop().await;
        match &result {
            Ok(()) => self.inner.publish(TrackerEvent::Stopped),
            Err(e) => self.inner.fail(Action::Stop, e),
        }
        result
    }

    pub async fn extend(&self) -> Result<ContainerSession, TrackerError> {
        let result = self.inner.extend().await;
        match &result {
            Ok(session) => self.inner.publish(TrackerEvent::Extended(session.clone())),
            Err(e) => self.inner.fail(Action::Extend, e),
        }
        result
    }

    /// Run a reconciliation poll now. Failures are logged, never surfaced
    /// as notifications.
    pub async fn reconcile(&self) -> PollOutcome {
        self.inner.reconcile().await
    }

    pub async fn submit_flag(&self, flag: &str) -> Result<FlagVerdict, TrackerError> {
        let result = self.inner.submit_flag(flag).await;
        match &result {
            Ok(verdict) => self.inner.publish(TrackerEvent::FlagChecked(verdict.clone())),
            Err(e) => self.inner.fail(Action::Submit, e),
        }
        result
    }

    /// Cancel both timers and forget the displayed challenge.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            let generation = state.generation + 1;
            *state = TrackerState {
                generation,
                ..TrackerState::default()
            };
        }
        self.inner.timers.lock().await.cancel();
        debug!("tracker shut down");
    }
}

impl<A: PlatformApi> Inner<A> {
    fn publish(&self, event: TrackerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fail(&self, action: Action, error: &TrackerError) {
        warn!(?action, %error, "container action failed");
        self.publish(TrackerEvent::Failed {
            action,
            message: error.to_string(),
        });
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn load(self: &Arc<Self>, key: ChallengeKey) -> Result<ChallengeInfo, TrackerError> {
        let generation = {
            let mut state = self.state.lock().await;
            let generation = state.generation + 1;
            *state = TrackerState {
                key: Some(key.clone()),
                generation,
                ..TrackerState::default()
            };
            generation
        };
        self.timers.lock().await.cancel();
        info!(challenge = %key, "loading challenge");

        let info = self.api.challenge_info(&key).await?;
        let classification = info.classification();
        {
            let mut state = self.state.lock().await;
            if !state.is_current(generation) {
                return Err(TrackerError::Superseded);
            }
            state.classification = classification;
        }
        info!(challenge = %key, classification = classification.label(), "challenge classified");
        self.publish(TrackerEvent::Loaded {
            key,
            classification,
        });

        if classification == Classification::Dynamic {
            self.reconcile().await;
        }
        Ok(info)
    }

    async fn start(self: &Arc<Self>) -> Result<ContainerSession, TrackerError> {
        self.settle_expiry().await;
        let (key, generation) = {
            let mut state = self.state.lock().await;
            let key = state.key.clone().ok_or(TrackerError::NotLoaded)?;
            match state.classification {
                Classification::Static => return Err(TrackerError::StaticChallenge),
                Classification::Unknown => return Err(TrackerError::Undetected),
                Classification::Dynamic => {}
            }
            if state.phase != Phase::NoContainer {
                return Err(TrackerError::InvalidPhase {
                    action: "start a container",
                    phase: state.phase,
                });
            }
            state.phase = Phase::Starting;
            (key, state.generation)
        };
        info!(challenge = %key, "starting container");

        let outcome = self.api.start_container(&key).await;
        let now = self.now();
        let session = {
            let mut state = self.state.lock().await;
            if !state.is_current(generation) {
                return Err(TrackerError::Superseded);
            }
            let session = match outcome.and_then(|report| session_from_report(&key, report, now)) {
                Ok(session) => session,
                Err(e) => {
                    state.phase = Phase::NoContainer;
                    return Err(e.into());
                }
            };
            state.phase = Phase::Active;
            state.session = Some(session.clone());
            session
        };
        info!(
            challenge = %key,
            endpoint = %session.endpoint,
            end_time = %session.end_time,
            "container started"
        );
        self.arm_timers(generation).await;
        Ok(session)
    }

    async fn stop(self: &Arc<Self>) -> Result<(), TrackerError> {
        self.settle_expiry().await;
        let (key, generation) = {
            let mut state = self.state.lock().await;
            let key = state.key.clone().ok_or(TrackerError::NotLoaded)?;
            if state.phase != Phase::Active {
                return Err(TrackerError::InvalidPhase {
                    action: "stop the container",
                    phase: state.phase,
                });
            }
            state.phase = Phase::Stopping;
            (key, state.generation)
        };
        info!(challenge = %key, "stopping container");

        let outcome = self.api.stop_container(&key).await;
        {
            let mut state = self.state.lock().await;
            if !state.is_current(generation) {
                return Err(TrackerError::Superseded);
            }
            if let Err(e) = outcome {
                // The countdown may have ended the session meanwhile.
                if state.phase == Phase::Stopping {
                    state.phase = Phase::Active;
                }
                return Err(e.into());
            }
            state.phase = Phase::NoContainer;
            state.session = None;
        }
        self.timers.lock().await.cancel();
        info!(challenge = %key, "container stopped");
        Ok(())
    }

    async fn extend(self: &Arc<Self>) -> Result<ContainerSession, TrackerError> {
        self.settle_expiry().await;
        let generation = {
            let state = self.state.lock().await;
            if state.key.is_none() {
                return Err(TrackerError::NotLoaded);
            }
            if state.phase != Phase::Active {
                return Err(TrackerError::InvalidPhase {
                    action: "extend the container",
                    phase: state.phase,
                });
            }
            state.generation
        };

        let report = self.api.extend_container().await?;
        let mut state = self.state.lock().await;
        if !state.is_current(generation) {
            return Err(TrackerError::Superseded);
        }
        let phase = state.phase;
        let session = match (phase, state.session.as_mut()) {
            (Phase::Active, Some(session)) => session,
            _ => {
                return Err(TrackerError::InvalidPhase {
                    action: "extend the container",
                    phase,
                })
            }
        };
        overlay(session, report);
        info!(end_time = %session.end_time, "container extended");
        Ok(session.clone())
    }

    async fn submit_flag(&self, flag: &str) -> Result<FlagVerdict, TrackerError> {
        let flag = flag.trim();
        if flag.is_empty() {
            return Err(TrackerError::EmptyFlag);
        }
        let key = self
            .state
            .lock()
            .await
            .key
            .clone()
            .ok_or(TrackerError::NotLoaded)?;
        let verdict = self.api.submit_flag(&key, flag).await?;
        info!(challenge = %key, correct = verdict.correct, "flag checked");
        Ok(verdict)
    }

    async fn reconcile(self: &Arc<Self>) -> PollOutcome {
        if self
            .poll_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("container poll already in flight, skipping");
            return PollOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.poll_in_flight);

        let (key, generation) = {
            let state = self.state.lock().await;
            match &state.key {
                Some(key) => (key.clone(), state.generation),
                None => return PollOutcome::Skipped,
            }
        };

        match self.api.container_status().await {
            Ok(report) => self.apply_poll(generation, &key, report).await,
            Err(e) => {
                warn!(challenge = %key, error = %e, "container poll failed, keeping current state");
                PollOutcome::Failed
            }
        }
    }

    async fn apply_poll(
        self: &Arc<Self>,
        generation: u64,
        key: &ChallengeKey,
        report: Option<ContainerReport>,
    ) -> PollOutcome {
        let now = self.now();
        let matching = report.filter(|r| r.matches(key));

        let mut state = self.state.lock().await;
        if !state.is_current(generation) {
            return PollOutcome::Skipped;
        }

        let Some(report) = matching else {
            let was_active = state.phase == Phase::Active;
            drop(state);
            if was_active {
                self.end(generation, EndReason::GoneOnServer).await;
            }
            return PollOutcome::Absent;
        };

        let phase = state.phase;
        match phase {
            Phase::Active => match state.session.as_mut() {
                Some(session) => {
                    overlay(session, report);
                    PollOutcome::Present(session.clone())
                }
                None => PollOutcome::Absent,
            },
            Phase::NoContainer if state.classification == Classification::Dynamic => {
                let session = match session_from_report(key, report, now) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(challenge = %key, error = %e, "ignoring incomplete container report");
                        return PollOutcome::Failed;
                    }
                };
                if !session.is_live_at(now) {
                    return PollOutcome::Absent;
                }
                state.phase = Phase::Active;
                state.session = Some(session.clone());
                drop(state);

                info!(challenge = %key, endpoint = %session.endpoint, "found running container");
                self.publish(TrackerEvent::Resumed(session.clone()));
                self.arm_timers(generation).await;
                PollOutcome::Present(session)
            }
            // A start or stop is in flight and will settle the phase itself.
            _ => PollOutcome::Skipped,
        }
    }

    /// `Active`/`Stopping -> NoContainer` without a stop request. Applying
    /// it twice is a no-op.
    async fn end(self: &Arc<Self>, generation: u64, reason: EndReason) -> bool {
        let ended = {
            let mut state = self.state.lock().await;
            if !state.is_current(generation)
                || !matches!(state.phase, Phase::Active | Phase::Stopping)
            {
                None
            } else {
                state.phase = Phase::NoContainer;
                state.session = None;
                state.key.clone()
            }
        };
        let Some(key) = ended else {
            return false;
        };

        info!(challenge = %key, ?reason, "container session ended");
        if reason == EndReason::Expired {
            self.publish(TrackerEvent::Tick {
                remaining: Countdown::ZERO,
            });
        }
        self.publish(TrackerEvent::Ended { key, reason });
        // Last step: this may abort the task running it.
        self.timers.lock().await.cancel();
        true
    }

    async fn settle_expiry(self: &Arc<Self>) {
        let now = self.now();
        let expired = {
            let state = self.state.lock().await;
            match &state.session {
                Some(session) if !session.is_live_at(now) => Some(state.generation),
                _ => None,
            }
        };
        if let Some(generation) = expired {
            self.end(generation, EndReason::Expired).await;
        }
    }

    async fn arm_timers(self: &Arc<Self>, generation: u64) {
        let mut timers = self.timers.lock().await;
        {
            let state = self.state.lock().await;
            if !state.is_current(generation) || state.phase != Phase::Active {
                return;
            }
        }
        timers.cancel();
        timers.countdown = Some(spawn_countdown(
            Arc::downgrade(self),
            generation,
            self.settings.tick_interval,
        ));
        timers.poll = Some(spawn_poll(
            Arc::downgrade(self),
            generation,
            self.settings.poll_interval,
        ));
        debug!(generation, "container timers armed");
    }

    /// One countdown step. Returns whether the countdown should keep going.
    async fn countdown_tick(self: &Arc<Self>, generation: u64) -> bool {
        let now = self.now();
        let reading = {
            let state = self.state.lock().await;
            if !state.is_current(generation) {
                return false;
            }
            state
                .session
                .as_ref()
                .map(|s| (s.is_live_at(now), Countdown::between(now, s.end_time)))
        };
        match reading {
            Some((true, remaining)) => {
                self.publish(TrackerEvent::Tick { remaining });
                true
            }
            Some((false, _)) => {
                self.end(generation, EndReason::Expired).await;
                false
            }
            None => false,
        }
    }

    async fn is_active(&self, generation: u64) -> bool {
        let state = self.state.lock().await;
        state.is_current(generation) && state.phase == Phase::Active
    }
}

fn spawn_countdown<A: PlatformApi>(
    tracker: Weak<Inner<A>>,
    generation: u64,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(inner) = tracker.upgrade() else {
                break;
            };
            if !inner.countdown_tick(generation).await {
                break;
            }
        }
    })
}

fn spawn_poll<A: PlatformApi>(
    tracker: Weak<Inner<A>>,
    generation: u64,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(inner) = tracker.upgrade() else {
                break;
            };
            if !inner.is_active(generation).await {
                break;
            }
            debug!("periodic container poll");
            // Detached so a slow reply never delays the next tick check.
            tokio::spawn(async move {
                inner.reconcile().await;
            });
        }
    })
}

/// Build a session from a start or status reply. The tracked key is kept;
/// a missing start time falls back to `now`.
fn session_from_report(
    key: &ChallengeKey,
    report: ContainerReport,
    now: DateTime<Utc>,
) -> Result<ContainerSession, ApiError> {
    let endpoint = report
        .endpoint
        .ok_or_else(|| ApiError::malformed("container reply has no container_url"))?;
    let end_time = report
        .end_time
        .ok_or_else(|| ApiError::malformed("container reply has no end_time"))?;
    Ok(ContainerSession {
        key: key.clone(),
        endpoint,
        start_time: report.start_time.unwrap_or(now),
        end_time,
    })
}

/// Server fields replace stale ones; fields it omits are kept.
fn overlay(session: &mut ContainerSession, report: ContainerReport) {
    if let Some(endpoint) = report.endpoint {
        session.endpoint = endpoint;
    }
    if let Some(start_time) = report.start_time {
        session.start_time = start_time;
    }
    if let Some(end_time) = report.end_time {
        session.end_time = end_time;
    }
}
