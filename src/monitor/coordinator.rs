//! Update coordinator: the retry state machine that applies credentials.
//!
//! The coordinator is the only stateful actor in the pipeline. It owns a single
//! [`CoordinatorState`] and every transition happens inside [`UpdateCoordinator::run`],
//! which multiplexes change signals, the liveness tick, the in-flight apply call,
//! the backoff timer and cancellation. Because the state has exactly one owner,
//! at most one apply call is ever outstanding.
//!
//! ```text
//!   Idle ──signal/startup──▶ load ──record──▶ Updating(1)
//!    ▲                        │absent/invalid      │
//!    └────────────────────────┘                    │ success ─────────────▶ Idle
//!                                                  │ failure, n < max ────▶ BackoffWait(n)
//!                                                  │ failure, n = max ────▶ Idle (reported)
//!   BackoffWait(n) ──resume_at──▶ Updating(n + 1) with the same record
//! ```
//!
//! Signals received outside `Idle` are coalesced into a single pending flag and
//! answered with a fresh load once the current cycle ends.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::debouncer::ChangeSignal;
use super::loader::RecordLoader;
use crate::error::RecordError;
use crate::record::CredentialRecord;
use crate::targets::Target;

/// How failed attempts are retried. The delay is fixed, not exponential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failure,
}

/// One call to the target within an update cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAttempt {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

impl UpdateAttempt {
    fn begin(number: u32) -> Self {
        Self {
            number,
            started_at: Utc::now(),
            outcome: AttemptOutcome::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CoordinatorState {
    Idle,
    Updating {
        record: CredentialRecord,
        attempt: UpdateAttempt,
    },
    BackoffWait {
        record: CredentialRecord,
        attempt: UpdateAttempt,
        resume_at: Instant,
    },
}

impl CoordinatorState {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Updating { .. } => "updating",
            CoordinatorState::BackoffWait { .. } => "backoff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Applied,
    /// Every allowed attempt failed; nothing more happens until the next signal
    Exhausted,
}

/// Summary of a finished update cycle. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub masked_username: String,
    pub observed_at: DateTime<Utc>,
    pub attempts: u32,
    pub outcome: CycleOutcome,
}

pub struct UpdateCoordinator {
    loader: Arc<dyn RecordLoader>,
    target: Arc<dyn Target>,
    policy: RetryPolicy,
    service_name: String,
    check_interval: Duration,
    state: CoordinatorState,
    pending: Option<ChangeSignal>,
    last_applied: watch::Sender<Option<CredentialRecord>>,
    reports: Option<mpsc::UnboundedSender<CycleReport>>,
}

impl UpdateCoordinator {
    pub fn new(
        loader: Arc<dyn RecordLoader>,
        target: Arc<dyn Target>,
        policy: RetryPolicy,
        service_name: impl Into<String>,
    ) -> Self {
        let (last_applied, _) = watch::channel(None);
        Self {
            loader,
            target,
            policy: RetryPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
            service_name: service_name.into(),
            check_interval: Duration::from_secs(30),
            state: CoordinatorState::Idle,
            pending: None,
            last_applied,
            reports: None,
        }
    }

    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Treat startup like a change signal so an existing record is applied
    #[must_use]
    pub fn with_startup_check(mut self, enabled: bool) -> Self {
        self.pending = enabled.then(|| ChangeSignal::new(Utc::now()));
        self
    }

    /// Receive a [`CycleReport`] for every finished cycle
    #[must_use]
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<CycleReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Observe the record most recently applied successfully
    pub fn subscribe_last_applied(&self) -> watch::Receiver<Option<CredentialRecord>> {
        self.last_applied.subscribe()
    }

    /// Drive the state machine until cancelled, or until the signal stream
    /// closes while idle.
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<ChangeSignal>,
        cancel: CancellationToken,
    ) {
        let mut tick =
            tokio::time::interval_at(Instant::now() + self.check_interval, self.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signals_open = true;

        info!(
            "Update coordinator started for service '{}' (max {} attempts, {:?} between attempts)",
            self.service_name, self.policy.max_attempts, self.policy.retry_delay
        );

        loop {
            match self.state.clone() {
                CoordinatorState::Idle => {
                    if let Some(signal) = self.pending.take() {
                        debug!("Handling change observed at {}", signal.observed_at());

                        // Loading touches the filesystem; keep it off the runtime
                        let loader = Arc::clone(&self.loader);
                        let mut load = tokio::task::spawn_blocking(move || loader.load());

                        let loaded = loop {
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break None,
                                loaded = &mut load => break Some(loaded),
                                signal = signals.recv(), if signals_open => match signal {
                                    Some(signal) => self.note_signal(signal),
                                    None => signals_open = false,
                                },
                                _ = tick.tick() => self.heartbeat(),
                            }
                        };

                        match loaded {
                            Some(Ok(result)) => self.begin_cycle(result),
                            Some(Err(e)) => warn!("Credentials record load did not complete: {}", e),
                            None => break,
                        }
                        continue;
                    }
                    if !signals_open {
                        info!("Change signals closed, update coordinator stopping");
                        break;
                    }

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        signal = signals.recv() => match signal {
                            Some(signal) => self.note_signal(signal),
                            None => signals_open = false,
                        },
                        _ = tick.tick() => self.heartbeat(),
                    }
                }

                CoordinatorState::Updating { record, attempt } => {
                    info!(
                        "Applying credentials for {} to {} target (attempt {}/{})",
                        record.masked_username(),
                        self.target.target_type(),
                        attempt.number,
                        self.policy.max_attempts
                    );

                    let result = {
                        let target = Arc::clone(&self.target);
                        let mut apply = target.apply_credentials(&record);

                        loop {
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break None,
                                result = &mut apply => break Some(result),
                                signal = signals.recv(), if signals_open => match signal {
                                    Some(signal) => self.note_signal(signal),
                                    None => signals_open = false,
                                },
                                _ = tick.tick() => self.heartbeat(),
                            }
                        }
                    };

                    match result {
                        Some(result) => self.finish_attempt(record, attempt, result),
                        None => {
                            self.abandon_cycle(&record);
                            break;
                        }
                    }
                }

                CoordinatorState::BackoffWait {
                    record,
                    attempt,
                    resume_at,
                } => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            self.abandon_cycle(&record);
                            break;
                        }
                        _ = tokio::time::sleep_until(resume_at) => {
                            self.state = CoordinatorState::Updating {
                                record,
                                attempt: UpdateAttempt::begin(attempt.number + 1),
                            };
                        }
                        signal = signals.recv(), if signals_open => match signal {
                            Some(signal) => self.note_signal(signal),
                            None => signals_open = false,
                        },
                        _ = tick.tick() => self.heartbeat(),
                    }
                }
            }
        }

        debug!("Update coordinator stopped");
    }

    /// Remember that a change happened; only the most recent signal is kept
    fn note_signal(&mut self, signal: ChangeSignal) {
        if matches!(self.state, CoordinatorState::Idle) {
            self.pending = Some(signal);
            return;
        }
        match self.pending.replace(signal) {
            Some(_) => debug!("Coalesced change signal while {}", self.state.name()),
            None => debug!("Queued change signal while {}", self.state.name()),
        }
    }

    /// Idle + loaded record: start a cycle if the record is usable
    fn begin_cycle(&mut self, loaded: Result<Option<CredentialRecord>, RecordError>) {
        match loaded {
            Ok(Some(record)) => {
                info!(
                    "Credentials change detected for {} (modified {})",
                    record.masked_username(),
                    record.observed_at()
                );
                self.state = CoordinatorState::Updating {
                    record,
                    attempt: UpdateAttempt::begin(1),
                };
            }
            Ok(None) => {
                debug!("Credentials record is absent, waiting for the next change");
            }
            Err(e) => {
                warn!("Ignoring change: {}", e);
            }
        }
    }

    fn finish_attempt(
        &mut self,
        record: CredentialRecord,
        mut attempt: UpdateAttempt,
        result: anyhow::Result<bool>,
    ) {
        let succeeded = match result {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    "Attempt {}/{} to apply credentials for {} failed",
                    attempt.number,
                    self.policy.max_attempts,
                    record.masked_username()
                );
                false
            }
            Err(e) => {
                warn!(
                    "Attempt {}/{} to apply credentials for {} failed: {:#}",
                    attempt.number,
                    self.policy.max_attempts,
                    record.masked_username(),
                    e
                );
                false
            }
        };

        if succeeded {
            attempt.outcome = AttemptOutcome::Success;
            info!(
                "Credentials for {} applied to service '{}' after {} attempt(s)",
                record.masked_username(),
                self.service_name,
                attempt.number
            );
            self.report(&record, &attempt, CycleOutcome::Applied);
            self.last_applied.send_replace(Some(record));
            self.state = CoordinatorState::Idle;
            return;
        }

        attempt.outcome = AttemptOutcome::Failure;
        if attempt.number < self.policy.max_attempts {
            debug!("Retrying in {:?}", self.policy.retry_delay);
            self.state = CoordinatorState::BackoffWait {
                record,
                attempt,
                resume_at: Instant::now() + self.policy.retry_delay,
            };
        } else {
            error!(
                "Giving up on credentials for {} for service '{}' after {} failed attempt(s)",
                record.masked_username(),
                self.service_name,
                attempt.number
            );
            self.report(&record, &attempt, CycleOutcome::Exhausted);
            self.state = CoordinatorState::Idle;
        }
    }

    /// Cancellation ends the cycle without reporting it as a failure
    fn abandon_cycle(&mut self, record: &CredentialRecord) {
        info!(
            "Update cycle for {} cancelled during {}",
            record.masked_username(),
            self.state.name()
        );
        self.state = CoordinatorState::Idle;
    }

    fn report(&self, record: &CredentialRecord, attempt: &UpdateAttempt, outcome: CycleOutcome) {
        if let Some(ref reports) = self.reports {
            let _ = reports.send(CycleReport {
                masked_username: record.masked_username(),
                observed_at: record.observed_at(),
                attempts: attempt.number,
                outcome,
            });
        }
    }

    fn heartbeat(&self) {
        let last_applied = self
            .last_applied
            .borrow()
            .as_ref()
            .map(|r| r.masked_username())
            .unwrap_or_else(|| "none".to_string());
        debug!(
            "Monitoring service '{}': state={}, last applied={}, change pending={}",
            self.service_name,
            self.state.name(),
            last_applied,
            self.pending.is_some()
        );
    }
}
