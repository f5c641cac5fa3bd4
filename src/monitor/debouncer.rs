//! Debouncing of raw change notifications.
//!
//! Raw events carry the storage's own modification time. An event is accepted
//! only when its timestamp is strictly after `last_accepted + quiet_window`;
//! anything earlier is an echo of a change already acted on. An accepted event
//! arms a short settle delay so a concurrent writer can finish, and events
//! arriving during that delay are folded into the pending signal, which ends
//! up carrying the latest timestamp seen.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::change_source::WatchEvent;

/// Effective "the credentials record changed" notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal {
    observed_at: DateTime<Utc>,
}

impl ChangeSignal {
    pub fn new(observed_at: DateTime<Utc>) -> Self {
        Self { observed_at }
    }

    /// Storage modification time the signal was derived from
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// What the debouncer did with a raw event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debounce {
    /// Started a new pending signal
    Accepted,
    /// Merged into the signal already waiting for the settle delay
    Folded,
    /// Dropped as a duplicate of an already accepted change
    Suppressed,
}

#[derive(Debug)]
pub struct Debouncer {
    quiet_window: chrono::Duration,
    settle_delay: Duration,
    last_accepted: Option<DateTime<Utc>>,
    pending: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(quiet_window: Duration, settle_delay: Duration) -> Self {
        Self {
            quiet_window: chrono::Duration::from_std(quiet_window)
                .unwrap_or(chrono::Duration::MAX),
            settle_delay,
            last_accepted: None,
            pending: None,
        }
    }

    /// Classify a raw event by its storage timestamp
    pub fn observe(&mut self, modified: DateTime<Utc>) -> Debounce {
        if let Some(pending) = self.pending {
            self.pending = Some(pending.max(modified));
            return Debounce::Folded;
        }

        if let Some(last) = self.last_accepted {
            let threshold = last
                .checked_add_signed(self.quiet_window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if modified <= threshold {
                return Debounce::Suppressed;
            }
        }

        self.last_accepted = Some(modified);
        self.pending = Some(modified);
        Debounce::Accepted
    }

    /// Take the pending signal once its settle delay has elapsed
    pub fn take_pending(&mut self) -> Option<ChangeSignal> {
        self.pending.take().map(ChangeSignal::new)
    }

    pub fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.last_accepted
    }

    /// Turn raw watch events into change signals until cancelled or either channel closes
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        signals: mpsc::UnboundedSender<ChangeSignal>,
        cancel: CancellationToken,
    ) {
        let mut settle_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Debouncer cancelled");
                    break;
                }

                _ = wait_until(settle_at) => {
                    settle_at = None;
                    if let Some(signal) = self.take_pending() {
                        debug!("Emitting change signal observed at {}", signal.observed_at());
                        if signals.send(signal).is_err() {
                            debug!("Change signal receiver dropped, stopping debouncer");
                            break;
                        }
                    }
                }

                event = events.recv() => match event {
                    Some(WatchEvent::Changed(change)) => match self.observe(change.modified) {
                        Debounce::Accepted => {
                            debug!("Accepted change observed at {}", change.modified);
                            settle_at = Some(Instant::now() + self.settle_delay);
                        }
                        Debounce::Folded => trace!("Folded change observed at {}", change.modified),
                        Debounce::Suppressed => {
                            trace!("Suppressed duplicate change observed at {}", change.modified)
                        }
                    },
                    Some(WatchEvent::Failed(e)) => {
                        warn!("{}; monitoring is degraded until the watch recovers", e);
                    }
                    None => {
                        debug!("Change source closed, stopping debouncer");
                        break;
                    }
                },
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchError;
    use crate::monitor::change_source::RawChange;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
    }

    fn changed(millis: i64) -> WatchEvent {
        WatchEvent::Changed(RawChange { modified: at(millis) })
    }

    fn debouncer() -> Debouncer {
        Debouncer::new(Duration::from_secs(1), Duration::from_millis(500))
    }

    #[test]
    fn test_first_event_is_accepted() {
        let mut debouncer = debouncer();
        assert_eq!(debouncer.observe(at(100)), Debounce::Accepted);
        assert_eq!(debouncer.last_accepted(), Some(at(100)));
    }

    #[test]
    fn test_events_during_settle_are_folded() {
        let mut debouncer = debouncer();
        assert_eq!(debouncer.observe(at(100)), Debounce::Accepted);
        assert_eq!(debouncer.observe(at(900)), Debounce::Folded);
        assert_eq!(debouncer.observe(at(300)), Debounce::Folded);

        let signal = debouncer.take_pending().unwrap();
        assert_eq!(signal.observed_at(), at(900));
        assert!(debouncer.take_pending().is_none());
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut debouncer = debouncer();
        debouncer.observe(at(0));
        debouncer.take_pending();

        assert_eq!(debouncer.observe(at(1000)), Debounce::Suppressed);
        assert_eq!(debouncer.observe(at(1001)), Debounce::Accepted);
    }

    #[test]
    fn test_older_timestamps_are_suppressed() {
        let mut debouncer = debouncer();
        debouncer.observe(at(5000));
        debouncer.take_pending();

        // A copied file keeping an old timestamp looks like an echo
        assert_eq!(debouncer.observe(at(10)), Debounce::Suppressed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_yields_single_signal_after_settle() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debouncer().run(raw_rx, signal_tx, cancel.clone()));

        let started = Instant::now();
        for millis in [100, 300, 900] {
            raw_tx.send(changed(millis)).unwrap();
        }

        let signal = signal_rx.recv().await.unwrap();
        assert_eq!(signal.observed_at(), at(900));
        assert!(started.elapsed() >= Duration::from_millis(500));

        let second = tokio::time::timeout(Duration::from_secs(5), signal_rx.recv()).await;
        assert!(second.is_err(), "burst must produce exactly one signal");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_window_yields_second_signal() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debouncer().run(raw_rx, signal_tx, cancel.clone()));

        raw_tx.send(changed(0)).unwrap();
        assert_eq!(signal_rx.recv().await.unwrap().observed_at(), at(0));

        // Echo of the accepted change, then a genuinely new write
        raw_tx.send(changed(600)).unwrap();
        raw_tx.send(changed(2500)).unwrap();
        assert_eq!(signal_rx.recv().await.unwrap().observed_at(), at(2500));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_errors_do_not_stop_debouncing() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debouncer().run(raw_rx, signal_tx, cancel.clone()));

        raw_tx
            .send(WatchEvent::Failed(WatchError::Stream {
                path: "credentials.json".into(),
                message: "inotify queue overflow".to_string(),
            }))
            .unwrap();
        raw_tx.send(changed(100)).unwrap();

        assert!(signal_rx.recv().await.is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_source_closes() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(debouncer().run(raw_rx, signal_tx, CancellationToken::new()));

        drop(raw_tx);
        task.await.unwrap();
        assert!(signal_rx.recv().await.is_none());
    }
}
