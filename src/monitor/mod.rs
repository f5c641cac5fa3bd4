//! Credentials monitoring pipeline
//!
//! Change source → debouncer → update coordinator → target. Each stage runs as
//! its own task, connected by unbounded channels, and all of them stop when the
//! shared cancellation token fires.

pub mod change_source;
pub mod coordinator;
pub mod debouncer;
pub mod loader;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MonitorConfig;
use crate::error::WatchError;
use crate::record::CredentialRecord;
use crate::targets::TargetInstance;

pub use change_source::{FileChangeSource, RawChange, WatchEvent};
pub use coordinator::{
    AttemptOutcome, CoordinatorState, CycleOutcome, CycleReport, RetryPolicy, UpdateAttempt,
    UpdateCoordinator,
};
pub use debouncer::{ChangeSignal, Debounce, Debouncer};
pub use loader::{FileRecordLoader, RecordLoader};

/// A running monitoring pipeline
pub struct Monitor {
    _source: FileChangeSource,
    debouncer: JoinHandle<()>,
    coordinator: JoinHandle<()>,
    last_applied: watch::Receiver<Option<CredentialRecord>>,
}

impl Monitor {
    /// Establish the watch and spawn the pipeline tasks.
    ///
    /// Failing to establish the watch is fatal; everything after that is
    /// recovered from inside the pipeline.
    pub fn start(
        config: &MonitorConfig,
        target: TargetInstance,
        cancel: CancellationToken,
    ) -> Result<Self, WatchError> {
        Self::start_with_reports(config, target, cancel, None)
    }

    pub fn start_with_reports(
        config: &MonitorConfig,
        target: TargetInstance,
        cancel: CancellationToken,
        reports: Option<mpsc::UnboundedSender<CycleReport>>,
    ) -> Result<Self, WatchError> {
        let path = config.credentials_file_path.clone();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let source = FileChangeSource::watch(path.clone(), raw_tx)?;

        let debouncer = Debouncer::new(config.quiet_window(), config.settle_delay());
        let debouncer = tokio::spawn(debouncer.run(raw_rx, signal_tx, cancel.clone()));

        let mut coordinator = UpdateCoordinator::new(
            Arc::new(FileRecordLoader::new(path.clone())),
            target,
            RetryPolicy {
                max_attempts: config.max_retry_attempts,
                retry_delay: config.retry_delay(),
            },
            config.target_service_name.clone(),
        )
        .with_check_interval(config.check_interval())
        .with_startup_check(config.apply_on_startup);
        if let Some(reports) = reports {
            coordinator = coordinator.with_reports(reports);
        }
        let last_applied = coordinator.subscribe_last_applied();
        let coordinator = tokio::spawn(coordinator.run(signal_rx, cancel));

        info!("Monitoring credentials record at {:?}", path);
        Ok(Self {
            _source: source,
            debouncer,
            coordinator,
            last_applied,
        })
    }

    pub fn last_applied(&self) -> watch::Receiver<Option<CredentialRecord>> {
        self.last_applied.clone()
    }

    /// Wait for the pipeline tasks to finish after cancellation
    pub async fn wait(self) -> Result<()> {
        self.coordinator.await?;
        self.debouncer.await?;
        Ok(())
    }
}
