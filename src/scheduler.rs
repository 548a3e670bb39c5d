//! Cron-driven sync of every configured repository

use crate::error::{BlobdexError, ConfigError};
use crate::sync::{SyncReport, SyncService};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs [`SyncService::sync_all`] on a six-field cron schedule
pub struct SyncScheduler {
    service: SyncService,
    schedule: cron::Schedule,
    running: Mutex<Option<Running>>,
}

impl SyncScheduler {
    pub fn new(service: SyncService) -> Result<Self, BlobdexError> {
        let expression = service.config().sync.schedule.clone();
        let schedule = cron::Schedule::from_str(&expression).map_err(|e| ConfigError::InvalidValue {
            key: "sync.schedule".to_string(),
            reason: format!("'{}': {}", expression, e),
        })?;

        Ok(Self {
            service,
            schedule,
            running: Mutex::new(None),
        })
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }

    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Start the schedule loop, replacing one already running
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = running.take() {
            tracing::info!("Stopping the previous sync schedule");
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_schedule(
            self.service.clone(),
            self.schedule.clone(),
            cancel.clone(),
        ));
        tracing::info!("Started sync scheduler, next run at {:?}", self.next_run());
        *running = Some(Running { cancel, handle });
    }

    /// Stop the schedule loop and wait for it to exit
    ///
    /// A sync in flight is abandoned; refs it left dirty are retired on the
    /// next run.
    pub async fn stop(&self) {
        let running = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.take()
        };
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::warn!("Sync scheduler task ended abnormally: {}", e);
        }
        tracing::info!("Stopped sync scheduler");
    }

    /// Sync every repository now, outside the schedule
    pub async fn trigger_all(&self) -> Vec<(String, Result<SyncReport, BlobdexError>)> {
        self.service.sync_all().await
    }

    /// Sync one repository now
    pub async fn trigger(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
    ) -> Result<SyncReport, BlobdexError> {
        self.service.sync_one(organization, project, repository).await
    }
}

async fn run_schedule(service: SyncService, schedule: cron::Schedule, cancel: CancellationToken) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::warn!("Sync schedule has no upcoming run, stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        tracing::info!("Start scheduled sync");
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Scheduled sync cancelled");
                return;
            }
            results = service.sync_all() => {
                let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                tracing::info!(
                    "End scheduled sync: {} repositories, {} failed",
                    results.len(),
                    failed
                );
            }
        }
    }
}
