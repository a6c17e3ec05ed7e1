//! Runs the exporters of a partition.

use conductor_state::StateStore;
use conductor_storage::{BlockLog, NO_POSITION, StorageAdaptor};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backoff::RetrySchedule;
use crate::config::ExporterConfig;
use crate::exporter::{Exporter, ExporterController, RecordCursor};

/// One task per exporter, each following the committed log.
#[derive(Debug)]
pub struct ExporterDirector {
    exporter_ids: Vec<String>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ExporterDirector {
    /// Start one task per exporter
    pub fn start<S: StorageAdaptor>(
        log: BlockLog<S>,
        state: StateStore,
        exporters: Vec<Box<dyn Exporter>>,
        config: ExporterConfig,
    ) -> Self {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut exporter_ids = Vec::with_capacity(exporters.len());

        for exporter in exporters {
            exporter_ids.push(exporter.id().to_string());
            tracker.spawn(run_exporter(
                exporter,
                log.clone(),
                state.clone(),
                config.clone(),
                token.clone(),
            ));
        }
        tracker.close();

        Self {
            exporter_ids,
            token,
            tracker,
        }
    }

    /// Ids of the running exporters
    pub fn exporter_ids(&self) -> &[String] {
        &self.exporter_ids
    }

    /// Stop and close every exporter
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.wait().await;
    }
}

async fn run_exporter<S: StorageAdaptor>(
    mut exporter: Box<dyn Exporter>,
    log: BlockLog<S>,
    state: StateStore,
    config: ExporterConfig,
    token: CancellationToken,
) {
    let id = exporter.id().to_string();
    let controller = ExporterController::new(&id, state);
    let mut schedule = RetrySchedule::new(config.min_backoff, config.max_backoff);

    while let Err(e) = exporter.open(controller.clone()).await {
        warn!(exporter = %id, "Failed to open exporter: {}", e);
        if !schedule.wait(&token).await {
            return;
        }
    }

    let from = match controller.last_acknowledged() {
        Ok(acknowledged) => acknowledged.map_or(NO_POSITION, |position| position + 1),
        Err(e) => {
            error!(exporter = %id, "Failed to load exporter position: {}", e);
            exporter.close().await;
            return;
        }
    };
    let mut cursor = match RecordCursor::new(&log, from) {
        Ok(cursor) => cursor,
        Err(e) => {
            error!(exporter = %id, "Failed to open record cursor: {}", e);
            exporter.close().await;
            return;
        }
    };
    let mut commits = cursor.commit_updates();
    info!(exporter = %id, from, "Exporter started");

    'records: loop {
        if token.is_cancelled() {
            break;
        }

        let record = match cursor.next().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = commits.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
            Err(e) if e.is_transient() => {
                warn!(exporter = %id, "Failed to read log: {}", e);
                if !schedule.wait(&token).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                error!(exporter = %id, "Exporter stopped: {}", e);
                break;
            }
        };

        let mut retries = RetrySchedule::new(config.min_backoff, config.max_backoff);
        while let Err(e) = exporter.export(&record).await {
            warn!(
                exporter = %id,
                position = record.position,
                attempt = retries.attempts() + 1,
                "Failed to export record: {}", e
            );
            if !retries.wait(&token).await {
                break 'records;
            }
        }
    }

    exporter.close().await;
    debug!(exporter = %id, "Exporter closed");
}
