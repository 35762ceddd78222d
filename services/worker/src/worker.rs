use optiq_core::models::ImageStatus;
use optiq_core::processor::ProcessConfig;
use optiq_core::repository::RepositoryError;
use optiq_core::{ImageProcessor, ImageRepository};
use optiq_queue::{ResizeData, Task, TaskPayload};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Handler error asking the broker to redeliver the task.
///
/// Permanent failures never produce this: they settle the record in `failed`
/// and let the message be acked, so a doomed task cannot loop forever.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Requeue(pub String);

/// Bounded-concurrency task executor driving the image state machine.
pub struct Worker {
    repo: ImageRepository,
    processor: ImageProcessor,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        repo: ImageRepository,
        processor: ImageProcessor,
        max_workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            processor,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Entry point handed to the queue consumer for each delivered task.
    ///
    /// Waits for a semaphore slot unless shutdown wins the race, in which
    /// case the task goes straight back to the queue. The slot is released on
    /// every exit path when the permit drops.
    pub async fn handle_task(&self, task: Task) -> Result<(), Requeue> {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(task_id = %task.id, "Semaphore closed; task returned to queue");
                    return Err(Requeue("worker is shutting down".to_string()));
                }
            },
            _ = self.shutdown.cancelled() => {
                warn!(task_id = %task.id, "Shutdown in progress; task returned to queue");
                return Err(Requeue("worker is shutting down".to_string()));
            }
        };

        let result = self.tracker.track_future(self.process_task(task)).await;
        drop(permit);
        result
    }

    /// Stop granting slots and wait for in-flight tasks to settle, up to
    /// `deadline`. Returns whether the drain completed in time; tasks past
    /// the deadline stay unacked and will be redelivered.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.semaphore.close();
        self.tracker.close();
        tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .is_ok()
    }

    /// How many tasks are currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn process_task(&self, task: Task) -> Result<(), Requeue> {
        let TaskPayload::ResizeImage(data) = task.payload;
        let start = Instant::now();

        info!(image_id = %data.image_id, "Starting task processing");

        // pending -> processing. Re-entry after a redelivery is a plain
        // update, so a crashed predecessor does not block the retry.
        if let Err(e) = self
            .repo
            .update_status(data.image_id, ImageStatus::Processing, None)
            .await
        {
            error!(error = %e, image_id = %data.image_id, "Failed to update image status to processing");
            record_outcome("db_status_update_error", start);
            return Err(Requeue(format!(
                "error updating image status before processing: {e}"
            )));
        }

        let original_size = match self.repo.get_by_id(data.image_id).await {
            Ok(image) => Some(image.original_size),
            Err(RepositoryError::NotFound) => {
                error!(image_id = %data.image_id, "Image record not found; dropping task");
                record_outcome("missing_row", start);
                self.mark_failed(data.image_id, "image record not found")
                    .await?;
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, image_id = %data.image_id, "Failed to fetch image record");
                record_outcome("db_fetch_error", start);
                return Err(Requeue(format!("error fetching image record: {e}")));
            }
        };

        let config = data.config.effective();
        log_effective_config(&data, &config);

        match self
            .processor
            .process(data.image_id, &data.original_path, &data.filename, config)
            .await
        {
            Ok(result) => {
                if let Err(e) = self
                    .repo
                    .update_optimized(
                        data.image_id,
                        &result.optimized_path,
                        result.optimized_size,
                        result.optimized_width,
                        result.optimized_height,
                    )
                    .await
                {
                    error!(error = %e, image_id = %data.image_id, "Failed to update optimized record");
                    record_outcome("db_update_error", start);
                    return Err(Requeue(format!(
                        "error updating image record after successful processing: {e}"
                    )));
                }

                record_outcome("success", start);
                if let Some(original) = original_size {
                    if let Some(percent) = reduction_percent(original, result.optimized_size) {
                        metrics::histogram!("worker.size_reduction.percent").record(percent);
                    }
                }

                info!(
                    image_id = %data.image_id,
                    optimized_path = %result.optimized_path,
                    optimized_size = result.optimized_size,
                    optimized_width = result.optimized_width,
                    optimized_height = result.optimized_height,
                    "Image processed and record updated"
                );
                Ok(())
            }
            Err(e) => {
                let message = format!("error processing image: {e}");
                error!(
                    error = %e,
                    image_id = %data.image_id,
                    permanent = e.is_permanent(),
                    "Image processing failed"
                );
                record_outcome("processing_error", start);

                if e.is_permanent() {
                    // A retry decodes and encodes the same bytes the same
                    // way; settle the record and drop the task.
                    self.mark_failed(data.image_id, &message).await?;
                    Ok(())
                } else {
                    self.try_mark_failed(data.image_id, &message).await;
                    Err(Requeue(message))
                }
            }
        }
    }

    /// Write the failed terminal state. A task is only acked once this write
    /// lands, so a DB outage here requeues the task.
    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<(), Requeue> {
        self.repo
            .update_status(id, ImageStatus::Failed, Some(message))
            .await
            .map_err(|e| {
                error!(error = %e, image_id = %id, "Failed to mark image as failed");
                Requeue(format!("error marking image as failed: {e}"))
            })
    }

    /// Best-effort failed write on a path that requeues anyway; the retry
    /// will overwrite whatever lands here.
    async fn try_mark_failed(&self, id: Uuid, message: &str) {
        if let Err(e) = self
            .repo
            .update_status(id, ImageStatus::Failed, Some(message))
            .await
        {
            error!(error = %e, image_id = %id, "Also failed to update image status to failed");
        }
    }
}

fn log_effective_config(data: &ResizeData, config: &ProcessConfig) {
    info!(
        image_id = %data.image_id,
        max_width = config.max_width,
        max_height = config.max_height,
        quality = config.quality,
        optimize_storage = config.optimize_storage,
        "Effective image processing configuration"
    );
}

fn record_outcome(status: &'static str, start: Instant) {
    metrics::counter!("worker.tasks.processed", "status" => status).increment(1);
    metrics::histogram!("worker.processing.duration_seconds", "status" => status)
        .record(start.elapsed().as_secs_f64());
}

fn reduction_percent(original_size: i64, optimized_size: i64) -> Option<f64> {
    if original_size <= 0 {
        return None;
    }
    Some((1.0 - optimized_size as f64 / original_size as f64) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use optiq_core::object_store::ObjectStoreError;
    use optiq_core::processor::ProcessorError;

    #[test]
    fn reduction_percent_guards_zero_original() {
        assert_eq!(reduction_percent(0, 10), None);
        assert_eq!(reduction_percent(-5, 10), None);

        let percent = reduction_percent(1000, 250).unwrap();
        assert!((percent - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reduction_percent_zero_for_fallback() {
        assert_eq!(reduction_percent(100, 100), Some(0.0));
    }

    #[test]
    fn ack_nack_classification() {
        // Permanent errors settle the row and ack; transient errors requeue.
        assert!(ProcessorError::UnsupportedFormat("gif".into()).is_permanent());
        assert!(ProcessorError::InvalidImage("truncated".into()).is_permanent());
        assert!(ProcessorError::Store(ObjectStoreError::NotFound("k".into())).is_permanent());
        assert!(!ProcessorError::Store(ObjectStoreError::Transport("timeout".into())).is_permanent());
    }

    #[test]
    fn requeue_carries_reason() {
        let err = Requeue("broker hiccup".into());
        assert_eq!(err.to_string(), "broker hiccup");
    }
}
