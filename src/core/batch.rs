use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::check::{CheckStatus, DeviceCheck};
use crate::core::digest::DigestSource;
use crate::core::error::CheckError;

/// Receives batch lifecycle and per-device status notifications.
///
/// Callbacks are delivered one at a time from a single consumer task, so
/// implementations never see two notifications concurrently. Notifications
/// for one device always arrive in the order that device produced them.
#[async_trait]
pub trait BatchListener: Send + Sync {
    async fn on_batch_start(&self);
    async fn on_batch_stop(&self);
    async fn on_device_status_changed(&self, device: &Path, status: CheckStatus);
}

enum BatchEvent {
    Started,
    DeviceStatus { device: PathBuf, status: CheckStatus },
    Stopped,
}

struct BatchTimes {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

struct BatchInner {
    batch_id: Uuid,
    iterations: u32,
    checks: Vec<Arc<DeviceCheck>>,
    listener: Arc<dyn BatchListener>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    times: Mutex<BatchTimes>,
}

/// Runs one check per device concurrently and multiplexes their status
/// events to a single listener.
///
/// `start` returns immediately; completion is signaled through
/// `on_batch_stop`, which fires only after every device task has terminated
/// and its terminal notification has been delivered. `cancel` never blocks:
/// it flips every check to canceled and lets the drain task observe the
/// worker shutdown.
#[derive(Clone)]
pub struct BatchRunner {
    inner: Arc<BatchInner>,
}

impl BatchRunner {
    pub fn new(
        devices: Vec<PathBuf>,
        test_file: PathBuf,
        iterations: u32,
        digests: Arc<dyn DigestSource>,
        listener: Arc<dyn BatchListener>,
    ) -> Self {
        let checks = devices
            .into_iter()
            .map(|device| Arc::new(DeviceCheck::new(device, test_file.clone(), digests.clone())))
            .collect();

        Self {
            inner: Arc::new(BatchInner {
                batch_id: Uuid::now_v7(),
                iterations,
                checks,
                listener,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                times: Mutex::new(BatchTimes {
                    started_at: None,
                    finished_at: None,
                }),
            }),
        }
    }

    /// One check per device; accessors stay readable for the whole batch
    /// lifetime, including mid-run.
    pub fn checks(&self) -> &[Arc<DeviceCheck>] {
        &self.inner.checks
    }

    pub fn batch_id(&self) -> Uuid {
        self.inner.batch_id
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_times().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock_times().finished_at
    }

    /// Begin asynchronous execution. A batch runs once; a second call is a
    /// logged no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!(batch_id = %self.inner.batch_id, "batch already started");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_event_pump(rx);

        self.lock_times().started_at = Some(Utc::now());
        info!(
            batch_id = %self.inner.batch_id,
            devices = self.inner.checks.len(),
            iterations = self.inner.iterations,
            "batch starting"
        );
        let _ = tx.send(BatchEvent::Started);

        for check in &self.inner.checks {
            if self.inner.cancel.is_cancelled() {
                debug!(
                    batch_id = %self.inner.batch_id,
                    "batch canceled; not scheduling remaining devices"
                );
                break;
            }
            self.spawn_device_task(Arc::clone(check), tx.clone());
        }
        self.inner.tracker.close();

        // Drain task: the stop notification may only fire once every device
        // task has terminated, so no orphaned I/O survives the batch.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.tracker.wait().await;
            inner
                .times
                .lock()
                .expect("batch times lock poisoned")
                .finished_at = Some(Utc::now());
            info!(batch_id = %inner.batch_id, "batch stopped");
            let _ = tx.send(BatchEvent::Stopped);
        });
    }

    /// Cancel the whole batch: stop scheduling, cancel every device check,
    /// and let the drain task report the stop once all workers are done.
    /// Idempotent and non-blocking.
    pub fn cancel(&self) {
        info!(batch_id = %self.inner.batch_id, "canceling batch");
        self.inner.cancel.cancel();
        for check in &self.inner.checks {
            check.cancel();
        }
    }

    /// Single consumer serializing all listener callbacks.
    fn spawn_event_pump(&self, mut rx: mpsc::UnboundedReceiver<BatchEvent>) {
        let listener = Arc::clone(&self.inner.listener);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BatchEvent::Started => listener.on_batch_start().await,
                    BatchEvent::DeviceStatus { device, status } => {
                        listener.on_device_status_changed(&device, status).await;
                    }
                    BatchEvent::Stopped => listener.on_batch_stop().await,
                }
            }
        });
    }

    fn spawn_device_task(
        &self,
        check: Arc<DeviceCheck>,
        tx: mpsc::UnboundedSender<BatchEvent>,
    ) {
        let batch_id = self.inner.batch_id;
        let iterations = self.inner.iterations;

        self.inner.tracker.spawn(async move {
            let device = check.device().to_path_buf();

            // Canceled before this task got to run: report the terminal
            // status without ever announcing the device as running.
            if check.status() == CheckStatus::Canceled {
                debug!(batch_id = %batch_id, device = %device.display(), "skipping canceled check");
                let _ = tx.send(BatchEvent::DeviceStatus {
                    device,
                    status: CheckStatus::Canceled,
                });
                return;
            }

            let _ = tx.send(BatchEvent::DeviceStatus {
                device: device.clone(),
                status: CheckStatus::Running,
            });
            info!(
                batch_id = %batch_id,
                device = %device.display(),
                iterations,
                "running device check"
            );

            let runner = Arc::clone(&check);
            let outcome = tokio::task::spawn_blocking(move || runner.run(iterations)).await;

            let status = match outcome {
                Ok(Ok(())) => {
                    info!(batch_id = %batch_id, device = %device.display(), "device check passed");
                    CheckStatus::Success
                }
                Ok(Err(CheckError::Canceled)) => {
                    info!(batch_id = %batch_id, device = %device.display(), "device check canceled");
                    CheckStatus::Canceled
                }
                Ok(Err(err)) => {
                    if err.device_removed() {
                        warn!(
                            batch_id = %batch_id,
                            device = %device.display(),
                            error = %err,
                            "device appears to have been removed mid-check"
                        );
                    } else {
                        error!(
                            batch_id = %batch_id,
                            device = %device.display(),
                            error = %err,
                            "device check failed"
                        );
                    }
                    CheckStatus::Failed
                }
                Err(join_err) => {
                    error!(
                        batch_id = %batch_id,
                        device = %device.display(),
                        error = %join_err,
                        "device check task aborted"
                    );
                    CheckStatus::Failed
                }
            };

            let _ = tx.send(BatchEvent::DeviceStatus { device, status });
        });
    }

    fn lock_times(&self) -> std::sync::MutexGuard<'_, BatchTimes> {
        self.inner.times.lock().expect("batch times lock poisoned")
    }
}
