use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::persistence::Persistence;
use crate::types::RequestRecord;

/// Each flush gets its own deadline, independent of any request context.
const FLUSH_DEADLINE: Duration = Duration::from_secs(10);

/// Buffered, best-effort metering: records append to a FIFO and flush in
/// batches on size or on a timer. Write failures are logged, never surfaced.
pub struct MeterWriter {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    store: Arc<dyn Persistence>,
    buffer: Mutex<Vec<RequestRecord>>,
    batch_size: usize,
    nudge: Notify,
}

impl Inner {
    async fn flush(&self) {
        let batch = {
            let mut buffer = lock(&self.buffer);
            if buffer.is_empty() {
                return;
            }
            std::mem::replace(&mut *buffer, Vec::with_capacity(self.batch_size))
        };

        for record in &batch {
            match tokio::time::timeout(FLUSH_DEADLINE, self.store.insert_request(record)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(request_id = %record.request_id, error = %err, "meter write failed");
                }
                Err(_) => {
                    tracing::warn!(request_id = %record.request_id, "meter write timed out");
                }
            }
        }
    }
}

impl MeterWriter {
    pub fn new(store: Arc<dyn Persistence>, batch_size: usize, flush_ms: u64) -> Self {
        let inner = Arc::new(Inner {
            store,
            buffer: Mutex::new(Vec::with_capacity(batch_size.max(1))),
            batch_size: batch_size.max(1),
            nudge: Notify::new(),
        });

        let (shutdown, mut rx) = watch::channel(false);
        let flusher = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let period = Duration::from_millis(flush_ms.max(1));
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => flusher.flush().await,
                    _ = flusher.nudge.notified() => flusher.flush().await,
                    _ = rx.changed() => {
                        flusher.flush().await;
                        return;
                    }
                }
            }
        });

        Self {
            inner,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Appends a record; a full batch nudges the flusher immediately.
    pub fn record(&self, record: RequestRecord) {
        let should_flush = {
            let mut buffer = lock(&self.inner.buffer);
            buffer.push(record);
            buffer.len() >= self.inner.batch_size
        };
        if should_flush {
            self.inner.nudge.notify_one();
        }
    }

    /// Stops the flusher after one final flush.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
