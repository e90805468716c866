//! Size and time triggered buffering in front of the upload paths.
use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use opentelemetry::otel_debug;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::BatchConfig;

/// Called with every detached batch.
pub(crate) type FlushHandler<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

enum BundlerMessage<T> {
    /// Append an item to the current batch.
    Add(T),
    /// Hand the current batch over now, regardless of thresholds.
    Flush(oneshot::Sender<()>),
    /// Hand the current batch over and stop accepting items.
    Shutdown(oneshot::Sender<()>),
}

struct Pending<T> {
    messages: mpsc::UnboundedReceiver<BundlerMessage<T>>,
    handler: FlushHandler<T>,
}

/// Accumulates items and passes them to a handler in batches.
///
/// A batch is handed over once it holds `max_items` items or `delay` after
/// its first item was added, whichever comes first. Batches are handed over
/// one at a time, by a single worker task, so the handler never runs
/// concurrently with itself. Adding never blocks; items added while the
/// handler runs start the next batch.
pub(crate) struct Bundler<T> {
    name: &'static str,
    config: BatchConfig,
    sender: mpsc::UnboundedSender<BundlerMessage<T>>,
    pending: Mutex<Option<Pending<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> fmt::Debug for Bundler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundler")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Send + 'static> Bundler<T> {
    /// Create a bundler. Items added before [`Bundler::start`] are kept and
    /// delivered once the worker runs.
    pub(crate) fn new(name: &'static str, config: BatchConfig, handler: FlushHandler<T>) -> Self {
        let (sender, messages) = mpsc::unbounded_channel();
        Bundler {
            name,
            config,
            sender,
            pending: Mutex::new(Some(Pending { messages, handler })),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker on the current tokio runtime. Only the first call has
    /// an effect.
    pub(crate) fn start(&self) {
        let pending = match self.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => None,
        };
        let Some(Pending { messages, handler }) = pending else {
            return;
        };

        let worker = tokio::spawn(run(self.name, self.config, messages, handler));
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(worker);
        }
    }

    /// Append an item. Dropped silently once the bundler is shut down.
    pub(crate) fn add(&self, item: T) {
        if self.sender.send(BundlerMessage::Add(item)).is_err() {
            otel_debug!(name: "OcAgent.Bundler.ItemDropped", bundler = self.name);
        }
    }

    /// Hand the current batch over and wait until the handler returned.
    pub(crate) async fn flush(&self) {
        if !self.is_running() {
            return;
        }
        let (done, wait) = oneshot::channel();
        if self.sender.send(BundlerMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Hand the current batch over, then stop the worker. Later items are
    /// dropped.
    pub(crate) async fn shutdown(&self) {
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        let Some(worker) = worker else {
            return;
        };

        let (done, wait) = oneshot::channel();
        if self.sender.send(BundlerMessage::Shutdown(done)).is_ok() {
            let _ = wait.await;
        }
        let _ = worker.await;
    }

    fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false)
    }
}

async fn run<T>(
    name: &'static str,
    config: BatchConfig,
    mut messages: mpsc::UnboundedReceiver<BundlerMessage<T>>,
    handler: FlushHandler<T>,
) {
    let mut batch: Vec<T> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let message = match deadline {
            Some(at) => {
                tokio::select! {
                    message = messages.recv() => message,
                    _ = tokio::time::sleep_until(at) => {
                        deliver(name, &mut batch, &handler).await;
                        deadline = None;
                        continue;
                    }
                }
            }
            None => messages.recv().await,
        };

        match message {
            Some(BundlerMessage::Add(item)) => {
                if batch.is_empty() {
                    deadline = Some(Instant::now() + config.delay);
                }
                batch.push(item);
                if batch.len() >= config.max_items {
                    deliver(name, &mut batch, &handler).await;
                    deadline = None;
                }
            }
            Some(BundlerMessage::Flush(done)) => {
                deliver(name, &mut batch, &handler).await;
                deadline = None;
                let _ = done.send(());
            }
            Some(BundlerMessage::Shutdown(done)) => {
                deliver(name, &mut batch, &handler).await;
                let _ = done.send(());
                return;
            }
            None => {
                deliver(name, &mut batch, &handler).await;
                return;
            }
        }
    }
}

async fn deliver<T>(name: &'static str, batch: &mut Vec<T>, handler: &FlushHandler<T>) {
    if batch.is_empty() {
        return;
    }
    let items = std::mem::take(batch);
    otel_debug!(name: "OcAgent.Bundler.Flushing", bundler = name, count = items.len());
    handler(items).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::time::Duration;

    fn recording_bundler(
        max_items: usize,
        delay: Duration,
    ) -> (Bundler<u32>, mpsc::UnboundedReceiver<Vec<u32>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: FlushHandler<u32> = Arc::new(move |batch: Vec<u32>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(batch);
            }
            .boxed()
        });
        (
            Bundler::new("test", BatchConfig { max_items, delay }, handler),
            rx,
        )
    }

    #[tokio::test]
    async fn test_count_threshold_flushes_exactly_one_batch() {
        let (bundler, mut batches) = recording_bundler(3, Duration::from_secs(60));
        bundler.start();

        for i in 0..4 {
            bundler.add(i);
        }

        let batch = tokio::time::timeout(Duration::from_secs(1), batches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, vec![0, 1, 2]);
        // the fourth item waits in a fresh batch
        assert!(batches.try_recv().is_err());

        bundler.flush().await;
        assert_eq!(batches.try_recv().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_delay_threshold() {
        let (bundler, mut batches) = recording_bundler(100, Duration::from_millis(50));
        bundler.start();

        bundler.add(1);
        bundler.add(2);

        let batch = tokio::time::timeout(Duration::from_secs(2), batches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_items_added_before_start_are_kept() {
        let (bundler, mut batches) = recording_bundler(10, Duration::from_secs(60));
        bundler.add(7);
        // not running yet, nothing to wait for
        bundler.flush().await;
        assert!(batches.try_recv().is_err());

        bundler.start();
        bundler.flush().await;
        assert_eq!(batches.try_recv().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_flush_on_empty_batch_does_not_call_handler() {
        let (bundler, mut batches) = recording_bundler(10, Duration::from_secs(60));
        bundler.start();
        bundler.flush().await;
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_delivers_remaining_and_drops_later_items() {
        let (bundler, mut batches) = recording_bundler(10, Duration::from_secs(60));
        bundler.start();
        bundler.add(1);
        bundler.shutdown().await;
        assert_eq!(batches.try_recv().unwrap(), vec![1]);

        bundler.add(2);
        bundler.flush().await;
        bundler.shutdown().await;
        assert!(batches.try_recv().is_err());
    }
}
