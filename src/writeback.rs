//! Background persistence of freshly generated derivatives.
//!
//! Requests hand finished derivatives to [`WriteBack::submit`] and return
//! immediately. A single worker task owns the queue and runs up to
//! `concurrency` store writes at a time. Failed writes are logged and
//! counted, never retried.

use crate::cache_key::CacheKey;
use crate::metrics::Metrics;
use crate::store::BlobStore;
use bytes::Bytes;
use http::HeaderMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

#[derive(Debug)]
pub struct WriteJob {
    pub key: CacheKey,
    pub data: Bytes,
    pub headers: HeaderMap,
}

enum Message {
    Write(WriteJob),
    Flush(oneshot::Sender<()>),
}

/// Handle to the write-back queue. Cheap to clone.
#[derive(Clone)]
pub struct WriteBack {
    tx: mpsc::Sender<Message>,
    metrics: Arc<Metrics>,
}

impl WriteBack {
    /// Spawns the worker on the current runtime.
    pub fn spawn(
        store: Arc<dyn BlobStore>,
        capacity: usize,
        concurrency: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run(store, rx, concurrency.max(1), metrics.clone()));
        Self { tx, metrics }
    }

    /// Queues a write without waiting. When the queue is full the job is
    /// dropped: losing a cache entry is preferable to stalling a response.
    pub fn submit(&self, job: WriteJob) {
        if let Err(e) = self.tx.try_send(Message::Write(job)) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "worker stopped",
            };
            if let Message::Write(job) = e.into_inner() {
                tracing::warn!("Dropping store write for {} ({})", job.key, reason);
            }
            self.metrics.write_backs_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Waits until every write submitted before this call has finished.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run(
    store: Arc<dyn BlobStore>,
    mut rx: mpsc::Receiver<Message>,
    concurrency: usize,
    metrics: Arc<Metrics>,
) {
    let mut in_flight = JoinSet::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Write(job) => {
                while in_flight.len() >= concurrency {
                    reap(in_flight.join_next().await);
                }
                let store = store.clone();
                let metrics = metrics.clone();
                in_flight.spawn(async move { write_one(store.as_ref(), job, &metrics).await });
            }
            Message::Flush(done) => {
                while let Some(res) = in_flight.join_next().await {
                    reap(Some(res));
                }
                let _ = done.send(());
            }
        }
    }
    while let Some(res) = in_flight.join_next().await {
        reap(Some(res));
    }
}

fn reap(res: Option<Result<(), tokio::task::JoinError>>) {
    if let Some(Err(e)) = res {
        tracing::error!("Store write task failed: {}", e);
    }
}

async fn write_one(store: &dyn BlobStore, job: WriteJob, metrics: &Metrics) {
    let size = job.data.len();
    match store.put(&job.key, job.data, job.headers).await {
        Ok(()) => {
            metrics.store_writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Stored {} ({} bytes) in {}", job.key, size, store.name());
        }
        Err(e) => {
            metrics.store_write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Failed to store {} in {}: {}", job.key, store.name(), e);
        }
    }
}
