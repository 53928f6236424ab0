use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::FailureKind;
use crate::messagers::{Failures, Messager};

/// Batches in flight per worker before the producer waits
const WORKER_CHANNEL_SIZE: usize = 4;

/// Feeds a messager from a local sequence instead of a broker.
///
/// Items are grouped into order-preserving batches of `batch_size`, and
/// each batch is one input to `Messager::consume`. With `threads == 0`
/// batches are consumed inline, one after another. Otherwise batches are
/// handed round-robin to `threads` worker tasks over bounded channels, and
/// may complete in any order.
pub struct GeneratorRunner<T, M> {
    messager: Arc<M>,
    threads: usize,
    batch_size: usize,
    name: String,
    _items: PhantomData<fn(T)>,
}

impl<T, M> GeneratorRunner<T, M>
where
    T: Send + Sync + 'static,
    M: Messager<Vec<T>> + 'static,
{
    pub fn new(messager: Arc<M>) -> Self {
        Self {
            messager,
            threads: 0,
            batch_size: 1,
            name: "generator-runner".to_string(),
            _items: PhantomData,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Values below 1 are treated as 1
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn messager(&self) -> &M {
        &self.messager
    }

    /// Consume every item and merge the per-batch outcomes
    pub async fn consume<I>(&self, items: I) -> Failures
    where
        I: IntoIterator<Item = T>,
    {
        let batches = Batches::new(items.into_iter(), self.batch_size);
        let failures = if self.threads == 0 {
            self.consume_inline(batches).await
        } else {
            self.consume_pooled(batches).await
        };

        info!(
            runner = %self.name,
            temporary = failures.any_temporary(),
            permanent = failures.any_permanent(),
            "Generator exhausted"
        );
        failures
    }

    async fn consume_inline<B>(&self, batches: B) -> Failures
    where
        B: Iterator<Item = Vec<T>>,
    {
        let mut failures = Failures::default();
        for (index, batch) in batches.enumerate() {
            failures = failures.merge(consume_batch(self.messager.clone(), index, batch).await);
        }
        failures
    }

    async fn consume_pooled<B>(&self, batches: B) -> Failures
    where
        B: Iterator<Item = Vec<T>>,
    {
        let mut senders = Vec::with_capacity(self.threads);
        let mut workers = Vec::with_capacity(self.threads);

        for worker_id in 0..self.threads {
            let (tx, mut rx) = mpsc::channel::<(usize, Vec<T>)>(WORKER_CHANNEL_SIZE);
            let messager = self.messager.clone();
            senders.push(tx);
            workers.push(tokio::spawn(async move {
                let mut failures = Failures::default();
                while let Some((index, batch)) = rx.recv().await {
                    debug!(worker_id, index, "Batch received");
                    failures = failures.merge(consume_batch(messager.clone(), index, batch).await);
                }
                failures
            }));
        }

        let mut failures = Failures::default();
        for (index, batch) in batches.enumerate() {
            let worker = index % senders.len();
            if senders[worker].send((index, batch)).await.is_err() {
                warn!(worker, index, "Worker stopped, batch not processed");
                failures.record(FailureKind::Permanent);
            }
        }
        drop(senders);

        for handle in workers {
            match handle.await {
                Ok(worker_failures) => failures = failures.merge(worker_failures),
                Err(err) => {
                    error!(error = %err, "Generator worker stopped");
                    failures.record(FailureKind::Permanent);
                }
            }
        }
        failures
    }
}

/// Consume one batch on its own task, so a panicking messager is recorded as
/// a permanent failure instead of unwinding into the caller
async fn consume_batch<T, M>(messager: Arc<M>, index: usize, batch: Vec<T>) -> Failures
where
    T: Send + Sync + 'static,
    M: Messager<Vec<T>> + ?Sized + 'static,
{
    let span = tracing::info_span!("batch", index, size = batch.len());
    let handle = tokio::spawn(async move { messager.consume(&batch).await }.instrument(span));

    match handle.await {
        Ok(failures) => failures,
        Err(err) => {
            error!(index, error = %err, "Batch consume panicked");
            Failures::permanent()
        }
    }
}

/// Splits an iterator into consecutive chunks of at most `size` items
struct Batches<I> {
    items: I,
    size: usize,
}

impl<I> Batches<I> {
    fn new(items: I, size: usize) -> Self {
        Self { items, size }
    }
}

impl<I: Iterator> Iterator for Batches<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<_> = self.items.by_ref().take(self.size).collect();
        (!batch.is_empty()).then_some(batch)
    }
}
