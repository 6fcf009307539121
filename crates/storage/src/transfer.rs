//! Bounded parallel transfer loop shared by the backends.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dataset_sync_common::ProgressCallback;
use futures::stream::{self, StreamExt};

use crate::error::StorageError;
use crate::types::{OperationType, PullObject, PushObject, TransferProgress};

/// Something that can be transferred and reported on.
pub trait TransferItem {
    /// Key shown in progress updates and errors.
    fn key(&self) -> &str;
    fn size(&self) -> u64;
}

impl TransferItem for PushObject {
    fn key(&self) -> &str {
        &self.dataset_path
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl TransferItem for PullObject {
    fn key(&self) -> &str {
        &self.dataset_path
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Run `transfer` over every item with at most `max_concurrency` in flight.
///
/// Every item comes back exactly once with its outcome, in completion
/// order. When `progress` returns `false` no further items are started and
/// the ones that never ran come back as `StorageError::Cancelled`; items
/// already in flight keep their real outcome.
///
/// # Arguments
/// * `items` - Objects to transfer
/// * `operation` - Reported in progress updates
/// * `max_concurrency` - Upper bound on concurrent transfers
/// * `progress` - Called after each item completes
/// * `transfer` - Performs one transfer
pub async fn run_transfers<T, F, Fut>(
    items: Vec<T>,
    operation: OperationType,
    max_concurrency: usize,
    progress: &dyn ProgressCallback<TransferProgress>,
    transfer: F,
) -> Vec<(T, Result<(), StorageError>)>
where
    T: TransferItem + Clone + Send,
    F: Fn(T) -> Fut + Sync,
    Fut: Future<Output = Result<(), StorageError>> + Send,
{
    if items.is_empty() {
        return Vec::new();
    }

    let total: u64 = items.len() as u64;
    let total_bytes: u64 = items.iter().map(|i| i.size()).sum();
    let completed_count = Arc::new(AtomicU64::new(0));
    let completed_bytes = Arc::new(AtomicU64::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));
    let transfer: &F = &transfer;

    stream::iter(items)
        .map(|item: T| {
            let completed_count = Arc::clone(&completed_count);
            let completed_bytes = Arc::clone(&completed_bytes);
            let cancelled = Arc::clone(&cancelled);

            async move {
                if cancelled.load(Ordering::Relaxed) {
                    return (item, Err(StorageError::Cancelled));
                }

                let result: Result<(), StorageError> = transfer(item.clone()).await;
                if let Err(e) = &result {
                    log::debug!("Transfer of {} failed: {}", item.key(), e);
                }

                let done: u64 = completed_count.fetch_add(1, Ordering::Relaxed) + 1;
                let bytes: u64 = completed_bytes.fetch_add(item.size(), Ordering::Relaxed) + item.size();
                let update: TransferProgress = TransferProgress {
                    operation,
                    current_key: item.key().to_string(),
                    overall_completed: done,
                    overall_total: total,
                    overall_bytes: bytes,
                    overall_total_bytes: total_bytes,
                };
                if !progress.on_progress(&update) {
                    cancelled.store(true, Ordering::Relaxed);
                }
                (item, result)
            }
        })
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await
}

/// Rebases progress from one batch onto totals spanning several batches,
/// and remembers whether the caller asked to stop.
pub(crate) struct BatchProgress<'a> {
    pub inner: &'a dyn ProgressCallback<TransferProgress>,
    pub completed_before: u64,
    pub bytes_before: u64,
    pub total: u64,
    pub total_bytes: u64,
    pub stopped: AtomicBool,
}

impl BatchProgress<'_> {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl ProgressCallback<TransferProgress> for BatchProgress<'_> {
    fn on_progress(&self, progress: &TransferProgress) -> bool {
        let rebased: TransferProgress = TransferProgress {
            operation: progress.operation,
            current_key: progress.current_key.clone(),
            overall_completed: self.completed_before + progress.overall_completed,
            overall_total: self.total,
            overall_bytes: self.bytes_before + progress.overall_bytes,
            overall_total_bytes: self.total_bytes,
        };
        let proceed: bool = self.inner.on_progress(&rebased);
        if !proceed {
            self.stopped.store(true, Ordering::Relaxed);
        }
        proceed
    }
}
