//! Progress reporting shared by sweeps, transfers and background hashing.
//!
//! Every long-running operation takes a `&dyn ProgressCallback<T>` where `T`
//! describes that operation. Returning `false` from the callback cancels the
//! operation at its next checkpoint.

use std::marker::PhantomData;

/// Generic progress callback trait.
pub trait ProgressCallback<T>: Send + Sync {
    /// Called with progress updates.
    ///
    /// # Returns
    /// - `true` to continue the operation
    /// - `false` to cancel the operation
    fn on_progress(&self, progress: &T) -> bool;
}

/// A no-op progress callback that always continues.
pub struct NoOpProgress;

impl<T> ProgressCallback<T> for NoOpProgress {
    fn on_progress(&self, _progress: &T) -> bool {
        true
    }
}

/// A progress callback that wraps a closure.
pub struct FnProgress<F, T> {
    callback: F,
    _marker: PhantomData<T>,
}

impl<F, T> FnProgress<F, T>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

impl<F, T> ProgressCallback<T> for FnProgress<F, T>
where
    F: Fn(&T) -> bool + Send + Sync,
    T: Send + Sync,
{
    fn on_progress(&self, progress: &T) -> bool {
        (self.callback)(progress)
    }
}

/// Create a progress callback from a closure.
///
/// # Arguments
/// * `f` - Closure that receives progress and returns whether to continue
pub fn progress_fn<F, T>(f: F) -> FnProgress<F, T>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    FnProgress::new(f)
}

/// Count-based progress for object transfers and sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountProgress {
    /// Items finished so far, successful or not.
    pub completed: u64,
    /// Items in the whole operation.
    pub total: u64,
}

impl CountProgress {
    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }

    /// Whether every item has been accounted for.
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}
