//! Completion bookkeeping shared by device contexts and the scheduler.
//!
//! A signaled work request carries a `wr_id` that indexes a [`CompletionRegistry`]
//! instead of a pointer. The poller removes the record by id, so a completion that
//! is reported twice finds nothing the second time instead of touching freed memory.
//!
//! [`AggregateCompletion`] folds the completions of the physical sub-requests of
//! one logical transfer into a single callback invocation.
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// `wr_id` of work requests that do not generate a completion.
pub const UNSIGNALED_WR_ID: u64 = 0;

/// `wr_id` of the wake-up request posted when a context shuts down.
pub const SHUTDOWN_WR_ID: u64 = u64::MAX;

/// Outcome of a work request or of a whole logical transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// Carries the `ibv_wc_status` reported by the fabric, or
    /// [`CompletionStatus::POST_FAILURE`] when the request never reached it.
    Failed(u32),
}

impl CompletionStatus {
    /// Status code used when a request was rejected before posting.
    pub const POST_FAILURE: u32 = u32::MAX;

    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }

    /// Numeric code in the convention of the C verbs API: 0 for success.
    pub fn code(&self) -> u32 {
        match self {
            CompletionStatus::Success => 0,
            CompletionStatus::Failed(code) => *code,
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Success => write!(f, "success"),
            CompletionStatus::Failed(code) => write!(f, "failed({code})"),
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// Outstanding completion records of one device context, keyed by `wr_id`.
pub struct CompletionRegistry {
    next_id: AtomicU64,
    records: Mutex<HashMap<u64, CompletionCallback>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `callback` and returns the id to put in the signaled work request.
    pub fn insert(&self, callback: CompletionCallback) -> u64 {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while id == UNSIGNALED_WR_ID || id == SHUTDOWN_WR_ID {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        self.lock().insert(id, callback);
        id
    }

    /// Removes and returns the record for `id`; `None` if it was already taken.
    pub fn take(&self, id: u64) -> Option<CompletionCallback> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every outstanding record without invoking it. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut records = self.lock();
        let dropped = records.len();
        records.clear();
        dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CompletionCallback>> {
        // Callbacks never run while this lock is held.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CompletionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter state meaning "a sub-request already failed".
const AGGREGATE_FAILED: i64 = -1;

/// Reconciles `expected` sub-completions into one invocation of `callback`.
///
/// Successes increment a counter; the one that brings it to `expected` fires the
/// callback with `Success`. The first failure swaps the counter to a failed
/// sentinel and fires the callback with that failure. Whichever fires first wins;
/// the callback runs at most once.
pub struct AggregateCompletion {
    expected: i64,
    done: AtomicI64,
    callback: Mutex<Option<CompletionCallback>>,
}

impl AggregateCompletion {
    pub fn new(expected: usize, callback: CompletionCallback) -> Self {
        Self {
            expected: expected as i64,
            done: AtomicI64::new(0),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Records one sub-completion.
    pub fn on_completion(&self, status: CompletionStatus) {
        match status {
            CompletionStatus::Success => {
                let prev = self
                    .done
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |done| {
                        if done == AGGREGATE_FAILED {
                            None
                        } else {
                            Some(done + 1)
                        }
                    });
                if let Ok(prev) = prev {
                    if prev + 1 == self.expected {
                        self.fire(CompletionStatus::Success);
                    }
                }
            }
            CompletionStatus::Failed(code) => {
                if self.mark_failed() {
                    tracing::warn!("sub-request failed with status {code}, failing transfer");
                    self.fire(status);
                }
            }
        }
    }

    /// Moves to the failed state without invoking the callback.
    ///
    /// Used when the caller learns about the failure synchronously, e.g. from a
    /// posting error returned by `submit`.
    pub fn abandon(&self) {
        if self.mark_failed() {
            self.callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.done.load(Ordering::Acquire) == AGGREGATE_FAILED
    }

    /// Number of successful sub-completions seen so far (0 once failed).
    pub fn completed(&self) -> usize {
        self.done.load(Ordering::Acquire).max(0) as usize
    }

    pub fn expected(&self) -> usize {
        self.expected as usize
    }

    /// True only for the caller that performed the transition into the failed state.
    fn mark_failed(&self) -> bool {
        self.done.swap(AGGREGATE_FAILED, Ordering::AcqRel) != AGGREGATE_FAILED
    }

    fn fire(&self, status: CompletionStatus) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            callback(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    fn counting_callback() -> (CompletionCallback, Arc<Mutex<Vec<CompletionStatus>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let callback: CompletionCallback =
            Box::new(move |status: CompletionStatus| sink.lock().unwrap().push(status));
        (callback, fired)
    }

    #[test]
    fn test_registry_ids_are_unique_and_taken_once() {
        let registry = CompletionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let a = registry.insert(Box::new(move |_: CompletionStatus| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let b = registry.insert(Box::new(|_: CompletionStatus| {}));
        assert_ne!(a, b);
        assert_ne!(a, UNSIGNALED_WR_ID);
        assert_eq!(registry.len(), 2);

        let callback = registry.take(a).unwrap();
        callback(CompletionStatus::Success);
        assert!(registry.take(a).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_aggregate_fires_once_after_all_successes() {
        let (callback, fired) = counting_callback();
        let aggregate = AggregateCompletion::new(3, callback);

        aggregate.on_completion(CompletionStatus::Success);
        aggregate.on_completion(CompletionStatus::Success);
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(aggregate.completed(), 2);

        aggregate.on_completion(CompletionStatus::Success);
        assert_eq!(*fired.lock().unwrap(), vec![CompletionStatus::Success]);
    }

    #[test]
    fn test_aggregate_failure_suppresses_success() {
        let (callback, fired) = counting_callback();
        let aggregate = AggregateCompletion::new(3, callback);

        aggregate.on_completion(CompletionStatus::Success);
        aggregate.on_completion(CompletionStatus::Failed(12));
        aggregate.on_completion(CompletionStatus::Success);
        aggregate.on_completion(CompletionStatus::Success);
        aggregate.on_completion(CompletionStatus::Failed(5));

        assert_eq!(*fired.lock().unwrap(), vec![CompletionStatus::Failed(12)]);
        assert!(aggregate.is_failed());
    }

    #[test]
    fn test_aggregate_failure_in_last_position() {
        let (callback, fired) = counting_callback();
        let aggregate = AggregateCompletion::new(2, callback);

        aggregate.on_completion(CompletionStatus::Success);
        aggregate.on_completion(CompletionStatus::Failed(4));

        assert_eq!(*fired.lock().unwrap(), vec![CompletionStatus::Failed(4)]);
    }

    #[test]
    fn test_aggregate_concurrent_failures_fire_once() {
        for _ in 0..50 {
            let (callback, fired) = counting_callback();
            let aggregate = Arc::new(AggregateCompletion::new(16, callback));

            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let aggregate = aggregate.clone();
                    thread::spawn(move || {
                        if i % 2 == 0 {
                            aggregate.on_completion(CompletionStatus::Failed(i));
                        } else {
                            aggregate.on_completion(CompletionStatus::Success);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let fired = fired.lock().unwrap();
            assert_eq!(fired.len(), 1);
            assert!(!fired[0].is_success());
        }
    }

    #[test]
    fn test_aggregate_concurrent_successes_fire_once() {
        let (callback, fired) = counting_callback();
        let aggregate = Arc::new(AggregateCompletion::new(64, callback));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let aggregate = aggregate.clone();
                thread::spawn(move || aggregate.on_completion(CompletionStatus::Success))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*fired.lock().unwrap(), vec![CompletionStatus::Success]);
    }

    #[test]
    fn test_abandon_never_fires() {
        let (callback, fired) = counting_callback();
        let aggregate = AggregateCompletion::new(2, callback);

        aggregate.on_completion(CompletionStatus::Success);
        aggregate.abandon();
        aggregate.on_completion(CompletionStatus::Success);
        aggregate.on_completion(CompletionStatus::Failed(1));

        assert!(fired.lock().unwrap().is_empty());
        assert!(aggregate.is_failed());
    }
}
