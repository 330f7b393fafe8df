//! # Batching Operations Queue
//!
//! [`BatchingOperationsQueue`] absorbs concurrently submitted operations and
//! hands them to a single consumer in ordered batches. At most one batch
//! consumer runs at a time; every submission gets its own [`Completion`].
//!
//! ```text
//!   add(v) ──┐                                   ┌── complete_elements(..)
//!   add(v) ──┼─► pending ──fill_current_batch──► current ──► futures resolve
//!   add(v) ──┘   (backlog)        (max units)     batch
//!      │
//!      └── trigger OPEN → CLOSED ──► batch_fn(initial_batch)
//! ```
//!
//! ## The Trigger
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Open` | no consumer running; the next `add` starts one |
//! | `Closed` | a consumer is running (or has been asked to start) |
//! | `Wait` | paused; `fill_current_batch` hands out nothing until `resume` |
//!
//! The consumer keeps calling [`BatchingOperationsQueue::fill_current_batch`]
//! until it returns `false`. Returning `false` on an empty queue reopens the
//! trigger under the exclusive gate, so an `add` racing with it either lands
//! in the batch or starts the next consumer. It is never lost.
//!
//! ## Backlog
//!
//! Each value carries a cost from the size function (at least 1). The cost
//! is added to the backlog on submission and removed when the element leaves
//! `pending`, so the backlog measures work not yet handed to the consumer.
//!
//! ## Rust Concepts
//!
//! - **`RwLock<()>` as a gate**: submitters share it, exclusive operations
//!   (fill, error handling, close) take it alone.
//! - **Hand-written `Future`**: a [`Completion`] stores its outcome and the
//!   wakers of everyone awaiting it.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll, Waker};

use futures::future::join_all;
use tracing::{debug, trace};

use crate::error::{Error, Result};

// =============================================================================
// Completion
// =============================================================================

/// Future for one submitted operation.
///
/// The first of `complete`, `fail` and `cancel` wins; later calls return
/// `false` and change nothing. Clones share the outcome.
pub struct Completion<R> {
    state: Arc<Mutex<CompletionState<R>>>,
}

struct CompletionState<R> {
    outcome: Option<Result<R>>,
    cancelled: bool,
    wakers: Vec<Waker>,
}

impl<R> Completion<R> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CompletionState {
                outcome: None,
                cancelled: false,
                wakers: Vec::new(),
            })),
        }
    }

    pub fn complete(&self, value: R) -> bool {
        self.finish(Ok(value), false)
    }

    pub fn fail(&self, err: Error) -> bool {
        self.finish(Err(err), false)
    }

    /// Resolves with [`Error::Cancelled`]. Safe to call any number of times.
    pub fn cancel(&self) -> bool {
        self.finish(Err(Error::Cancelled), true)
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    fn finish(&self, outcome: Result<R>, cancelled: bool) -> bool {
        let wakers = {
            let mut state = lock(&self.state);
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.cancelled = cancelled;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<R> Clone for Completion<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R> Default for Completion<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for Completion<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<R: Clone> Future for Completion<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.state);
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

// =============================================================================
// Error Actions
// =============================================================================

/// What [`BatchingOperationsQueue::handle_error`] does with outstanding elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnErrorAction {
    /// Requeue the current batch at the front of pending and restart.
    Retry,
    /// Resolve everything with the default value.
    Complete,
    CompleteAndClose,
    /// Fail everything with the error.
    CompleteWithException,
    CompleteWithExceptionAndClose,
    /// Cancel everything.
    Cancel,
    CancelAndClose,
}

impl OnErrorAction {
    fn closes(self) -> bool {
        matches!(
            self,
            Self::CompleteAndClose | Self::CompleteWithExceptionAndClose | Self::CancelAndClose
        )
    }
}

// =============================================================================
// Trigger
// =============================================================================

const TRIGGER_OPEN: u8 = 0;
const TRIGGER_CLOSED: u8 = 1;
const TRIGGER_WAIT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Open,
    Closed,
    Wait,
}

impl TriggerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            TRIGGER_OPEN => Self::Open,
            TRIGGER_WAIT => Self::Wait,
            _ => Self::Closed,
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Called with the initial batch size when a consumer should start.
pub type BatchFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Backlog cost of one value.
pub type SizeFn<V> = Arc<dyn Fn(&V) -> u64 + Send + Sync>;

struct Entry<V, R> {
    value: V,
    completion: Completion<R>,
    cost: u64,
}

impl<V, R> Entry<V, R> {
    fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}

/// Concurrent batching queue with one consumer at a time.
pub struct BatchingOperationsQueue<V, R> {
    gate: RwLock<()>,
    pending: Mutex<VecDeque<Entry<V, R>>>,
    current: Mutex<VecDeque<Entry<V, R>>>,
    trigger: AtomicU8,
    active: AtomicBool,
    backlog: AtomicU64,
    initial_batch: usize,
    batch_fn: BatchFn,
    size_fn: SizeFn<V>,
}

impl<V, R> BatchingOperationsQueue<V, R>
where
    V: Send + 'static,
    R: Clone + Default + Send + 'static,
{
    /// A queue where every value costs one unit.
    pub fn new(initial_batch: usize, batch_fn: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self::with_size_fn(initial_batch, batch_fn, |_| 1)
    }

    pub fn with_size_fn(
        initial_batch: usize,
        batch_fn: impl Fn(usize) + Send + Sync + 'static,
        size_fn: impl Fn(&V) -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            gate: RwLock::new(()),
            pending: Mutex::new(VecDeque::new()),
            current: Mutex::new(VecDeque::new()),
            trigger: AtomicU8::new(TRIGGER_OPEN),
            active: AtomicBool::new(true),
            backlog: AtomicU64::new(0),
            initial_batch,
            batch_fn: Arc::new(batch_fn),
            size_fn: Arc::new(size_fn),
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Appends `value` and starts a consumer if none is running.
    pub fn add(&self, value: V) -> Result<Completion<R>> {
        self.submit(value, false)
    }

    /// Like [`add`](Self::add), but ahead of everything pending.
    pub fn add_first(&self, value: V) -> Result<Completion<R>> {
        self.submit(value, true)
    }

    fn submit(&self, value: V, at_front: bool) -> Result<Completion<R>> {
        let completion = Completion::new();
        {
            let _gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
            if !self.is_active() {
                return Err(Error::QueueInactive);
            }

            let cost = (self.size_fn)(&value).max(1);
            self.backlog.fetch_add(cost, Ordering::SeqCst);
            let entry = Entry {
                value,
                completion: completion.clone(),
                cost,
            };

            let mut pending = lock(&self.pending);
            if at_front {
                pending.push_front(entry);
            } else {
                pending.push_back(entry);
            }
        }

        self.start_consumer();
        Ok(completion)
    }

    fn start_consumer(&self) {
        if self
            .trigger
            .compare_exchange(TRIGGER_OPEN, TRIGGER_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            trace!(initial_batch = self.initial_batch, "starting batch consumer");
            (self.batch_fn)(self.initial_batch);
        }
    }

    // =========================================================================
    // Consumer Side
    // =========================================================================

    /// Moves pending elements into the current batch until it holds
    /// `max_units` of cost.
    ///
    /// Returns `false` when there is nothing to process. On an empty queue
    /// the trigger reopens; while paused it stays `Wait`.
    pub fn fill_current_batch(&self, max_units: u64) -> bool {
        let _gate = self.gate.write().unwrap_or_else(|e| e.into_inner());
        let mut pending = lock(&self.pending);
        let mut current = lock(&self.current);

        if self.trigger.load(Ordering::SeqCst) == TRIGGER_WAIT {
            return false;
        }

        current.retain(|entry| !entry.is_done());
        let mut units: u64 = current.iter().map(|entry| entry.cost).sum();

        while units < max_units {
            let Some(entry) = pending.pop_front() else {
                break;
            };
            self.release_backlog(entry.cost);
            if entry.is_done() {
                continue;
            }
            units += entry.cost;
            current.push_back(entry);
        }

        if current.is_empty() {
            self.trigger.store(TRIGGER_OPEN, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Values of the unresolved elements in the current batch, in order.
    ///
    /// Elements resolved elsewhere are dropped from the batch first, so the
    /// returned values line up with the slots [`complete_elements`] fills.
    ///
    /// [`complete_elements`]: Self::complete_elements
    pub fn get_current_batch_values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut current = lock(&self.current);
        current.retain(|entry| !entry.is_done());
        current.iter().map(|entry| entry.value.clone()).collect()
    }

    /// True when every element of the current batch is resolved.
    pub fn is_batch_complete(&self) -> bool {
        lock(&self.current).iter().all(Entry::is_done)
    }

    /// Resolves the first element of the current batch.
    ///
    /// Returns `false` if the batch was empty or its first element was
    /// already resolved elsewhere.
    pub fn complete_element(&self, value: R) -> bool {
        self.complete_elements(vec![Ok(value)]) == 1
    }

    /// Resolves the first `results.len()` elements of the current batch,
    /// one result per slot, normally or exceptionally.
    ///
    /// A slot whose element was cancelled after the values were taken still
    /// consumes its result, which is dropped. Returns the number of elements
    /// this call resolved.
    pub fn complete_elements(&self, results: Vec<Result<R>>) -> usize {
        let _gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        let mut current = lock(&self.current);
        let mut resolved = 0;

        for result in results {
            let Some(entry) = current.pop_front() else {
                break;
            };
            let done = match result {
                Ok(value) => entry.completion.complete(value),
                Err(err) => entry.completion.fail(err),
            };
            if done {
                resolved += 1;
            }
        }
        resolved
    }

    /// Hands each result to the next unresolved element of the current
    /// batch, skipping elements resolved elsewhere.
    ///
    /// For results that are not tied to a particular submitted value, such
    /// as elements read on behalf of whichever receivers are still waiting.
    pub fn complete_unresolved(&self, results: Vec<Result<R>>) -> usize {
        let _gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        let mut current = lock(&self.current);
        let mut resolved = 0;

        for result in results {
            let entry = loop {
                match current.pop_front() {
                    Some(entry) if entry.is_done() => continue,
                    other => break other,
                }
            };
            let Some(entry) = entry else {
                break;
            };
            match result {
                Ok(value) => entry.completion.complete(value),
                Err(err) => entry.completion.fail(err),
            };
            resolved += 1;
        }
        resolved
    }

    // =========================================================================
    // Errors and Lifecycle
    // =========================================================================

    /// Applies `action` to the outstanding elements. `None` behaves as
    /// [`OnErrorAction::CompleteWithException`].
    ///
    /// Every action other than `Retry` resolves both the current batch and
    /// pending, and reopens the trigger unless it closes the queue. The
    /// calling consumer should stop after it.
    pub fn handle_error(&self, err: Error, action: Option<OnErrorAction>) {
        let action = action.unwrap_or(OnErrorAction::CompleteWithException);
        debug!(?action, error = %err, "batch error");

        if action == OnErrorAction::Retry {
            {
                let _gate = self.gate.write().unwrap_or_else(|e| e.into_inner());
                let mut pending = lock(&self.pending);
                let mut current = lock(&self.current);
                while let Some(entry) = current.pop_back() {
                    if entry.is_done() {
                        continue;
                    }
                    self.backlog.fetch_add(entry.cost, Ordering::SeqCst);
                    pending.push_front(entry);
                }
                self.trigger.store(TRIGGER_CLOSED, Ordering::SeqCst);
            }
            (self.batch_fn)(self.initial_batch);
            return;
        }

        let entries: Vec<Entry<V, R>> = {
            let _gate = self.gate.write().unwrap_or_else(|e| e.into_inner());
            let mut pending = lock(&self.pending);
            let mut current = lock(&self.current);
            for entry in pending.iter() {
                self.release_backlog(entry.cost);
            }
            if action.closes() {
                self.active.store(false, Ordering::SeqCst);
            } else {
                // Nothing is left to consume; the next add starts a consumer.
                let _ = self.trigger.compare_exchange(
                    TRIGGER_CLOSED,
                    TRIGGER_OPEN,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            current.drain(..).chain(pending.drain(..)).collect()
        };

        for entry in entries {
            match action {
                OnErrorAction::Complete | OnErrorAction::CompleteAndClose => {
                    entry.completion.complete(R::default());
                }
                OnErrorAction::Cancel | OnErrorAction::CancelAndClose => {
                    entry.completion.cancel();
                }
                _ => {
                    entry.completion.fail(err.clone());
                }
            }
        }
    }

    /// Cancels every outstanding element and closes the queue.
    pub fn cancel_all_and_close(&self) {
        self.handle_error(Error::Cancelled, Some(OnErrorAction::CancelAndClose));
    }

    /// Stops accepting submissions. Elements already queued are still
    /// handed to the consumer.
    pub fn close(&self) {
        let _gate = self.gate.write().unwrap_or_else(|e| e.into_inner());
        self.active.store(false, Ordering::SeqCst);
    }

    /// Resolves once every element outstanding now has resolved.
    pub fn flush(&self) -> impl Future<Output = ()> + Send + 'static {
        let outstanding: Vec<Completion<R>> = {
            let _gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
            let current = lock(&self.current);
            let pending = lock(&self.pending);
            current
                .iter()
                .chain(pending.iter())
                .filter(|entry| !entry.is_done())
                .map(|entry| entry.completion.clone())
                .collect()
        };
        async move {
            join_all(outstanding).await;
        }
    }

    /// Stops handing out batches until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.trigger.store(TRIGGER_WAIT, Ordering::SeqCst);
    }

    /// Leaves the paused state and restarts the consumer.
    pub fn resume(&self) {
        if self
            .trigger
            .compare_exchange(TRIGGER_WAIT, TRIGGER_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            (self.batch_fn)(self.initial_batch);
        }
    }

    /// Forces the trigger open so the next `add` starts a consumer.
    pub fn reset_trigger(&self) {
        self.trigger.store(TRIGGER_OPEN, Ordering::SeqCst);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn current_batch_len(&self) -> usize {
        lock(&self.current).len()
    }

    /// Cost of the elements not yet handed to the consumer.
    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::SeqCst)
    }

    pub fn trigger_state(&self) -> TriggerState {
        TriggerState::from_raw(self.trigger.load(Ordering::SeqCst))
    }

    fn release_backlog(&self, cost: u64) {
        let _ = self
            .backlog
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(cost)));
    }
}

impl<V, R> fmt::Debug for BatchingOperationsQueue<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingOperationsQueue")
            .field("active", &self.active.load(Ordering::SeqCst))
            .field("trigger", &TriggerState::from_raw(self.trigger.load(Ordering::SeqCst)))
            .field("backlog", &self.backlog.load(Ordering::SeqCst))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn queue() -> (Arc<AtomicUsize>, BatchingOperationsQueue<u32, u32>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let queue = BatchingOperationsQueue::new(8, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (calls, queue)
    }

    #[test]
    fn test_add_starts_one_consumer() {
        let (calls, queue) = queue();
        queue.add(1).unwrap();
        queue.add(2).unwrap();
        queue.add(3).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.trigger_state(), TriggerState::Closed);
        assert_eq!(queue.pending_len(), 3);
        assert_eq!(queue.backlog(), 3);
    }

    #[test]
    fn test_fill_respects_max_units() {
        let (_, queue) = queue();
        for i in 0..5 {
            queue.add(i).unwrap();
        }

        assert!(queue.fill_current_batch(2));
        assert_eq!(queue.get_current_batch_values(), vec![0, 1]);
        assert_eq!(queue.backlog(), 3);

        // The unfinished batch already counts toward the limit.
        assert!(queue.fill_current_batch(3));
        assert_eq!(queue.get_current_batch_values(), vec![0, 1, 2]);
    }

    #[test]
    fn test_fill_on_empty_queue_reopens_trigger() {
        let (calls, queue) = queue();
        let c = queue.add(1).unwrap();
        assert!(queue.fill_current_batch(10));
        assert!(queue.complete_element(7));
        assert!(c.is_done());

        assert!(!queue.fill_current_batch(10));
        assert_eq!(queue.trigger_state(), TriggerState::Open);

        queue.add(2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancelled_elements_are_skipped() {
        let (_, queue) = queue();
        let first = queue.add(1).unwrap();
        queue.add(2).unwrap();

        assert!(first.cancel());
        assert!(!first.cancel());
        assert!(queue.fill_current_batch(10));
        assert_eq!(queue.get_current_batch_values(), vec![2]);
        assert_eq!(queue.backlog(), 0);
    }

    #[tokio::test]
    async fn test_complete_elements_in_order() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        let b = queue.add(2).unwrap();
        let c = queue.add(3).unwrap();
        assert!(queue.fill_current_batch(10));

        let resolved = queue.complete_elements(vec![Ok(10), Err(Error::Batch("bad".into()))]);
        assert_eq!(resolved, 2);
        assert!(!queue.is_batch_complete());
        assert!(queue.complete_element(30));
        assert!(queue.is_batch_complete());

        assert_eq!(a.await.unwrap(), 10);
        assert!(matches!(b.await, Err(Error::Batch(_))));
        assert_eq!(c.await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_cancelled_in_flight_element_keeps_its_slot() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        let b = queue.add(2).unwrap();
        let c = queue.add(3).unwrap();
        assert!(queue.fill_current_batch(10));
        assert_eq!(queue.get_current_batch_values(), vec![1, 2, 3]);

        assert!(b.cancel());
        assert_eq!(queue.complete_elements(vec![Ok(10), Ok(20), Ok(30)]), 2);
        assert!(queue.is_batch_complete());

        assert_eq!(a.await.unwrap(), 10);
        assert!(matches!(b.await, Err(Error::Cancelled)));
        assert_eq!(c.await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_batch_values_drop_elements_cancelled_before_handout() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        let b = queue.add(2).unwrap();
        let c = queue.add(3).unwrap();
        assert!(queue.fill_current_batch(10));

        assert!(b.cancel());
        assert_eq!(queue.get_current_batch_values(), vec![1, 3]);
        assert_eq!(queue.complete_elements(vec![Ok(10), Ok(30)]), 2);

        assert_eq!(a.await.unwrap(), 10);
        assert_eq!(c.await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_complete_unresolved_skips_cancelled() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        let b = queue.add(2).unwrap();
        let c = queue.add(3).unwrap();
        assert!(queue.fill_current_batch(10));
        assert_eq!(queue.get_current_batch_values().len(), 3);

        assert!(a.cancel());
        assert_eq!(queue.complete_unresolved(vec![Ok(10)]), 1);
        assert!(!queue.is_batch_complete());
        assert_eq!(queue.complete_unresolved(vec![Ok(20), Ok(30)]), 1);
        assert!(queue.is_batch_complete());

        assert_eq!(b.await.unwrap(), 10);
        assert_eq!(c.await.unwrap(), 20);
    }

    #[test]
    fn test_retry_requeues_in_front_of_pending() {
        let (calls, queue) = queue();
        for i in 0..4 {
            queue.add(i).unwrap();
        }
        assert!(queue.fill_current_batch(2));
        queue.handle_error(Error::Batch("retry".into()), Some(OnErrorAction::Retry));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.current_batch_len(), 0);
        assert_eq!(queue.backlog(), 4);
        assert!(queue.fill_current_batch(4));
        assert_eq!(queue.get_current_batch_values(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_exception_and_close_fails_everything() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        let b = queue.add(2).unwrap();
        assert!(queue.fill_current_batch(1));

        queue.handle_error(
            Error::Batch("boom".into()),
            Some(OnErrorAction::CompleteWithExceptionAndClose),
        );

        assert!(matches!(a.await, Err(Error::Batch(_))));
        assert!(matches!(b.await, Err(Error::Batch(_))));
        assert!(!queue.is_active());
        assert!(matches!(queue.add(3), Err(Error::QueueInactive)));
        assert_eq!(queue.backlog(), 0);
    }

    #[tokio::test]
    async fn test_missing_action_fails_with_error() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        queue.handle_error(Error::Batch("x".into()), None);
        assert!(matches!(a.await, Err(Error::Batch(_))));
        assert!(queue.is_active());
    }

    #[tokio::test]
    async fn test_complete_resolves_with_default() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        queue.handle_error(Error::Batch("x".into()), Some(OnErrorAction::Complete));
        assert_eq!(a.await.unwrap(), 0);
    }

    #[test]
    fn test_non_retry_error_reopens_trigger() {
        let (calls, queue) = queue();
        queue.add(1).unwrap();
        assert!(queue.fill_current_batch(10));
        assert_eq!(queue.trigger_state(), TriggerState::Closed);

        queue.handle_error(Error::Batch("x".into()), Some(OnErrorAction::Complete));
        assert_eq!(queue.trigger_state(), TriggerState::Open);
        assert_eq!(queue.backlog(), 0);

        queue.add(2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.trigger_state(), TriggerState::Closed);
    }

    #[test]
    fn test_closing_error_leaves_trigger_closed() {
        let (_, queue) = queue();
        queue.add(1).unwrap();
        queue.handle_error(
            Error::Batch("x".into()),
            Some(OnErrorAction::CompleteWithExceptionAndClose),
        );
        assert_eq!(queue.trigger_state(), TriggerState::Closed);
        assert!(!queue.is_active());
    }

    #[tokio::test]
    async fn test_cancel_all_and_close() {
        let (_, queue) = queue();
        let a = queue.add(1).unwrap();
        queue.cancel_all_and_close();
        assert!(a.is_cancelled());
        assert!(matches!(a.await, Err(Error::Cancelled)));
        assert!(!queue.is_active());
    }

    #[tokio::test]
    async fn test_flush_waits_for_outstanding() {
        let (_, queue) = queue();
        let queue = Arc::new(queue);
        queue.add(1).unwrap();
        queue.add(2).unwrap();
        let flushed = queue.flush();

        let worker = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(worker.fill_current_batch(10));
            worker.complete_elements(vec![Ok(1), Ok(2)]);
        });

        tokio::time::timeout(Duration::from_secs(1), flushed)
            .await
            .unwrap();
        assert!(queue.is_batch_complete());
    }

    #[test]
    fn test_pause_and_resume() {
        let (calls, queue) = queue();
        queue.add(1).unwrap();
        queue.pause();
        assert!(!queue.fill_current_batch(10));
        assert_eq!(queue.trigger_state(), TriggerState::Wait);

        queue.resume();
        assert_eq!(queue.trigger_state(), TriggerState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(queue.fill_current_batch(10));
    }

    #[test]
    fn test_size_fn_drives_backlog() {
        let queue: BatchingOperationsQueue<Vec<u8>, u32> =
            BatchingOperationsQueue::with_size_fn(1, |_| {}, |v: &Vec<u8>| v.len() as u64);
        queue.add(vec![0; 10]).unwrap();
        queue.add(Vec::new()).unwrap();
        assert_eq!(queue.backlog(), 11);

        assert!(queue.fill_current_batch(5));
        assert_eq!(queue.current_batch_len(), 1);
        assert_eq!(queue.backlog(), 1);
    }

    #[test]
    fn test_close_keeps_queued_elements() {
        let (_, queue) = queue();
        queue.add(1).unwrap();
        queue.close();
        assert!(matches!(queue.add(2), Err(Error::QueueInactive)));
        assert!(queue.fill_current_batch(10));
        assert_eq!(queue.get_current_batch_values(), vec![1]);
    }
}
