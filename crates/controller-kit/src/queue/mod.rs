//! Rate-limited, deduplicating work queue.
//!
//! The queue guarantees at most one in-flight processing attempt per item: an
//! item that is added while it is already queued is dropped, and an item that
//! is added while it is being processed is parked in the dirty set and
//! re-queued once [`WorkQueue::done`] frees its slot. Bursts of updates for
//! the same key therefore collapse into a single delivery, which is what
//! makes the control loop level-triggered.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use tokio::{
    sync::{Notify, mpsc},
    time::Instant,
};

mod rate_limiter;

pub use rate_limiter::ExponentialBackoff;

/// Bounds required of anything that can be enqueued.
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> State<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

/// A deduplicating queue with per-item retry backoff.
///
/// [`WorkQueue::new`] spawns the redelivery timer task and must therefore be
/// called from within a tokio runtime.
#[derive(Debug)]
pub struct WorkQueue<T: QueueItem> {
    name: String,
    state: Mutex<State<T>>,
    wake: Notify,
    backoff: ExponentialBackoff<T>,
    delayed: mpsc::UnboundedSender<(T, Instant)>,
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State::new()),
            wake: Notify::new(),
            backoff: ExponentialBackoff::default(),
            delayed: delayed_tx,
        });
        tokio::spawn(redeliver_loop(Arc::downgrade(&queue), delayed_rx));
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `item` unless it is already pending.
    pub fn add(&self, item: T) {
        let mut state = self.lock_state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // parked; re-queued by done()
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.wake.notify_one();
    }

    /// Re-enqueues `item` after its computed exponential backoff delay.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.backoff.next_delay(&item);
        tracing::debug!(
            queue = %self.name,
            item = ?item,
            delay = ?delay,
            "Scheduling redelivery"
        );
        // the receiver only goes away together with the queue itself
        let _ = self.delayed.send((item, Instant::now() + delay));
    }

    /// Clears the backoff history of `item` after a successful cycle.
    pub fn forget(&self, item: &T) {
        self.backoff.forget(item);
    }

    /// Frees the processing slot of `item`, re-queueing it if it was added
    /// again while being processed.
    pub fn done(&self, item: &T) {
        let mut state = self.lock_state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.wake.notify_one();
        }
    }

    /// Waits for the next item. Returns [`None`] once the queue was shut down
    /// and fully drained.
    ///
    /// The returned item occupies its processing slot until it is released
    /// with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // register as a waiter before checking the state, so a wakeup
            // sent between the check and the await is not lost
            notified.as_mut().enable();
            {
                let mut state = self.lock_state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting new work. Items already queued are still delivered.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shutting_down = true;
        drop(state);
        self.wake.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().queue.is_empty()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the processing slot of an item on every exit path.
pub(crate) struct DoneGuard<'a, T: QueueItem> {
    pub queue: &'a WorkQueue<T>,
    pub item: T,
}

impl<T: QueueItem> Drop for DoneGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}

struct Waiting<T> {
    at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Holds rate-limited items until their deadline, then feeds them back into
/// the queue. Exits once the queue itself is gone.
async fn redeliver_loop<T: QueueItem>(
    queue: Weak<WorkQueue<T>>,
    mut delayed: mpsc::UnboundedReceiver<(T, Instant)>,
) {
    let mut waiting: BinaryHeap<Reverse<Waiting<T>>> = BinaryHeap::new();
    let mut seq = 0_u64;

    loop {
        let next_deadline = waiting.peek().map(|Reverse(w)| w.at);

        tokio::select! {
            received = delayed.recv() => match received {
                Some((item, at)) => {
                    waiting.push(Reverse(Waiting { at, seq, item }));
                    seq += 1;
                }
                None => return,
            },
            () = sleep_until_or_forever(next_deadline) => {
                let now = Instant::now();
                while waiting.peek().is_some_and(|Reverse(w)| w.at <= now) {
                    let Some(Reverse(due)) = waiting.pop() else {
                        break;
                    };
                    match queue.upgrade() {
                        Some(queue) => queue.add(due.item),
                        None => return,
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
