//! Timeout scheduler.
//!
//! One timer thread per group holds a deadline-ordered heap. Due jobs are
//! handed back to the group's worker pool (the job itself is just an
//! enqueue), so user callbacks never run on the timer thread. Cancellation
//! is a flag check at fire time: a cancelled entry is skipped when it
//! surfaces at the top of the heap.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type TimerJob = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: TimerJob,
}

// BinaryHeap is a max-heap; order entries so the nearest deadline surfaces
// first, with the sequence number as a stable tiebreak.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Handle to a scheduled job. Dropping the key does not cancel the job.
pub struct TimerKey {
    cancelled: Arc<AtomicBool>,
}

impl TimerKey {
    /// Cancel the job if it has not fired yet. Returns true if the job was
    /// still pending.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<Entry>>,
    available: Condvar,
    stopped: AtomicBool,
}

/// A deadline scheduler backed by a single thread.
pub struct Timer {
    shared: Arc<TimerShared>,
    seq: std::sync::atomic::AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Spawn the timer thread. `name` labels it for diagnostics.
    pub fn new(name: &str) -> Timer {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_timer(thread_shared))
            .expect("failed to spawn timer thread");
        Timer {
            shared,
            seq: std::sync::atomic::AtomicU64::new(0),
            thread: Mutex::new(Some(handle)),
        }
    }

    /// Schedule `job` to run after `delay`.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerKey {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            job: Box::new(job),
        };
        self.shared.queue.lock().push(entry);
        self.shared.available.notify_one();
        TimerKey { cancelled }
    }

    /// Stop the timer thread. Pending jobs are discarded.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.available.notify_one();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(shared: Arc<TimerShared>) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            return;
        }
        match queue.peek() {
            None => {
                shared.available.wait(&mut queue);
            }
            Some(entry) => {
                let deadline = entry.deadline;
                let now = Instant::now();
                if now < deadline {
                    let _ = shared.available.wait_until(&mut queue, deadline);
                    continue;
                }
                let entry = queue.pop().unwrap();
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                // Fire outside the lock; the job is a cheap enqueue but must
                // not hold up schedule/cancel.
                drop(queue);
                (entry.job)();
                queue = shared.queue.lock();
            }
        }
    }
}
