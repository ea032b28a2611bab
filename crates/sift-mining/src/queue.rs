//! Priority task queue shared by all workers.
//!
//! Entries are ordered by priority (highest first) and then by insertion
//! order. All state lives behind one mutex so that every operation is
//! linearizable; the lock is never held across an `.await`.

use crate::types::TaskEntry;
use parking_lot::Mutex;
use sift_core::JobId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Queued {
    seq: u64,
    entry: TaskEntry,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .priority
            .cmp(&other.entry.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Delayed {
    ready_at: Instant,
    entry: TaskEntry,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Queued>,
    delayed: Vec<Delayed>,
    parked: HashMap<JobId, Vec<Queued>>,
    paused: HashSet<JobId>,
    closed: HashSet<JobId>,
    next_seq: u64,
}

impl QueueState {
    fn push(&mut self, entry: TaskEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let queued = Queued { seq, entry };
        if self.paused.contains(&queued.entry.job_id) {
            self.parked.entry(queued.entry.job_id).or_default().push(queued);
        } else {
            self.ready.push(queued);
        }
    }

    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| d.ready_at <= now);
        self.delayed = waiting;
        let mut due = due;
        due.sort_by_key(|d| d.ready_at);
        for d in due {
            self.push(d.entry);
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed.iter().map(|d| d.ready_at).min()
    }
}

/// Thread-safe priority queue of [`TaskEntry`] values.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add entries. Entries of stopped jobs are dropped; returns how many were accepted.
    pub fn enqueue(&self, entries: impl IntoIterator<Item = TaskEntry>) -> usize {
        let accepted = {
            let mut state = self.state.lock();
            let mut accepted = 0;
            for entry in entries {
                if state.closed.contains(&entry.job_id) {
                    continue;
                }
                state.push(entry);
                accepted += 1;
            }
            accepted
        };
        if accepted > 0 {
            self.notify.notify_waiters();
        }
        accepted
    }

    /// Pop the highest-priority runnable entry, if any.
    pub fn try_dequeue(&self) -> Option<TaskEntry> {
        let mut state = self.state.lock();
        state.promote_due(Instant::now());
        state.ready.pop().map(|q| q.entry)
    }

    /// Wait for a runnable entry. Returns `None` once `cancel` fires.
    ///
    /// An empty queue is not an error: the caller simply waits, waking on
    /// new work, on the next delayed retry, or after `idle` at the latest.
    pub async fn dequeue(&self, cancel: &CancellationToken, idle: Duration) -> Option<TaskEntry> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return None;
            }

            let wake_at = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.promote_due(now);
                if let Some(q) = state.ready.pop() {
                    return Some(q.entry);
                }
                let idle_at = now + idle;
                state.next_wakeup().map_or(idle_at, |at| at.min(idle_at))
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Put an entry back after `backoff`. Returns `false` if its job was stopped.
    pub fn requeue(&self, entry: TaskEntry, backoff: Duration) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed.contains(&entry.job_id) {
                return false;
            }
            if backoff.is_zero() {
                state.push(entry);
            } else {
                state.delayed.push(Delayed {
                    ready_at: Instant::now() + backoff,
                    entry,
                });
            }
        }
        self.notify.notify_waiters();
        true
    }

    /// Hold back a job's entries without dropping them.
    pub fn pause_job(&self, job_id: JobId) {
        let mut state = self.state.lock();
        if !state.paused.insert(job_id) {
            return;
        }
        let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut state.ready)
            .into_vec()
            .into_iter()
            .partition(|q| q.entry.job_id == job_id);
        state.ready = others.into();
        let parked = mine.len();
        state.parked.entry(job_id).or_default().extend(mine);
        debug!(%job_id, parked, "Job entries parked");
    }

    /// Make a paused job's entries dequeueable again, in their original order.
    pub fn resume_job(&self, job_id: JobId) {
        {
            let mut state = self.state.lock();
            if !state.paused.remove(&job_id) {
                return;
            }
            if let Some(parked) = state.parked.remove(&job_id) {
                debug!(%job_id, restored = parked.len(), "Job entries restored");
                state.ready.extend(parked);
            }
        }
        self.notify.notify_waiters();
    }

    /// Purge every pending entry of a job and refuse new ones. Returns the number purged.
    pub fn stop_job(&self, job_id: JobId) -> usize {
        let mut state = self.state.lock();
        state.closed.insert(job_id);
        state.paused.remove(&job_id);

        let before = state.ready.len() + state.delayed.len();
        state.ready.retain(|q| q.entry.job_id != job_id);
        state.delayed.retain(|d| d.entry.job_id != job_id);
        let parked = state.parked.remove(&job_id).map_or(0, |p| p.len());
        before - (state.ready.len() + state.delayed.len()) + parked
    }

    /// Drop all bookkeeping for a job that no longer exists.
    pub fn forget_job(&self, job_id: JobId) {
        let mut state = self.state.lock();
        state.closed.remove(&job_id);
        state.paused.remove(&job_id);
        state.parked.remove(&job_id);
        state.ready.retain(|q| q.entry.job_id != job_id);
        state.delayed.retain(|d| d.entry.job_id != job_id);
    }

    pub fn is_paused(&self, job_id: JobId) -> bool {
        self.state.lock().paused.contains(&job_id)
    }

    /// Entries of `job_id` still waiting in the queue (ready, delayed or parked).
    pub fn pending_for(&self, job_id: JobId) -> usize {
        let state = self.state.lock();
        state.ready.iter().filter(|q| q.entry.job_id == job_id).count()
            + state.delayed.iter().filter(|d| d.entry.job_id == job_id).count()
            + state.parked.get(&job_id).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.delayed.len() + state.parked.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
