//! Cooperative timers for a single-threaded host loop.
//!
//! Nothing here sleeps. The owner asks which task kinds are due at `now`,
//! runs them, and goes back to its loop. Periodic tasks are rescheduled one
//! interval after the tick that ran them, so a stalled loop never triggers a
//! burst of catch-up runs.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
struct ScheduledTask<K> {
    kind: K,
    next_due: DateTime<Utc>,
    interval: Option<Duration>,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct TaskScheduler<K> {
    tasks: Vec<ScheduledTask<K>>,
    next_seq: u64,
}

impl<K> Default for TaskScheduler<K> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            next_seq: 0,
        }
    }
}

impl<K: Copy + Eq> TaskScheduler<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `kind` once at `at`. Replaces any pending task of the same kind.
    pub fn schedule_once(&mut self, kind: K, at: DateTime<Utc>) {
        self.insert(kind, at, None);
    }

    /// Runs `kind` at `first_due` and then every `interval`. Replaces any
    /// pending task of the same kind.
    pub fn schedule_every(&mut self, kind: K, first_due: DateTime<Utc>, interval: Duration) {
        self.insert(kind, first_due, Some(interval.max(Duration::milliseconds(1))));
    }

    pub fn cancel(&mut self, kind: K) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.kind != kind);
        self.tasks.len() != before
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.tasks.len();
        self.tasks.clear();
        cancelled
    }

    pub fn is_scheduled(&self, kind: K) -> bool {
        self.tasks.iter().any(|task| task.kind == kind)
    }

    pub fn next_due(&self, kind: K) -> Option<DateTime<Utc>> {
        self.tasks
            .iter()
            .find(|task| task.kind == kind)
            .map(|task| task.next_due)
    }

    /// When the next task of any kind is due.
    pub fn earliest_due(&self) -> Option<DateTime<Utc>> {
        self.tasks.iter().map(|task| task.next_due).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Kinds due at `now`, earliest first. One-shot tasks are removed;
    /// periodic ones move to `now + interval`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<K> {
        let mut due: Vec<(DateTime<Utc>, u64, K)> = self
            .tasks
            .iter()
            .filter(|task| task.next_due <= now)
            .map(|task| (task.next_due, task.seq, task.kind))
            .collect();
        due.sort_by(|left, right| left.0.cmp(&right.0).then(left.1.cmp(&right.1)));

        self.tasks.retain(|task| task.next_due > now || task.interval.is_some());
        for task in &mut self.tasks {
            if task.next_due <= now {
                if let Some(interval) = task.interval {
                    task.next_due = now + interval;
                }
            }
        }

        due.into_iter().map(|(_, _, kind)| kind).collect()
    }

    fn insert(&mut self, kind: K, next_due: DateTime<Utc>, interval: Option<Duration>) {
        self.tasks.retain(|task| task.kind != kind);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(ScheduledTask {
            kind,
            next_due,
            interval,
            seq,
        });
    }
}
