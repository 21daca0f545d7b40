//! The job queue: ordered pending jobs plus the scheduler state enum.
//!
//! # Job ids (for beginners)
//!
//! Every job gets an id when it is enqueued.  Ids are assigned from a
//! counter that only ever grows, so an id is never reused even after the job
//! it named has been removed.  On the wire an id is a 16-digit upper-case hex
//! string (`"000000000000002A"`), which keeps ids opaque to clients and sorts
//! the same way as the underlying number.
//!
//! When the queue is restored from storage the counter resumes above the
//! largest stored id (see [`JobQueue::restore`]).

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ── QueueState ────────────────────────────────────────────────────────────────

/// Scheduler state.
///
/// ```text
///            start / job done            transition ok
///   ready ───────────────────► loading ─────────────────► starting
///     ▲                           │                           │
///     │        job complete       │ error / pause             │ error / cancel
///     └───────────────────────────┼───────────────────────────┤
///                                 ▼                           ▼
///                               paused ◄──────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Ready,
    Loading,
    Starting,
    Paused,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Ready => "ready",
            QueueState::Loading => "loading",
            QueueState::Starting => "starting",
            QueueState::Paused => "paused",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── JobId ─────────────────────────────────────────────────────────────────────

/// Stable identifier of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

/// Error returned when a string is not a valid hex job id.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid job id '{0}'")]
pub struct ParseJobIdError(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ParseJobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16)
            .map(JobId)
            .map_err(|_| ParseJobIdError(s.to_string()))
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── QueuedJob ─────────────────────────────────────────────────────────────────

/// One pending job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    /// Reference name of the job, e.g. a file path relative to the job root.
    pub filename: String,
    /// Unix time (seconds) at which the job was enqueued.
    pub time_added: f64,
}

// ── JobQueue ──────────────────────────────────────────────────────────────────

/// Errors from queue operations that must name an existing job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job {0} is not in the queue")]
    JobNotFound(JobId),
}

/// FIFO of pending jobs with stable, never-reused ids.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    jobs: VecDeque<QueuedJob>,
    next_id: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue from persisted jobs.
    ///
    /// The id counter resumes at `max(next_id, largest stored id + 1)`, so a
    /// stale or missing counter can never cause an id to be handed out twice.
    pub fn restore(jobs: Vec<QueuedJob>, next_id: u64) -> Self {
        let floor = jobs
            .iter()
            .map(|j| j.job_id.0.saturating_add(1))
            .max()
            .unwrap_or(0);
        Self {
            jobs: jobs.into(),
            next_id: next_id.max(floor),
        }
    }

    /// Appends `filenames` to the tail, in order.
    ///
    /// With `reset` the queue is emptied first; both happen in one step.
    /// Returns the newly created entries.
    pub fn enqueue<I, S>(&mut self, filenames: I, reset: bool, now: f64) -> Vec<QueuedJob>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if reset {
            self.jobs.clear();
        }
        let mut added = Vec::new();
        for name in filenames {
            let job = QueuedJob {
                job_id: JobId(self.next_id),
                filename: name.into(),
                time_added: now,
            };
            self.next_id = self.next_id.wrapping_add(1);
            self.jobs.push_back(job.clone());
            added.push(job);
        }
        added
    }

    /// Deletes every job whose id is in `ids`.  Unknown ids are ignored.
    /// Returns the number of jobs removed.
    pub fn remove(&mut self, ids: &[JobId]) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| !ids.contains(&j.job_id));
        before - self.jobs.len()
    }

    /// Removes every job.  Returns how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.jobs.len();
        self.jobs.clear();
        n
    }

    /// Moves `id` to the head, keeping every other job's relative order.
    ///
    /// # Errors
    ///
    /// [`QueueError::JobNotFound`] if `id` is not queued.
    pub fn jump(&mut self, id: JobId) -> Result<(), QueueError> {
        let pos = self
            .jobs
            .iter()
            .position(|j| j.job_id == id)
            .ok_or(QueueError::JobNotFound(id))?;
        if let Some(job) = self.jobs.remove(pos) {
            self.jobs.push_front(job);
        }
        Ok(())
    }

    pub fn front(&self) -> Option<&QueuedJob> {
        self.jobs.front()
    }

    pub fn pop_front(&mut self) -> Option<QueuedJob> {
        self.jobs.pop_front()
    }

    /// Puts a previously popped job back at the head, keeping its id.
    pub fn push_front(&mut self, job: QueuedJob) {
        self.jobs.push_front(job);
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.iter().any(|j| j.job_id == id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Id the next enqueued job will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Ordered copy of the queue contents.
    pub fn snapshot(&self) -> Vec<QueuedJob> {
        self.jobs.iter().cloned().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
