//! JobScheduler: the FIFO job queue and its automatic loading chain.
//!
//! # State machine
//!
//! ```text
//!            start (queue empty)            enqueue / complete
//!  paused ───────────────────────► ready ────────────────────► loading
//!    ▲  ▲                            ▲                            │
//!    │  └──── pause / any failure ───┼────────────────────────────┤
//!    │                               │ complete                   │ transition done
//!    └──── cancelled / error ─────── starting ◄───────────────────┘
//! ```
//!
//! The loading chain (readiness check, optional delay, transition script,
//! start call) runs in a spawned task so the queue stays responsive.  Each
//! chain carries the `load_epoch` it was started under; `pause` bumps the
//! epoch, and a chain that finds a newer epoch after any suspension point
//! stops without touching the queue.
//!
//! Job completion is observed through `print_stats.state` pushes, delivered
//! by the broker from the scheduler's own internal subscription.  Once the
//! start call is acknowledged, an idle state finishes the job if `printing`
//! was seen or the state differs from the one recorded at acknowledgement.
//! A job whose end produced no observable change can be cleared with
//! `pause` followed by `start`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::{BoxFuture, FutureExt};
use relay_core::protocol::messages::{METHOD_GCODE_SCRIPT, METHOD_OBJECTS_QUERY};
use relay_core::{ControlStatus, JobId, JobQueue, QueueState, QueuedJob};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::channel::ControlChannel;
use crate::application::error::RelayError;
use crate::application::hub::{Target, TransportHub};
use crate::application::store::{QueueStore, StoredQueue};
use crate::domain::config::JobQueueConfig;
use crate::domain::messages::{Notification, NOTIFY_JOB_QUEUE_CHANGED};

/// `print_stats.state` values that allow a new job to start.
const IDLE_PRINT_STATES: &[&str] = &["standby", "complete", "cancelled", "error"];

/// Interest the scheduler registers for itself.
pub fn scheduler_interest() -> Value {
    json!({"print_stats": ["state"]})
}

/// A queued job as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub filename: String,
    pub time_added: f64,
    pub time_in_queue: f64,
}

/// Result of every `job_queue.*` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queued_jobs: Vec<JobView>,
    pub queue_state: QueueState,
}

/// Which jobs `remove` deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveSelection {
    Ids(Vec<JobId>),
    All,
}

struct SchedulerState {
    queue: JobQueue,
    state: QueueState,
    load_epoch: u64,
    /// Job handed to the control process and not yet finished.
    active_job: Option<QueuedJob>,
    /// `print_stats.state` at the moment the start call was acknowledged.
    acknowledged_in: Option<Option<String>>,
    /// Whether `printing` was observed for `active_job`.
    seen_printing: bool,
    /// Last observed `print_stats.state`.
    print_state: Option<String>,
    control_ready: bool,
}

pub struct JobScheduler {
    channel: Arc<dyn ControlChannel>,
    hub: Arc<TransportHub>,
    store: Arc<dyn QueueStore>,
    config: JobQueueConfig,
    state: Mutex<SchedulerState>,
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl JobScheduler {
    /// Restores the persisted queue and picks the initial state from
    /// `load_on_startup`.
    pub fn new(
        channel: Arc<dyn ControlChannel>,
        hub: Arc<TransportHub>,
        store: Arc<dyn QueueStore>,
        config: JobQueueConfig,
    ) -> Self {
        let queue = match store.load() {
            Ok(Some(stored)) => {
                info!(jobs = stored.jobs.len(), "restored job queue");
                JobQueue::restore(stored.jobs, stored.next_id)
            }
            Ok(None) => JobQueue::new(),
            Err(e) => {
                warn!(error = %e, "could not load job queue; starting empty");
                JobQueue::new()
            }
        };
        let state = if config.load_on_startup {
            QueueState::Ready
        } else {
            QueueState::Paused
        };
        Self {
            channel,
            hub,
            store,
            config,
            state: Mutex::new(SchedulerState {
                queue,
                state,
                load_epoch: 0,
                active_job: None,
                acknowledged_in: None,
                seen_printing: false,
                print_state: None,
                control_ready: false,
            }),
        }
    }

    pub async fn status(&self) -> QueueStatus {
        let st = self.state.lock().await;
        status_of(&st)
    }

    pub async fn queue_state(&self) -> QueueState {
        self.state.lock().await.state
    }

    // ── Client operations ────────────────────────────────────────────────────

    /// Appends `filenames` (after clearing the queue when `reset`).
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidParams`] if no non-empty filename was given.
    pub async fn enqueue(
        self: &Arc<Self>,
        filenames: Vec<String>,
        reset: bool,
    ) -> Result<QueueStatus, RelayError> {
        let filenames: Vec<String> = filenames
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if filenames.is_empty() {
            return Err(RelayError::InvalidParams("no filenames given".into()));
        }

        let mut st = self.state.lock().await;
        let added = st.queue.enqueue(filenames, reset, now());
        info!(added = added.len(), reset, "jobs queued");
        self.persist(&st);
        self.emit(&st, "jobs_added", true, None).await;
        self.try_load(&mut st).await;
        Ok(status_of(&st))
    }

    /// Deletes jobs; ids not in the queue are ignored.
    pub async fn remove(&self, selection: RemoveSelection) -> QueueStatus {
        let mut st = self.state.lock().await;
        let removed = match &selection {
            RemoveSelection::All => st.queue.clear(),
            RemoveSelection::Ids(ids) => st.queue.remove(ids),
        };
        debug!(removed, "jobs removed");
        self.persist(&st);
        self.emit(&st, "jobs_removed", true, None).await;
        status_of(&st)
    }

    /// Moves `id` to the head of the queue.
    ///
    /// # Errors
    ///
    /// [`RelayError::JobNotFound`] if `id` is not queued.
    pub async fn jump(&self, id: JobId) -> Result<QueueStatus, RelayError> {
        let mut st = self.state.lock().await;
        st.queue.jump(id)?;
        self.persist(&st);
        self.emit(&st, "job_jumped", true, None).await;
        Ok(status_of(&st))
    }

    /// Stops automatic loading.  An in-flight load is abandoned; a job that
    /// is already running keeps running.
    pub async fn pause(&self) -> QueueStatus {
        let mut st = self.state.lock().await;
        if st.state == QueueState::Loading {
            st.load_epoch += 1;
            info!("pause requested while loading; aborting load");
        }
        st.state = QueueState::Paused;
        self.emit(&st, "state_changed", false, None).await;
        status_of(&st)
    }

    /// Re-arms automatic loading and loads the next job if possible.
    ///
    /// A job still recorded as running is forgotten; the readiness check
    /// of the next load defers it while the control process is busy.
    ///
    /// # Errors
    ///
    /// [`RelayError::QueueStateConflict`] while a job is loading or starting.
    pub async fn start(self: &Arc<Self>) -> Result<QueueStatus, RelayError> {
        let mut st = self.state.lock().await;
        if matches!(st.state, QueueState::Loading | QueueState::Starting) {
            return Err(RelayError::QueueStateConflict {
                state: st.state,
                operation: "start",
            });
        }
        if let Some(job) = st.active_job.take() {
            info!(job_id = %job.job_id, "start requested; no longer tracking job");
            clear_tracking(&mut st);
        }
        if st.state == QueueState::Paused {
            st.state = QueueState::Ready;
            self.emit(&st, "state_changed", false, None).await;
        }
        self.try_load(&mut st).await;
        Ok(status_of(&st))
    }

    // ── Control-process events ───────────────────────────────────────────────

    pub async fn on_control_state(self: &Arc<Self>, status: &ControlStatus) {
        let mut st = self.state.lock().await;
        let ready = status.is_ready();
        if ready == st.control_ready {
            return;
        }
        st.control_ready = ready;
        if ready {
            self.try_load(&mut st).await;
            return;
        }
        if let Some(job) = st.active_job.take() {
            clear_tracking(&mut st);
            warn!(job_id = %job.job_id, state = %status.state, "control process lost during job");
            if st.state != QueueState::Paused {
                st.state = QueueState::Paused;
                let reason = format!("control process {} during job {}", status.state, job.job_id);
                self.emit(&st, "state_changed", false, Some(reason)).await;
            }
        }
    }

    /// Handles the scheduler's slice of a status push or snapshot.
    pub async fn on_status(self: &Arc<Self>, status: &Map<String, Value>) {
        let print_state = status
            .get("print_stats")
            .and_then(|p| p.get("state"))
            .and_then(Value::as_str);
        if let Some(print_state) = print_state {
            self.on_print_state(print_state).await;
        }
    }

    pub async fn on_print_state(self: &Arc<Self>, print_state: &str) {
        let mut st = self.state.lock().await;
        st.print_state = Some(print_state.to_string());
        if print_state == "printing" {
            if st.active_job.is_some() {
                st.seen_printing = true;
            }
            return;
        }
        if !IDLE_PRINT_STATES.contains(&print_state) {
            return;
        }
        if job_finished(&st) {
            self.finish_job(&mut st, print_state).await;
        } else if st.active_job.is_none() {
            self.try_load(&mut st).await;
        }
    }

    /// Ends `active_job` after the control process went idle in
    /// `print_state`, then decides whether the chain continues.
    async fn finish_job(self: &Arc<Self>, st: &mut SchedulerState, print_state: &str) {
        let Some(job) = st.active_job.take() else {
            return;
        };
        clear_tracking(st);
        info!(job_id = %job.job_id, print_state, "job finished");
        if st.state == QueueState::Paused {
            return;
        }

        if print_state != "complete" {
            st.state = QueueState::Paused;
            let reason = format!("job {} ended with state '{print_state}'", job.job_id);
            self.emit(st, "state_changed", false, Some(reason)).await;
            return;
        }

        if st.queue.is_empty() {
            st.state = QueueState::Ready;
            self.emit(st, "state_changed", false, None).await;
        } else if self.config.automatic_transition {
            st.state = QueueState::Ready;
            self.try_load(st).await;
        } else {
            st.state = QueueState::Paused;
            self.emit(st, "state_changed", false, None).await;
        }
    }

    // ── Loading chain ────────────────────────────────────────────────────────

    /// Enters `loading` and spawns the chain if everything permits it.
    async fn try_load(self: &Arc<Self>, st: &mut SchedulerState) {
        if st.state != QueueState::Ready
            || !st.control_ready
            || st.active_job.is_some()
            || st.queue.is_empty()
        {
            return;
        }
        st.state = QueueState::Loading;
        st.load_epoch += 1;
        let epoch = st.load_epoch;
        self.emit(st, "state_changed", false, None).await;
        debug!(epoch, "load chain started");
        tokio::spawn(Arc::clone(self).run_load(epoch));
    }

    /// Boxed so a finished job can start the next chain from within one.
    fn run_load(self: Arc<Self>, epoch: u64) -> BoxFuture<'static, ()> {
        self.load_chain(epoch).boxed()
    }

    async fn load_chain(self: Arc<Self>, epoch: u64) {
        match self.prepare_load(epoch).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.fail_load(epoch, None, &e).await;
                return;
            }
        }

        let job = {
            let mut st = self.state.lock().await;
            if !is_current(&st, epoch) {
                return;
            }
            let Some(job) = st.queue.pop_front() else {
                st.state = QueueState::Ready;
                self.emit(&st, "state_changed", false, None).await;
                return;
            };
            st.state = QueueState::Starting;
            st.active_job = Some(job.clone());
            clear_tracking(&mut st);
            self.persist(&st);
            self.emit(&st, "job_loaded", true, None).await;
            job
        };

        let script = format!("SDCARD_PRINT_FILE FILENAME=\"{}\"", job.filename);
        match self
            .channel
            .call(METHOD_GCODE_SCRIPT, json!({"script": script}))
            .await
        {
            Ok(_) => self.acknowledge_start(&job).await,
            Err(e) => self.fail_load(epoch, Some(job), &e).await,
        }
    }

    /// Records the print state the job started from; a job that already
    /// ran to an idle state before the acknowledgement finishes here.
    async fn acknowledge_start(self: &Arc<Self>, job: &QueuedJob) {
        let mut st = self.state.lock().await;
        if st.active_job.as_ref().map(|j| j.job_id) != Some(job.job_id) {
            return;
        }
        info!(job_id = %job.job_id, filename = %job.filename, "job started");
        st.acknowledged_in = Some(st.print_state.clone());
        if job_finished(&st) {
            let print_state = st.print_state.clone().unwrap_or_default();
            self.finish_job(&mut st, &print_state).await;
        }
    }

    /// Readiness check, delay and transition script.  `Ok(false)` means the
    /// chain was superseded or the control process is busy.
    async fn prepare_load(&self, epoch: u64) -> Result<bool, RelayError> {
        let result = self
            .channel
            .call(METHOD_OBJECTS_QUERY, json!({"objects": scheduler_interest()}))
            .await?;
        let print_state = result
            .pointer("/status/print_stats/state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        {
            let mut st = self.state.lock().await;
            if !is_current(&st, epoch) {
                return Ok(false);
            }
            if !print_state.is_empty() {
                st.print_state = Some(print_state.clone());
            }
            if !IDLE_PRINT_STATES.contains(&print_state.as_str()) {
                debug!(print_state = %print_state, "control process busy; load deferred");
                st.state = QueueState::Ready;
                self.emit(&st, "state_changed", false, None).await;
                return Ok(false);
            }
        }

        let delay = self.config.transition_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            if !is_current(&*self.state.lock().await, epoch) {
                return Ok(false);
            }
        }

        let gcode = self.config.job_transition_gcode.trim();
        if !gcode.is_empty() {
            self.channel
                .call(METHOD_GCODE_SCRIPT, json!({"script": gcode}))
                .await?;
        }
        Ok(is_current(&*self.state.lock().await, epoch))
    }

    /// Ends an automatic cycle: requeues `job` at the head and pauses.
    async fn fail_load(&self, epoch: u64, job: Option<QueuedJob>, error: &RelayError) {
        let mut st = self.state.lock().await;
        match job {
            Some(job) => {
                if st.active_job.as_ref().map(|j| j.job_id) != Some(job.job_id) {
                    return;
                }
                st.active_job = None;
                clear_tracking(&mut st);
                st.queue.push_front(job);
                self.persist(&st);
            }
            None => {
                if !is_current(&st, epoch) {
                    return;
                }
            }
        }
        warn!(error = %error, "job load failed; pausing queue");
        st.state = QueueState::Paused;
        let reason = error.to_string();
        self.emit(&st, "state_changed", true, Some(reason)).await;
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn persist(&self, st: &SchedulerState) {
        let stored = StoredQueue {
            next_id: st.queue.next_id(),
            jobs: st.queue.snapshot(),
        };
        if let Err(e) = self.store.save(&stored) {
            warn!(error = %e, "failed to persist job queue");
        }
    }

    async fn emit(
        &self,
        st: &SchedulerState,
        action: &str,
        include_queue: bool,
        reason: Option<String>,
    ) {
        let updated_queue = if include_queue {
            serde_json::to_value(job_views(&st.queue)).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        let mut event = json!({
            "action": action,
            "updated_queue": updated_queue,
            "queue_state": st.state,
        });
        if let (Some(reason), Some(obj)) = (reason, event.as_object_mut()) {
            obj.insert("reason".into(), Value::String(reason));
        }
        self.hub
            .deliver(Target::All, &Notification::new(NOTIFY_JOB_QUEUE_CHANGED, vec![event]))
            .await;
    }
}

/// Whether the acknowledged `active_job` has reached an idle state.
fn job_finished(st: &SchedulerState) -> bool {
    let Some(started_in) = &st.acknowledged_in else {
        return false;
    };
    let Some(current) = st.print_state.as_deref() else {
        return false;
    };
    st.active_job.is_some()
        && IDLE_PRINT_STATES.contains(&current)
        && (st.seen_printing || started_in.as_deref() != Some(current))
}

fn clear_tracking(st: &mut SchedulerState) {
    st.acknowledged_in = None;
    st.seen_printing = false;
}

fn is_current(st: &SchedulerState, epoch: u64) -> bool {
    st.load_epoch == epoch && st.state == QueueState::Loading
}

fn job_views(queue: &JobQueue) -> Vec<JobView> {
    let now = now();
    queue
        .snapshot()
        .into_iter()
        .map(|j| JobView {
            time_in_queue: (now - j.time_added).max(0.0),
            job_id: j.job_id,
            filename: j.filename,
            time_added: j.time_added,
        })
        .collect()
}

fn status_of(st: &SchedulerState) -> QueueStatus {
    QueueStatus {
        queued_jobs: job_views(&st.queue),
        queue_state: st.state,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::auth::ConfigAuthorizer;
    use crate::application::channel::fake::FakeControl;
    use crate::application::hub::{ClientSink, TransportKind};
    use crate::application::store::MemoryQueueStore;
    use crate::domain::config::AuthorizationConfig;
    use relay_core::ControlState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        fake: Arc<FakeControl>,
        scheduler: Arc<JobScheduler>,
        events: mpsc::Receiver<Arc<String>>,
        store: Arc<MemoryQueueStore>,
    }

    fn config(load_on_startup: bool, automatic: bool) -> JobQueueConfig {
        JobQueueConfig {
            load_on_startup,
            automatic_transition: automatic,
            job_transition_delay: 0.0,
            job_transition_gcode: String::new(),
            queue_file: None,
        }
    }

    async fn fixture(config: JobQueueConfig) -> Fixture {
        let fake = FakeControl::new();
        fake.on(METHOD_OBJECTS_QUERY, |_| {
            Ok(json!({"eventtime": 1.0, "status": {"print_stats": {"state": "standby"}}}))
        });
        let hub = Arc::new(TransportHub::new(Arc::new(ConfigAuthorizer::new(
            &AuthorizationConfig::default(),
        ))));
        let (tx, events) = mpsc::channel(64);
        hub.register(TransportKind::Duplex, ClientSink::Queue(tx)).await;
        let store = Arc::new(MemoryQueueStore::new());
        let scheduler = Arc::new(JobScheduler::new(
            fake.clone(),
            hub,
            store.clone(),
            config,
        ));
        Fixture {
            fake,
            scheduler,
            events,
            store,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let v: Value = serde_json::from_str(&text).unwrap();
            out.push(v["params"][0].clone());
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn filenames(status: &QueueStatus) -> Vec<&str> {
        status.queued_jobs.iter().map(|j| j.filename.as_str()).collect()
    }

    fn start_calls(fake: &FakeControl) -> Vec<Value> {
        fake.calls_to(METHOD_GCODE_SCRIPT)
            .into_iter()
            .filter(|p| p["script"].as_str().unwrap_or("").starts_with("SDCARD_PRINT_FILE"))
            .collect()
    }

    #[tokio::test]
    async fn test_queue_fifo_with_jump_and_remove() {
        // Arrange
        let f = fixture(config(false, false)).await;
        let status = f
            .scheduler
            .enqueue(vec!["a".into(), "b".into(), "c".into()], false)
            .await
            .unwrap();
        assert_eq!(filenames(&status), ["a", "b", "c"]);
        let id = |name: &str| {
            status
                .queued_jobs
                .iter()
                .find(|j| j.filename == name)
                .map(|j| j.job_id)
                .unwrap()
        };

        // Act / Assert
        let status = f.scheduler.jump(id("c")).await.unwrap();
        assert_eq!(filenames(&status), ["c", "a", "b"]);
        let status = f.scheduler.remove(RemoveSelection::Ids(vec![id("a")])).await;
        assert_eq!(filenames(&status), ["c", "b"]);
    }

    #[tokio::test]
    async fn test_enqueue_does_not_change_paused_state() {
        let f = fixture(config(false, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;

        let status = f.scheduler.enqueue(vec!["a".into()], false).await.unwrap();

        assert_eq!(status.queue_state, QueueState::Paused);
        assert!(f.fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_enqueue_replaces_queue() {
        let f = fixture(config(false, false)).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();

        let status = f.scheduler.enqueue(vec!["z".into()], true).await.unwrap();

        assert_eq!(filenames(&status), ["z"]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_filenames() {
        let f = fixture(config(false, false)).await;
        let result = f.scheduler.enqueue(vec!["  ".into()], false).await;
        assert!(matches!(result, Err(RelayError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_noop_and_jump_unknown_errors() {
        let f = fixture(config(false, false)).await;
        f.scheduler.enqueue(vec!["a".into()], false).await.unwrap();

        let status = f.scheduler.remove(RemoveSelection::Ids(vec![JobId(999)])).await;
        assert_eq!(filenames(&status), ["a"]);
        assert_eq!(
            f.scheduler.jump(JobId(999)).await,
            Err(RelayError::JobNotFound(JobId(999)))
        );
    }

    #[tokio::test]
    async fn test_ready_queue_loads_and_starts_job() {
        // Arrange
        let mut f = fixture(config(true, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;

        // Act
        f.scheduler.enqueue(vec!["a.gcode".into()], false).await.unwrap();
        settle().await;

        // Assert
        let starts = start_calls(&f.fake);
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0]["script"], "SDCARD_PRINT_FILE FILENAME=\"a.gcode\"");
        assert_eq!(f.scheduler.queue_state().await, QueueState::Starting);
        let actions: Vec<String> = drain(&mut f.events)
            .iter()
            .map(|e| e["action"].as_str().unwrap().to_string())
            .collect();
        assert!(actions.contains(&"job_loaded".to_string()));
        assert!(f.store.load().unwrap().unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_pause_aborts_in_flight_load() {
        // Arrange: readiness check blocks until released
        let f = fixture(config(true, true)).await;
        let gate = f.fake.gate(METHOD_OBJECTS_QUERY);
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a.gcode".into()], false).await.unwrap();
        assert_eq!(f.scheduler.queue_state().await, QueueState::Loading);

        // Act
        let status = f.scheduler.pause().await;
        gate.notify_one();
        settle().await;

        // Assert
        assert_eq!(status.queue_state, QueueState::Paused);
        assert_eq!(f.scheduler.queue_state().await, QueueState::Paused);
        assert!(start_calls(&f.fake).is_empty());
        assert_eq!(filenames(&f.scheduler.status().await), ["a.gcode"]);
    }

    #[tokio::test]
    async fn test_start_while_loading_conflicts() {
        let f = fixture(config(true, true)).await;
        let _gate = f.fake.gate(METHOD_OBJECTS_QUERY);
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into()], false).await.unwrap();

        let result = f.scheduler.start().await;

        assert_eq!(
            result,
            Err(RelayError::QueueStateConflict {
                state: QueueState::Loading,
                operation: "start",
            })
        );
    }

    #[tokio::test]
    async fn test_failed_start_call_requeues_and_pauses() {
        // Arrange
        let mut f = fixture(config(true, true)).await;
        f.fake.on(METHOD_GCODE_SCRIPT, |_| {
            Err(RelayError::UpstreamError {
                kind: "command_error".into(),
                message: "file not found".into(),
            })
        });
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;

        // Act
        f.scheduler.enqueue(vec!["missing.gcode".into()], false).await.unwrap();
        settle().await;

        // Assert
        let status = f.scheduler.status().await;
        assert_eq!(status.queue_state, QueueState::Paused);
        assert_eq!(filenames(&status), ["missing.gcode"]);
        let last = drain(&mut f.events).pop().unwrap();
        assert_eq!(last["queue_state"], "paused");
        assert!(last["reason"].as_str().unwrap().contains("file not found"));
    }

    #[tokio::test]
    async fn test_completion_chains_to_next_job() {
        // Arrange
        let f = fixture(config(true, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();
        settle().await;
        assert_eq!(start_calls(&f.fake).len(), 1);

        // Act
        f.scheduler.on_print_state("printing").await;
        f.scheduler.on_print_state("complete").await;
        settle().await;

        // Assert
        let starts = start_calls(&f.fake);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1]["script"], "SDCARD_PRINT_FILE FILENAME=\"b\"");
    }

    #[tokio::test]
    async fn test_repeated_start_state_is_not_completion() {
        // Arrange: the readiness check reported "standby"
        let f = fixture(config(true, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();
        settle().await;

        // Act
        f.scheduler.on_print_state("standby").await;
        settle().await;

        // Assert
        assert_eq!(start_calls(&f.fake).len(), 1);
        assert_eq!(f.scheduler.queue_state().await, QueueState::Starting);
    }

    #[tokio::test]
    async fn test_job_failing_without_printing_push_pauses_then_resumes() {
        // Arrange
        let mut f = fixture(config(true, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();
        settle().await;

        // Act: the job fails before any "printing" push
        f.scheduler.on_print_state("error").await;
        f.scheduler.on_print_state("standby").await;

        // Assert
        assert_eq!(f.scheduler.queue_state().await, QueueState::Paused);
        let paused = drain(&mut f.events).pop().unwrap();
        assert!(paused["reason"].as_str().unwrap().contains("'error'"));

        // Act
        f.scheduler.pause().await;
        f.scheduler.start().await.unwrap();
        settle().await;

        // Assert
        let starts = start_calls(&f.fake);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1]["script"], "SDCARD_PRINT_FILE FILENAME=\"b\"");
    }

    #[tokio::test]
    async fn test_start_after_pause_forgets_job_with_no_visible_end() {
        // Arrange: job "a" ends without any print state change reaching us
        let f = fixture(config(true, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();
        settle().await;
        assert_eq!(f.scheduler.queue_state().await, QueueState::Starting);

        // Act
        f.scheduler.pause().await;
        let status = f.scheduler.start().await.unwrap();
        settle().await;

        // Assert
        assert_eq!(status.queue_state, QueueState::Loading);
        let starts = start_calls(&f.fake);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1]["script"], "SDCARD_PRINT_FILE FILENAME=\"b\"");
    }

    #[tokio::test]
    async fn test_job_ending_before_start_acknowledged_finishes_on_ack() {
        // Arrange: the start call is held until released
        let f = fixture(config(true, true)).await;
        let gate = f.fake.gate(METHOD_GCODE_SCRIPT);
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();
        settle().await;

        // Act
        f.scheduler.on_print_state("printing").await;
        f.scheduler.on_print_state("complete").await;
        assert_eq!(start_calls(&f.fake).len(), 1);
        gate.notify_one();
        settle().await;

        // Assert
        let starts = start_calls(&f.fake);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1]["script"], "SDCARD_PRINT_FILE FILENAME=\"b\"");
    }

    #[tokio::test]
    async fn test_cancelled_job_pauses_queue() {
        let f = fixture(config(true, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();
        settle().await;

        f.scheduler.on_print_state("printing").await;
        f.scheduler.on_print_state("cancelled").await;

        assert_eq!(f.scheduler.queue_state().await, QueueState::Paused);
        assert_eq!(filenames(&f.scheduler.status().await), ["b"]);
    }

    #[tokio::test]
    async fn test_completion_without_automatic_transition_pauses() {
        let f = fixture(config(true, false)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        f.scheduler.enqueue(vec!["a".into(), "b".into()], false).await.unwrap();
        settle().await;

        f.scheduler.on_print_state("printing").await;
        f.scheduler.on_print_state("complete").await;

        assert_eq!(f.scheduler.queue_state().await, QueueState::Paused);
    }

    #[tokio::test]
    async fn test_start_from_paused_with_empty_queue_arms_ready() {
        let f = fixture(config(false, true)).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;

        let status = f.scheduler.start().await.unwrap();

        assert_eq!(status.queue_state, QueueState::Ready);
    }

    #[tokio::test]
    async fn test_transition_gcode_runs_before_start() {
        let mut cfg = config(true, true);
        cfg.job_transition_gcode = "G28".into();
        let f = fixture(cfg).await;
        f.scheduler.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;

        f.scheduler.enqueue(vec!["a".into()], false).await.unwrap();
        settle().await;

        let scripts: Vec<String> = f
            .fake
            .calls_to(METHOD_GCODE_SCRIPT)
            .iter()
            .map(|p| p["script"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(scripts, ["G28", "SDCARD_PRINT_FILE FILENAME=\"a\""]);
    }

    #[tokio::test]
    async fn test_ids_continue_after_restore() {
        // Arrange: a store holding a previous run's queue
        let fake = FakeControl::new();
        let hub = Arc::new(TransportHub::new(Arc::new(ConfigAuthorizer::new(
            &AuthorizationConfig::default(),
        ))));
        let store = Arc::new(MemoryQueueStore::new());
        store
            .save(&StoredQueue {
                next_id: 5,
                jobs: vec![QueuedJob {
                    job_id: JobId(4),
                    filename: "old".into(),
                    time_added: 1.0,
                }],
            })
            .unwrap();
        let scheduler = Arc::new(JobScheduler::new(fake, hub, store, config(false, false)));

        // Act
        let status = scheduler.enqueue(vec!["new".into()], false).await.unwrap();

        // Assert
        assert_eq!(filenames(&status), ["old", "new"]);
        assert_eq!(status.queued_jobs[1].job_id, JobId(5));
    }
}
