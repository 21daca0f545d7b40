//! SubscriptionService: per-client interest, the single upstream
//! subscription and push demultiplexing.
//!
//! # How subscribe stays race-free
//!
//! The interest table, the status cache and the record of what upstream has
//! acknowledged (`synced`) live behind one async mutex.  A subscribe call
//! holds that mutex while it registers the interest, resubscribes upstream
//! and reads its snapshot.  Status pushes take the same mutex before they
//! touch the cache or route anything.  So for every client, a push is either
//! already reflected in its snapshot or delivered to it afterwards, never
//! both and never neither.
//!
//! ```text
//! subscribe(A, toolhead[position])
//!   lock ─► table.apply ─► composite changed? ─► objects/subscribe(full composite)
//!        ─► absorb result into cache ─► snapshot for A ─► unlock
//! push   lock ─► cache.merge ─► table.route ─► per-client slices ─► unlock
//! ```
//!
//! One-shot queries change no interest.  They read the cache under the
//! mutex and send their upstream query after releasing it, so a slow query
//! never holds up push routing.
//!
//! # Failure handling
//!
//! A failed upstream subscribe leaves the new interest registered and marks
//! the composite dirty.  It is retried on the next interest change, by the
//! broker's resync timer and whenever the control process becomes ready.

use std::sync::Arc;

use relay_core::protocol::messages::{
    METHOD_OBJECTS_LIST, METHOD_OBJECTS_QUERY, METHOD_OBJECTS_SUBSCRIBE, PUSH_STATUS_UPDATE,
};
use relay_core::{
    interest_to_wire, parse_query_request, parse_subscription_request, ControlStatus,
    InterestMap, ObjectCache, SubscriptionTable,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::channel::ControlChannel;
use crate::application::error::RelayError;
use crate::application::hub::ConnectionId;

/// Who registered an interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subscriber {
    /// A client connection.
    Connection(ConnectionId),
    /// The job scheduler's own `print_stats` watch.
    Scheduler,
}

/// Values returned by subscribe and query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub eventtime: f64,
    pub status: Map<String, Value>,
}

#[derive(Default)]
struct RegistryState {
    table: SubscriptionTable<Subscriber>,
    cache: ObjectCache,
    /// Composite last acknowledged upstream on the current connection.
    synced: Option<InterestMap>,
    dirty: bool,
    control_ready: bool,
}

/// Interest registry plus the upstream subscription it drives.
pub struct SubscriptionService {
    channel: Arc<dyn ControlChannel>,
    state: Mutex<RegistryState>,
}

impl SubscriptionService {
    pub fn new(channel: Arc<dyn ControlChannel>) -> Self {
        Self {
            channel,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Replaces `who`'s interest for the objects named in `objects` and
    /// returns current values for the objects it now subscribes to.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidInterest`] for a malformed payload; link errors if
    /// the upstream resubscription or query triggered by this call failed.
    /// On an upstream failure the interest stays registered and is retried.
    pub async fn subscribe(&self, who: Subscriber, objects: &Value) -> Result<Snapshot, RelayError> {
        let changes = parse_subscription_request(objects)?;
        let request: InterestMap = changes
            .iter()
            .filter_map(|(name, set)| set.clone().map(|s| (name.clone(), s)))
            .collect();

        let mut st = self.state.lock().await;
        let changed = st.table.apply(&who, &changes);
        debug!(?who, objects = changes.len(), changed, "interest updated");
        if changed || st.dirty {
            self.sync_locked(&mut st).await?;
        }
        let partial = cached_part(&st, &request);
        self.complete_snapshot(partial).await
    }

    /// Current values without registering interest.  In `objects`, `null`
    /// selects every attribute.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidInterest`] for a malformed payload; link errors
    /// from the upstream query.
    pub async fn query(&self, objects: &Value) -> Result<Snapshot, RelayError> {
        let request = parse_query_request(objects)?;
        let partial = cached_part(&*self.state.lock().await, &request);
        self.complete_snapshot(partial).await
    }

    /// Values a subscribe payload would return, without registering it.
    /// Used for connections that cannot receive pushes.
    ///
    /// # Errors
    ///
    /// As for [`query`](Self::query).
    pub async fn peek(&self, objects: &Value) -> Result<Snapshot, RelayError> {
        let request: InterestMap = parse_subscription_request(objects)?
            .into_iter()
            .filter_map(|(name, set)| set.map(|s| (name, s)))
            .collect();
        let partial = cached_part(&*self.state.lock().await, &request);
        self.complete_snapshot(partial).await
    }

    /// Names of every object the control process exposes.
    ///
    /// # Errors
    ///
    /// Link errors from the upstream call.
    pub async fn list_objects(&self) -> Result<Value, RelayError> {
        let result = self.channel.call(METHOD_OBJECTS_LIST, json!({})).await?;
        Ok(result.get("objects").cloned().unwrap_or(result))
    }

    /// Drops all interest of `who`; resubscribes if the composite shrank.
    /// Returns whether `who` had any interest.
    pub async fn remove_subscriber(&self, who: Subscriber) -> bool {
        let mut st = self.state.lock().await;
        let had_interest = st.table.interest(&who).is_some();
        if st.table.remove_client(&who) {
            if let Err(e) = self.sync_locked(&mut st).await {
                warn!(?who, error = %e, "resubscribe after removal failed; will retry");
            }
        }
        had_interest
    }

    /// Applies a status push and splits it per subscriber.
    ///
    /// The caller delivers the returned slices in order before processing the
    /// next push.
    pub async fn on_status_push(
        &self,
        status: &Map<String, Value>,
        eventtime: f64,
    ) -> Vec<(Subscriber, Map<String, Value>)> {
        let mut st = self.state.lock().await;
        st.cache.merge(status, eventtime);
        st.table.route(status)
    }

    /// Tracks control readiness.
    ///
    /// Leaving `ready` forgets cached values and the acknowledged
    /// subscription, since the control process resets both.  Becoming ready
    /// re-issues the full composite.
    pub async fn on_control_state(&self, status: &ControlStatus) {
        let mut st = self.state.lock().await;
        let ready = status.is_ready();
        if ready == st.control_ready {
            return;
        }
        st.control_ready = ready;
        if !ready {
            st.cache.clear();
            st.synced = None;
            st.dirty = !st.table.composite().is_empty();
            debug!(state = %status.state, "control not ready; subscription state reset");
            return;
        }
        if st.dirty || !st.table.composite().is_empty() {
            if let Err(e) = self.sync_locked(&mut st).await {
                warn!(error = %e, "resubscribe on ready failed; will retry");
            }
        }
    }

    /// Retries a dirty composite.  Returns `true` when nothing is left dirty.
    pub async fn resync_if_dirty(&self) -> bool {
        let mut st = self.state.lock().await;
        if !st.dirty {
            return true;
        }
        match self.sync_locked(&mut st).await {
            Ok(()) => !st.dirty,
            Err(e) => {
                debug!(error = %e, "resync attempt failed");
                false
            }
        }
    }

    /// Copy of the current composite subscription.
    pub async fn composite(&self) -> InterestMap {
        self.state.lock().await.table.composite().clone()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Sends the full composite upstream if the control process is ready.
    async fn sync_locked(&self, st: &mut RegistryState) -> Result<(), RelayError> {
        let composite = st.table.composite().clone();
        if !st.control_ready {
            st.dirty = !composite.is_empty() || st.synced.is_some();
            return Ok(());
        }
        if st.synced.as_ref() == Some(&composite) || (st.synced.is_none() && composite.is_empty()) {
            st.dirty = false;
            return Ok(());
        }

        let params = json!({
            "objects": interest_to_wire(&composite),
            "response_template": {"method": PUSH_STATUS_UPDATE},
        });
        match self.channel.call(METHOD_OBJECTS_SUBSCRIBE, params).await {
            Ok(result) => {
                let (status, eventtime) = split_status(&result);
                let previous = st.synced.take().unwrap_or_default();
                st.cache.absorb_subscription(&status, eventtime, &previous);
                info!(objects = composite.len(), "upstream subscription updated");
                st.synced = Some(composite);
                st.dirty = false;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "upstream subscribe failed; marking dirty");
                st.dirty = true;
                Err(e)
            }
        }
    }

    /// Queries upstream for the part of `partial` the cache cannot answer.
    async fn complete_snapshot(&self, partial: PartialSnapshot) -> Result<Snapshot, RelayError> {
        let PartialSnapshot {
            mut snapshot,
            uncovered,
        } = partial;
        if uncovered.is_empty() {
            return Ok(snapshot);
        }
        let result = self
            .channel
            .call(
                METHOD_OBJECTS_QUERY,
                json!({"objects": interest_to_wire(&uncovered)}),
            )
            .await?;
        let (queried, queried_time) = split_status(&result);
        for (name, set) in &uncovered {
            if let Some(fields) = queried.get(name).and_then(Value::as_object) {
                snapshot
                    .status
                    .insert(name.clone(), Value::Object(set.filter(fields)));
            }
        }
        snapshot.eventtime = snapshot.eventtime.max(queried_time);
        Ok(snapshot)
    }
}

/// Cached values plus the objects that still need an upstream query.
struct PartialSnapshot {
    snapshot: Snapshot,
    uncovered: InterestMap,
}

/// Serves from the cache what upstream already pushes.  While the control
/// process is not ready, the cache answers everything.
fn cached_part(st: &RegistryState, request: &InterestMap) -> PartialSnapshot {
    let cached = |part: &InterestMap| Snapshot {
        eventtime: st.cache.eventtime(),
        status: st.cache.snapshot(part),
    };
    if !st.control_ready {
        return PartialSnapshot {
            snapshot: cached(request),
            uncovered: InterestMap::default(),
        };
    }
    let synced = st.synced.clone().unwrap_or_default();
    let (covered, uncovered): (InterestMap, InterestMap) =
        request.iter().map(|(k, v)| (k.clone(), v.clone())).partition(|(name, set)| {
            synced.get(name).map(|s| s.covers(set)).unwrap_or(false)
        });
    PartialSnapshot {
        snapshot: cached(&covered),
        uncovered,
    }
}

/// Reads `{status, eventtime}` from a subscribe or query result.
fn split_status(result: &Value) -> (Map<String, Value>, f64) {
    let status = result
        .get("status")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let eventtime = result.get("eventtime").and_then(Value::as_f64).unwrap_or(0.0);
    (status, eventtime)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::channel::fake::FakeControl;
    use relay_core::{AttributeSet, ControlState};

    const A: Subscriber = Subscriber::Connection(1);
    const B: Subscriber = Subscriber::Connection(2);

    async fn ready_service(fake: &Arc<FakeControl>) -> SubscriptionService {
        let svc = SubscriptionService::new(fake.clone());
        svc.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;
        svc
    }

    fn toolhead_control() -> Arc<FakeControl> {
        let fake = FakeControl::new();
        fake.on(METHOD_OBJECTS_SUBSCRIBE, |_| {
            Ok(json!({"eventtime": 10.0, "status": {
                "toolhead": {"position": [1, 2, 3, 0], "homed_axes": "xyz"}
            }}))
        });
        fake.on(METHOD_OBJECTS_QUERY, |_| {
            Ok(json!({"eventtime": 11.0, "status": {
                "print_stats": {"state": "standby", "filename": ""}
            }}))
        });
        fake
    }

    #[tokio::test]
    async fn test_subscribe_issues_full_composite_and_returns_snapshot() {
        // Arrange
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;

        // Act
        let snap = svc
            .subscribe(A, &json!({"toolhead": ["position"]}))
            .await
            .unwrap();

        // Assert: one upstream subscribe carrying the composite
        let calls = fake.calls_to(METHOD_OBJECTS_SUBSCRIBE);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["objects"], json!({"toolhead": ["position"]}));
        assert_eq!(calls[0]["response_template"]["method"], "process_status_update");
        // Assert: snapshot filtered to what A asked for
        assert_eq!(Value::Object(snap.status), json!({"toolhead": {"position": [1, 2, 3, 0]}}));
    }

    #[tokio::test]
    async fn test_covered_subscribe_does_not_resubscribe() {
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;
        svc.subscribe(A, &json!({"toolhead": "*"})).await.unwrap();

        let snap = svc.subscribe(B, &json!({"toolhead": ["homed_axes"]})).await.unwrap();

        assert_eq!(fake.calls_to(METHOD_OBJECTS_SUBSCRIBE).len(), 1);
        assert_eq!(snap.status["toolhead"], json!({"homed_axes": "xyz"}));
    }

    #[tokio::test]
    async fn test_push_routed_only_to_interested_attributes() {
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;
        svc.subscribe(A, &json!({"toolhead": ["position"]})).await.unwrap();
        svc.subscribe(B, &json!({"toolhead": ["homed_axes"]})).await.unwrap();

        let push = json!({"toolhead": {"position": [5, 5, 5, 0]}});
        let routed = svc.on_status_push(push.as_object().unwrap(), 12.0).await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, A);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_latest_push() {
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;
        svc.subscribe(A, &json!({"toolhead": ["position"]})).await.unwrap();
        let push = json!({"toolhead": {"position": [9, 9, 9, 0]}});
        svc.on_status_push(push.as_object().unwrap(), 13.0).await;

        let snap = svc.subscribe(B, &json!({"toolhead": ["position"]})).await.unwrap();

        assert_eq!(snap.status["toolhead"]["position"], json!([9, 9, 9, 0]));
        assert_eq!(snap.eventtime, 13.0);
    }

    #[tokio::test]
    async fn test_disconnect_shrinks_composite_and_resubscribes() {
        // Arrange
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;
        svc.subscribe(A, &json!({"toolhead": ["position"]})).await.unwrap();
        svc.subscribe(B, &json!({"toolhead": ["homed_axes"]})).await.unwrap();

        // Act
        assert!(svc.remove_subscriber(A).await);

        // Assert
        let calls = fake.calls_to(METHOD_OBJECTS_SUBSCRIBE);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2]["objects"], json!({"toolhead": ["homed_axes"]}));
        assert_eq!(svc.composite().await["toolhead"], AttributeSet::only(["homed_axes"]));
    }

    #[tokio::test]
    async fn test_failed_resubscribe_marks_dirty_and_retries() {
        // Arrange: upstream rejects subscribes
        let fake = FakeControl::new();
        fake.on(METHOD_OBJECTS_SUBSCRIBE, |_| Err(RelayError::CallTimeout { method: "objects/subscribe".into() }));
        let svc = ready_service(&fake).await;

        // Act
        let result = svc.subscribe(A, &json!({"fan": ["speed"]})).await;

        // Assert: triggering client sees the error, interest retained, dirty
        assert!(matches!(result, Err(RelayError::CallTimeout { .. })));
        assert!(svc.is_dirty().await);
        assert!(svc.composite().await.contains_key("fan"));

        // Act: upstream recovers, timer fires
        fake.on(METHOD_OBJECTS_SUBSCRIBE, |_| Ok(json!({"eventtime": 1.0, "status": {}})));
        assert!(svc.resync_if_dirty().await);
        assert!(!svc.is_dirty().await);
    }

    #[tokio::test]
    async fn test_query_does_not_register_interest() {
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;

        let snap = svc.query(&json!({"print_stats": null})).await.unwrap();

        assert_eq!(snap.status["print_stats"]["state"], "standby");
        assert!(svc.composite().await.is_empty());
        assert!(fake.calls_to(METHOD_OBJECTS_SUBSCRIBE).is_empty());
    }

    #[tokio::test]
    async fn test_pending_query_does_not_hold_up_pushes() {
        // Arrange: the upstream query is held until released
        let fake = toolhead_control();
        let gate = fake.gate(METHOD_OBJECTS_QUERY);
        let svc = Arc::new(ready_service(&fake).await);
        svc.subscribe(A, &json!({"toolhead": ["position"]})).await.unwrap();
        let query = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.query(&json!({"print_stats": null})).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fake.calls_to(METHOD_OBJECTS_QUERY).len(), 1);

        // Act
        let push = json!({"toolhead": {"position": [4, 4, 4, 0]}});
        let routed = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            svc.on_status_push(push.as_object().unwrap(), 14.0),
        )
        .await
        .expect("push routing blocked by pending query");

        // Assert
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, A);
        gate.notify_one();
        let snap = query.await.unwrap().unwrap();
        assert_eq!(snap.status["print_stats"]["state"], "standby");
    }

    #[tokio::test]
    async fn test_subscribe_while_not_ready_defers_upstream_call() {
        // Arrange: never ready
        let fake = toolhead_control();
        let svc = SubscriptionService::new(fake.clone());

        // Act
        let snap = svc.subscribe(A, &json!({"toolhead": ["position"]})).await.unwrap();

        // Assert
        assert!(snap.status.is_empty());
        assert!(fake.calls_to(METHOD_OBJECTS_SUBSCRIBE).is_empty());
        assert!(svc.is_dirty().await);

        // Act: control becomes ready
        svc.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;

        // Assert: composite re-issued
        assert_eq!(fake.calls_to(METHOD_OBJECTS_SUBSCRIBE).len(), 1);
        assert!(!svc.is_dirty().await);
    }

    #[tokio::test]
    async fn test_reconnect_reissues_composite() {
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;
        svc.subscribe(A, &json!({"toolhead": ["position"]})).await.unwrap();

        svc.on_control_state(&ControlStatus::disconnected()).await;
        svc.on_control_state(&ControlStatus::new(ControlState::Ready, "")).await;

        let calls = fake.calls_to(METHOD_OBJECTS_SUBSCRIBE);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1]["objects"], json!({"toolhead": ["position"]}));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected_without_side_effects() {
        let fake = toolhead_control();
        let svc = ready_service(&fake).await;

        let result = svc.subscribe(A, &json!(["toolhead"])).await;

        assert!(matches!(result, Err(RelayError::InvalidInterest(_))));
        assert!(svc.composite().await.is_empty());
    }
}
