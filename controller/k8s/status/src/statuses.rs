use crate::{ControllerMetrics, Target, Update};
use ahash::AHashMap as HashMap;
use chrono::{DateTime, SecondsFormat, Utc};
use ferry_controller_core as core;
use ferry_controller_k8s_api::{
    self as k8s, route::RouteSpec, HubStatus, RoutePolicyStatus, RouteStatus,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

pub const PHASE_READY: &str = "Ready";
pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_NOT_READY: &str = "NotReady";

const TIMESTAMP: &str = "lastSynchronizationTimestamp";

/// Publishes statuses to the [`Controller`](crate::Controller).
///
/// A status identical to the last one published for the same target is
/// suppressed. The sync timestamp is ignored when comparing, so it only
/// advances alongside a real change.
#[derive(Debug)]
pub struct Statuses {
    tx: mpsc::Sender<Update>,
    sent: Ledger,
    metrics: ControllerMetrics,
}

/// The last status queued for each target, shared with the
/// [`Controller`](crate::Controller) so that a failed patch is published
/// again on the next pass.
#[derive(Clone, Debug, Default)]
pub struct Ledger(Arc<Mutex<HashMap<Target, serde_json::Value>>>);

// === impl Statuses ===

impl Statuses {
    pub fn new(tx: mpsc::Sender<Update>, sent: Ledger, metrics: ControllerMetrics) -> Self {
        Self { tx, sent, metrics }
    }

    /// Returns true if a patch was queued.
    pub fn publish<S: Serialize>(&self, target: Target, status: &S) -> bool {
        let status = match serde_json::to_value(status) {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(%target, %error, "Failed to serialize status");
                return false;
            }
        };
        let key = without_timestamp(&status);

        let mut sent = self.sent.0.lock();
        if sent.get(&target) == Some(&key) {
            return false;
        }

        let labels = target.kind.labels();
        let update = Update {
            target: target.clone(),
            patch: serde_json::json!({ "status": status }),
        };
        match self.tx.try_send(update) {
            Ok(()) => {
                sent.insert(target, key);
                self.metrics.enqueued.get_or_create(&labels).inc();
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%target, "Status queue is full; the patch will be retried");
                self.metrics.dropped.get_or_create(&labels).inc();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Forgets targets for which `keep` returns false.
    pub fn retain(&self, keep: impl Fn(&Target) -> bool) {
        self.sent.0.lock().retain(|target, _| keep(target));
    }
}

// === impl Ledger ===

impl Ledger {
    /// Forgets the status `update` carried, unless a newer one has been
    /// queued since.
    pub(crate) fn forget(&self, update: &Update) {
        let key = without_timestamp(&update.patch["status"]);
        let mut sent = self.0.lock();
        if sent.get(&update.target) == Some(&key) {
            sent.remove(&update.target);
        }
    }
}

fn without_timestamp(status: &serde_json::Value) -> serde_json::Value {
    let mut status = status.clone();
    if let Some(fields) = status.as_object_mut() {
        fields.remove(TIMESTAMP);
    }
    status
}

pub fn hub_status(phase: &str, conditions: &[core::Condition], now: DateTime<Utc>) -> HubStatus {
    HubStatus {
        phase: Some(phase.to_string()),
        last_synchronization_timestamp: Some(timestamp(now)),
        conditions: conditions.iter().map(condition).collect(),
    }
}

pub fn route_status(
    spec: &RouteSpec,
    phase: &str,
    conditions: &[core::Condition],
    now: DateTime<Utc>,
) -> RouteStatus {
    RouteStatus {
        phase: Some(phase.to_string()),
        import: Some(spec.import.to_string()),
        export: Some(spec.export.to_string()),
        last_synchronization_timestamp: Some(timestamp(now)),
        conditions: conditions.iter().map(condition).collect(),
    }
}

pub fn policy_status(
    phase: &str,
    route_count: usize,
    conditions: &[core::Condition],
    now: DateTime<Utc>,
) -> RoutePolicyStatus {
    RoutePolicyStatus {
        phase: Some(phase.to_string()),
        route_count: Some(i32::try_from(route_count).unwrap_or(i32::MAX)),
        last_synchronization_timestamp: Some(timestamp(now)),
        conditions: conditions.iter().map(condition).collect(),
    }
}

fn condition(cond: &core::Condition) -> k8s::Condition {
    k8s::Condition {
        type_: cond.type_.clone(),
        status: cond.status.to_string(),
        reason: cond.reason.clone(),
        message: cond.message.clone(),
        last_transition_time: timestamp(cond.last_transition_time),
    }
}

fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kind;
    use chrono::TimeZone;
    use ferry_controller_k8s_api::route::RouteSpecRule;
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn hub(name: &str) -> Target {
        Target::new(Kind::Hub, "ferry-system", name)
    }

    fn ready() -> Vec<core::Condition> {
        vec![core::Condition::new(core::conditions::READY, true, "Ready", "").at(t(0))]
    }

    #[test]
    fn suppresses_identical_statuses() {
        let (tx, mut rx) = mpsc::channel(8);
        let statuses = Statuses::new(tx, Ledger::default(), Default::default());

        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &ready(), t(1))));
        // Only the timestamp moved.
        assert!(!statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &ready(), t(2))));
        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_PENDING, &ready(), t(3))));
        assert!(statuses.publish(hub("hub-1"), &hub_status(PHASE_READY, &ready(), t(4))));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.target, hub("hub-0"));
        assert_eq!(
            first.patch,
            serde_json::json!({
                "status": {
                    "phase": "Ready",
                    "lastSynchronizationTimestamp": "1970-01-01T00:00:01Z",
                    "conditions": [{
                        "type": "Ready",
                        "status": "True",
                        "reason": "Ready",
                        "message": "",
                        "lastTransitionTime": "1970-01-01T00:00:00Z",
                    }],
                },
            })
        );
        assert_eq!(rx.try_recv().unwrap().patch["status"]["phase"], "Pending");
        assert_eq!(rx.try_recv().unwrap().target, hub("hub-1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_retries_later() {
        let (tx, mut rx) = mpsc::channel(1);
        let statuses = Statuses::new(tx, Ledger::default(), Default::default());

        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &[], t(1))));
        assert!(!statuses.publish(hub("hub-1"), &hub_status(PHASE_READY, &[], t(1))));

        rx.try_recv().unwrap();
        assert!(statuses.publish(hub("hub-1"), &hub_status(PHASE_READY, &[], t(2))));
    }

    #[test]
    fn forgotten_targets_are_republished() {
        let (tx, _rx) = mpsc::channel(8);
        let statuses = Statuses::new(tx, Ledger::default(), Default::default());
        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &[], t(1))));
        statuses.retain(|_| false);
        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &[], t(1))));
    }

    #[test]
    fn forgotten_failures_are_republished() {
        let (tx, mut rx) = mpsc::channel(8);
        let ledger = Ledger::default();
        let statuses = Statuses::new(tx, ledger.clone(), Default::default());

        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &[], t(1))));
        let failed = rx.try_recv().unwrap();
        ledger.forget(&failed);
        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &[], t(2))));
    }

    #[test]
    fn stale_failures_do_not_forget_newer_statuses() {
        let (tx, mut rx) = mpsc::channel(8);
        let ledger = Ledger::default();
        let statuses = Statuses::new(tx, ledger.clone(), Default::default());

        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_PENDING, &[], t(1))));
        assert!(statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &[], t(2))));
        ledger.forget(&rx.try_recv().unwrap());
        assert!(!statuses.publish(hub("hub-0"), &hub_status(PHASE_READY, &[], t(3))));
    }

    #[test]
    fn route_status_prints_endpoints() {
        let spec = RouteSpec {
            export: RouteSpecRule::new("export", "test", "svc1"),
            import: RouteSpecRule::new("import", "test", "svc1"),
        };
        let status = route_status(&spec, PHASE_READY, &[], t(0));
        assert_eq!(status.export.as_deref(), Some("export.test/svc1"));
        assert_eq!(status.import.as_deref(), Some("import.test/svc1"));

        let status = policy_status(PHASE_NOT_READY, 3, &[], t(0));
        assert_eq!(status.route_count, Some(3));
    }
}
