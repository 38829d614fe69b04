use crate::Ledger;
use ferry_controller_k8s_api::{
    self as k8s, Hub, NamespaceResourceScope, Patch, PatchParams, Resource, Route, RoutePolicy,
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::{sync::mpsc, time};

/// Applies status patches, one at a time, in the order they were published.
///
/// A patch that fails or times out is forgotten from the [`Ledger`] so the
/// next sync pass publishes it again.
pub struct Controller {
    client: k8s::Client,
    updates: mpsc::Receiver<Update>,
    sent: Ledger,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    pub(crate) enqueued: Family<KindLabels, Counter>,
    pub(crate) dropped: Family<KindLabels, Counter>,
    patch_succeeded: Family<KindLabels, Counter>,
    patch_failed: Family<KindLabels, Counter>,
    patch_timeout: Family<KindLabels, Counter>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Hub,
    Route,
    RoutePolicy,
}

/// The object whose status subresource is patched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub target: Target,
    /// A JSON merge patch against the whole object.
    pub patch: serde_json::Value,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct KindLabels {
    kind: &'static str,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: k8s::Client,
        updates: mpsc::Receiver<Update>,
        sent: Ledger,
        patch_timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            updates,
            sent,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let params = PatchParams {
            field_manager: Some(ferry_controller_core::CONTROLLER_NAME.to_string()),
            ..Default::default()
        };
        while let Some(update) = self.updates.recv().await {
            let target = &update.target;
            let patch = Patch::Merge(&update.patch);
            let settled = match target.kind {
                Kind::Hub => self.patch::<Hub>(target, &params, &patch).await,
                Kind::Route => self.patch::<Route>(target, &params, &patch).await,
                Kind::RoutePolicy => self.patch::<RoutePolicy>(target, &params, &patch).await,
            };
            if !settled {
                self.sent.forget(&update);
            }
        }
        tracing::debug!("Status updates closed");
    }

    /// Returns false if the patch should be published again.
    async fn patch<K>(
        &self,
        target: &Target,
        params: &PatchParams,
        patch: &Patch<&serde_json::Value>,
    ) -> bool
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api = k8s::Api::<K>::namespaced(self.client.clone(), &target.namespace);
        let labels = target.kind.labels();
        match time::timeout(
            self.patch_timeout,
            api.patch_status(&target.name, params, patch),
        )
        .await
        {
            Ok(Ok(_)) => {
                tracing::debug!(kind = %target.kind, namespace = %target.namespace, name = %target.name, "Patched status");
                self.metrics.patch_succeeded.get_or_create(&labels).inc();
                true
            }
            Ok(Err(k8s::Error::Api(rsp))) if rsp.code == 404 => {
                tracing::debug!(kind = %target.kind, namespace = %target.namespace, name = %target.name, "Object deleted before its status was patched");
                self.metrics.patch_failed.get_or_create(&labels).inc();
                true
            }
            Ok(Err(error)) => {
                tracing::warn!(kind = %target.kind, namespace = %target.namespace, name = %target.name, %error, "Failed to patch status");
                self.metrics.patch_failed.get_or_create(&labels).inc();
                false
            }
            Err(_) => {
                tracing::warn!(kind = %target.kind, namespace = %target.namespace, name = %target.name, timeout = ?self.patch_timeout, "Status patch timed out");
                self.metrics.patch_timeout.get_or_create(&labels).inc();
                false
            }
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "patch_enqueued",
            "Count of status patches queued for application",
            metrics.enqueued.clone(),
        );
        reg.register(
            "patch_dropped",
            "Count of status patches dropped because the queue was full",
            metrics.dropped.clone(),
        );
        reg.register(
            "patch_succeeded",
            "Count of status patches applied successfully",
            metrics.patch_succeeded.clone(),
        );
        reg.register(
            "patch_failed",
            "Count of status patches that failed",
            metrics.patch_failed.clone(),
        );
        reg.register(
            "patch_timeout",
            "Count of status patches that timed out",
            metrics.patch_timeout.clone(),
        );
        metrics
    }
}

// === impl Kind ===

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hub => "Hub",
            Self::Route => "Route",
            Self::RoutePolicy => "RoutePolicy",
        }
    }

    pub(crate) fn labels(&self) -> KindLabels {
        KindLabels {
            kind: self.as_str(),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Target ===

impl Target {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}
