use crate::{
    core::{conditions, Condition, Conditions},
    health::Prober,
    index::{
        expand, mcs, store, tunnel::TUNNEL_SERVICE, Object, Projected, Projection, Registry,
        SharedCache,
    },
    k8s::{labels, Client, Labels, ResourceExt, Route, RoutePolicy},
    metrics::SyncMetrics,
    reconcile::{Outcome, RouteReconciler},
    status::{self, Kind, Statuses, Target},
};
use ahash::AHashSet as HashSet;
use chrono::Utc;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time;
use tracing::{info_span, Instrument};

const REASON_READY: &str = "Ready";
const REASON_INVALID: &str = "Invalid";
const REASON_NO_ROUTES: &str = "NoRoutes";

#[derive(Clone, Debug)]
pub struct SyncerConfig {
    /// The control-plane namespace holding hubs, policies and routes.
    pub namespace: String,
    pub tunnel_namespace: String,
    pub control_plane_hub: String,
    pub probe_throttle: time::Duration,
}

/// Runs one serialised sync pass per trigger request.
///
/// Each pass refreshes the hub registry, bridges MCS declarations into
/// policies, expands policies into routes, projects routes onto hubs, probes
/// tunnels and finally publishes statuses.
pub struct Syncer {
    config: SyncerConfig,
    registry: Arc<Registry>,
    client: Client,
    policies: SharedCache<RoutePolicy>,
    routes: SharedCache<Route>,
    bridged: Projection<RoutePolicy>,
    generated: Projection<Route>,
    reconciler: RouteReconciler,
    prober: Prober,
    statuses: Statuses,
    objects: Conditions,
    metrics: SyncMetrics,
}

/// How the routes generated from one policy fared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Tally {
    routes: usize,
    error: Option<String>,
}

// === impl Syncer ===

impl Syncer {
    pub fn new(
        config: SyncerConfig,
        registry: Arc<Registry>,
        client: Client,
        policies: SharedCache<RoutePolicy>,
        routes: SharedCache<Route>,
        statuses: Statuses,
        metrics: SyncMetrics,
    ) -> Self {
        let prober = Prober::new(registry.conditions().clone(), config.probe_throttle);
        let reconciler = RouteReconciler::new(&config.tunnel_namespace);
        Self {
            config,
            registry,
            client,
            policies,
            routes,
            bridged: Projection::default(),
            generated: Projection::default(),
            reconciler,
            prober,
            statuses,
            objects: Conditions::default(),
            metrics,
        }
    }

    pub async fn sync(&mut self) {
        let start = time::Instant::now();

        self.registry.refresh().instrument(info_span!("hub")).await;

        // MCS objects live in application namespaces on each hub.
        let (exports, imports) = self.registry.list_mcs(None);
        let bridged = mcs::policies(&self.config.namespace, &exports, &imports);
        let cached = self.policies.read().list_namespaced(&self.config.namespace);
        converge(&self.client, &mut self.bridged, &cached, bridged)
            .instrument(info_span!("mcs"))
            .await;

        let generated = {
            let mut routes = expand::routes(&cached, |hub| self.registry.list_services(hub));
            routes.extend(expand::mirror_tunnel_routes(
                &self.config.namespace,
                &self.registry.list_hubs(),
                &self.config.control_plane_hub,
                &self.config.tunnel_namespace,
                TUNNEL_SERVICE,
            ));
            routes
        };
        let cached_routes = self.routes.read().list_namespaced(&self.config.namespace);
        converge(
            &self.client,
            &mut self.generated,
            &cached_routes,
            generated.clone(),
        )
        .instrument(info_span!("policies"))
        .await;

        let routes = reconciled_routes(generated, &cached_routes);
        let outcomes = self
            .reconciler
            .reconcile(&*self.registry, &routes)
            .instrument(info_span!("routes"))
            .await;

        let targets = self
            .registry
            .connected()
            .into_iter()
            .filter_map(|hub| {
                let tunnel = self.registry.tunnel(&hub)?;
                Some((hub, tunnel))
            })
            .collect::<Vec<_>>();
        self.prober
            .run(&targets)
            .instrument(info_span!("health"))
            .await;

        self.publish(&cached, &cached_routes, &outcomes);

        let errors = outcomes.iter().filter(|o| o.result.is_err()).count();
        self.metrics.observe(
            start.elapsed(),
            outcomes.len(),
            errors,
            self.reconciler.len(),
        );
        tracing::debug!(
            routes = outcomes.len(),
            errors,
            objects = self.reconciler.len(),
            elapsed = ?start.elapsed(),
            "Synced"
        );
    }

    fn publish(&self, policies: &[RoutePolicy], routes: &[Route], outcomes: &[Outcome]) {
        let now = Utc::now();
        let ns = &self.config.namespace;
        let mut published = HashSet::new();

        let hub_conds = self.registry.conditions();
        for hub in self.registry.list_hubs() {
            let name = hub.name_unchecked();
            let (ready, reason) =
                hub_conds.ready(&name, &[conditions::CONNECTED, conditions::TUNNEL_HEALTH]);
            let reason = if ready { REASON_READY.to_string() } else { reason };
            hub_conds.set(&name, Condition::new(conditions::READY, ready, reason, ""));
            let phase = if ready {
                status::PHASE_READY
            } else {
                status::PHASE_PENDING
            };
            let target = Target::new(Kind::Hub, ns, &name);
            self.statuses.publish(
                target.clone(),
                &status::hub_status(phase, &hub_conds.get(&name), now),
            );
            published.insert(target);
        }

        // Only objects already in the cache can have their status patched.
        let existing = routes.iter().map(|r| r.name_any()).collect::<HashSet<_>>();
        for Outcome { route, result } in outcomes {
            let name = route.name_any();
            if !existing.contains(&name) {
                continue;
            }
            let key = format!("Route/{name}");
            let ready = result.is_ok();
            let cond = match result {
                Ok(ports) => Condition::new(
                    conditions::READY,
                    true,
                    REASON_READY,
                    format!("{ports} port(s) routed"),
                ),
                Err(error) => Condition::new(
                    conditions::READY,
                    false,
                    REASON_INVALID,
                    error.to_string(),
                ),
            };
            self.objects.set(&key, cond);
            let phase = if ready {
                status::PHASE_READY
            } else {
                status::PHASE_NOT_READY
            };
            let target = Target::new(Kind::Route, ns, &name);
            self.statuses.publish(
                target.clone(),
                &status::route_status(&route.spec, phase, &self.objects.get(&key), now),
            );
            published.insert(target);
        }

        let tallies = tally(outcomes);
        for policy in policies {
            let name = policy.name_any();
            let key = format!("RoutePolicy/{name}");
            let Tally { routes, error } = tallies.get(&name).cloned().unwrap_or_default();
            let cond = match error {
                Some(message) => Condition::new(conditions::READY, false, REASON_INVALID, message),
                None if routes == 0 => Condition::new(
                    conditions::READY,
                    false,
                    REASON_NO_ROUTES,
                    "No service matches the policy",
                ),
                None => Condition::new(conditions::READY, true, REASON_READY, ""),
            };
            let phase = if cond.holds() {
                status::PHASE_READY
            } else {
                status::PHASE_NOT_READY
            };
            self.objects.set(&key, cond);
            let target = Target::new(Kind::RoutePolicy, ns, &name);
            self.statuses.publish(
                target.clone(),
                &status::policy_status(phase, routes, &self.objects.get(&key), now),
            );
            published.insert(target);
        }

        self.statuses.retain(|target| published.contains(target));
        for key in self.objects.names() {
            let keep = key
                .split_once('/')
                .map(|(kind, name)| {
                    let kind = match kind {
                        "Route" => Kind::Route,
                        _ => Kind::RoutePolicy,
                    };
                    published.contains(&Target::new(kind, ns, name))
                })
                .unwrap_or(false);
            if !keep {
                self.objects.delete(&key);
            }
        }
    }
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

/// Writes `desired` into the control plane and deletes whatever a previous
/// pass wrote that is no longer desired.
///
/// Cached objects labelled as generated by the controller are adopted into
/// the baseline, so objects left behind by an earlier process are collected
/// too.
async fn converge<K>(
    client: &Client,
    projection: &mut Projection<K>,
    cached: &[K],
    desired: Vec<K>,
) where
    K: Object + Projected,
{
    let orphans = cached
        .iter()
        .filter(|obj| is_generated(*obj) && projection.get(&obj.uniq_name()).is_none())
        .cloned()
        .collect::<Vec<_>>();
    if !orphans.is_empty() {
        let adopted = projection.iter().cloned().chain(orphans).collect::<Vec<_>>();
        projection.commit(adopted);
    }

    let diff = projection.diff(desired);
    if diff.is_empty() {
        return;
    }

    let mut written = diff.unchanged;
    for obj in diff.apply {
        match store::apply(client, &obj).await {
            Ok(applied) => {
                tracing::debug!(object = %obj.uniq_name(), ?applied);
                written.push(obj);
            }
            Err(error) => {
                tracing::warn!(object = %obj.uniq_name(), %error, "Failed to apply");
                if let Some(prior) = projection.get(&obj.uniq_name()) {
                    written.push(prior.clone());
                }
            }
        }
    }
    for obj in diff.delete {
        match store::delete(client, &obj).await {
            Ok(_) => tracing::debug!(object = %obj.uniq_name(), "Deleted"),
            Err(error) => {
                tracing::warn!(object = %obj.uniq_name(), %error, "Failed to delete");
                written.push(obj);
            }
        }
    }
    projection.commit(written);
}

fn is_generated<K: ResourceExt>(obj: &K) -> bool {
    Labels::from(obj.labels().clone()).get(labels::GENERATED_BY) == Some(labels::GENERATED_BY_FERRY)
}

/// Combines this pass's generated routes with routes authored directly.
fn reconciled_routes(generated: Vec<Route>, cached: &[Route]) -> Vec<Route> {
    let mut routes = cached
        .iter()
        .filter(|r| !is_generated(*r))
        .map(|r| (r.name_any(), r.clone()))
        .collect::<BTreeMap<_, _>>();
    routes.extend(generated.into_iter().map(|r| (r.name_any(), r)));
    routes.into_values().collect()
}

fn owner_policy(route: &Route) -> Option<&str> {
    route
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|o| o.kind == "RoutePolicy")
        .map(|o| o.name.as_str())
}

fn tally(outcomes: &[Outcome]) -> BTreeMap<String, Tally> {
    let mut tallies = BTreeMap::<String, Tally>::new();
    for Outcome { route, result } in outcomes {
        let Some(policy) = owner_policy(route) else {
            continue;
        };
        let tally = tallies.entry(policy.to_string()).or_default();
        match result {
            Ok(_) => tally.routes += 1,
            Err(error) => {
                if tally.error.is_none() {
                    tally.error = Some(format!("{}: {error}", route.name_any()));
                }
            }
        }
    }
    tallies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        k8s::{route::RouteSpecRule, ObjectMeta, OwnerReference, RouteSpec},
        mock,
        reconcile::RouteError,
    };
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn route(name: &str, policy: Option<&str>, generated: bool) -> Route {
        Route {
            metadata: ObjectMeta {
                namespace: Some("ferry-system".to_string()),
                name: Some(name.to_string()),
                labels: generated.then(|| {
                    btreemap! {
                        labels::GENERATED_BY.to_string() => labels::GENERATED_BY_FERRY.to_string(),
                    }
                }),
                owner_references: policy.map(|p| {
                    vec![OwnerReference {
                        api_version: "traffic.ferryproxy.io/v1alpha2".to_string(),
                        kind: "RoutePolicy".to_string(),
                        name: p.to_string(),
                        uid: format!("uid-{p}"),
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            spec: RouteSpec {
                export: RouteSpecRule::new("export", "test", name),
                import: RouteSpecRule::new("import", "test", name),
            },
            status: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_updates_keep_prior_generated_objects() {
        let (client, requests) = mock::client(|method, _, _| {
            if method == http::Method::GET {
                Some(mock::failure(403, "Forbidden"))
            } else if method == http::Method::DELETE {
                Some(mock::failure(404, "NotFound"))
            } else {
                None
            }
        });

        let prior = route("p1-aaaaaaaaaaaa", Some("p1"), true);
        let mut projection = Projection::default();
        projection.commit([prior.clone()]);

        let mut changed = prior.clone();
        changed.spec.import = RouteSpecRule::new("import", "test", "other");
        converge(&client, &mut projection, &[], vec![changed]).await;
        assert_eq!(
            projection.get(&prior.uniq_name()).map(|r| &r.spec),
            Some(&prior.spec)
        );

        // Once the route is no longer desired, the object still gets deleted.
        converge(&client, &mut projection, &[], vec![]).await;
        assert!(projection.is_empty());
        let sent = requests
            .lock()
            .iter()
            .map(|(method, path, _)| format!("{method} {path}"))
            .collect::<Vec<_>>();
        let path = "/apis/traffic.ferryproxy.io/v1alpha2/namespaces/ferry-system/routes/p1-aaaaaaaaaaaa";
        assert_eq!(sent, [format!("GET {path}"), format!("DELETE {path}")]);
    }

    fn names(routes: &[Route]) -> Vec<String> {
        routes.iter().map(|r| r.name_any()).collect()
    }

    #[test]
    fn direct_routes_join_generated_ones() {
        let cached = [
            route("direct", None, false),
            route("stale", Some("p1"), true),
            route("p1-aaaaaaaaaaaa", Some("p1"), true),
        ];
        let generated = vec![route("p1-aaaaaaaaaaaa", Some("p1"), true)];
        assert_eq!(
            names(&reconciled_routes(generated, &cached)),
            ["direct", "p1-aaaaaaaaaaaa"]
        );
    }

    #[test]
    fn generated_route_wins_over_direct_namesake() {
        let cached = [route("svc1", None, false)];
        let mut generated = route("svc1", Some("p1"), true);
        generated.spec.import.hub_name = "other".to_string();
        let routes = reconciled_routes(vec![generated], &cached);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].spec.import.hub_name, "other");
    }

    #[test]
    fn tallies_routes_by_owner() {
        let outcomes = vec![
            Outcome {
                route: route("p1-a", Some("p1"), true),
                result: Ok(1),
            },
            Outcome {
                route: route("p1-b", Some("p1"), true),
                result: Err(RouteError::MissingService("export.test/p1-b".to_string())),
            },
            Outcome {
                route: route("p2-a", Some("p2"), true),
                result: Ok(2),
            },
            Outcome {
                route: route("direct", None, false),
                result: Ok(1),
            },
        ];
        assert_eq!(
            tally(&outcomes),
            btreemap! {
                "p1".to_string() => Tally {
                    routes: 1,
                    error: Some("p1-b: service export.test/p1-b does not exist".to_string()),
                },
                "p2".to_string() => Tally { routes: 1, error: None },
            }
        );
    }

    #[test]
    fn only_ferry_objects_are_generated() {
        assert!(is_generated(&route("a", Some("p1"), true)));
        assert!(!is_generated(&route("b", None, false)));
    }
}
