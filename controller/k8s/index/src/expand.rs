//! Expands `RoutePolicy` objects into concrete `Route`s.
//!
//! A policy names export and import hubs, optionally narrowed by service namespace, name or
//! labels. Every (export rule, import rule) pair is matched against the services actually
//! present on the export hub; each match becomes one route.

use ferry_controller_k8s_api::{
    labels::{self, Labels, Selector},
    route::RouteSpecRule,
    route_policy::{RoutePolicySpecRule, RoutePolicySpecRuleService},
    Hub, ObjectMeta, Resource, ResourceExt, Route, RoutePolicy, RouteSpec, Service,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Generates the routes for `policies`.
///
/// `services` lists the services on an export hub. Routes are returned
/// ordered and deduplicated by name.
pub fn routes<F>(policies: &[RoutePolicy], services: F) -> Vec<Route>
where
    F: Fn(&str) -> Vec<Service>,
{
    let mut routes = BTreeMap::new();
    for policy in policies {
        for route in policy_routes(policy, &services) {
            routes.insert(route.name_any(), route);
        }
    }
    routes.into_values().collect()
}

/// Generates one route per non-control-plane hub that mirrors the hub's tunnel
/// service into the control-plane hub.
pub fn mirror_tunnel_routes(
    namespace: &str,
    hubs: &[Hub],
    control_plane_hub: &str,
    tunnel_namespace: &str,
    tunnel_service: &str,
) -> Vec<Route> {
    if !hubs.iter().any(|h| h.name_any() == control_plane_hub) {
        return Vec::new();
    }

    hubs.iter()
        .filter(|hub| hub.name_any() != control_plane_hub)
        .map(|hub| {
            let name = hub.name_any();
            let mut labels = generated_labels(None);
            labels.insert(
                labels::GENERATED.to_string(),
                labels::GENERATED_TUNNEL.to_string(),
            );
            Route {
                metadata: ObjectMeta {
                    namespace: Some(namespace.to_string()),
                    name: Some(format!("{name}-mirror-tunnel")),
                    labels: Some(labels),
                    owner_references: hub.controller_owner_ref(&()).map(|r| vec![r]),
                    ..Default::default()
                },
                spec: RouteSpec {
                    export: RouteSpecRule::new(&name, tunnel_namespace, tunnel_service),
                    import: RouteSpecRule::new(
                        control_plane_hub,
                        tunnel_namespace,
                        format!("{name}-{tunnel_service}"),
                    ),
                },
                status: None,
            }
        })
        .collect()
}

/// Names a generated route so that it is stable across passes.
pub fn route_name(policy: &str, export: &RouteSpecRule, import: &RouteSpecRule) -> String {
    let key = [
        export.hub_name.as_str(),
        export.service.namespace.as_str(),
        export.service.name.as_str(),
        import.hub_name.as_str(),
        import.service.namespace.as_str(),
        import.service.name.as_str(),
    ]
    .join("|");
    let digest = Sha256::digest(key.as_bytes());
    let hash = hex::encode(digest);
    format!("{policy}-{}", &hash[..12])
}

fn policy_routes<F>(policy: &RoutePolicy, services: &F) -> Vec<Route>
where
    F: Fn(&str) -> Vec<Service>,
{
    let policy_name = policy.name_any();

    // Group rule pairs by export hub so each hub's services are listed once.
    let mut pairs = BTreeMap::<&str, Vec<(&RoutePolicySpecRule, &RoutePolicySpecRule)>>::new();
    for export in &policy.spec.exports {
        for import in &policy.spec.imports {
            if export.hub_name.is_empty()
                || import.hub_name.is_empty()
                || export.hub_name == import.hub_name
            {
                continue;
            }
            pairs.entry(&export.hub_name).or_default().push((export, import));
        }
    }

    let mut routes = Vec::new();
    for (export_hub, pairs) in pairs {
        let svcs = services(export_hub);
        for svc in &svcs {
            for (export, import) in &pairs {
                let Some(spec) = bind(export, import, svc) else {
                    continue;
                };
                routes.push(generated_route(policy, &policy_name, spec));
            }
        }
    }
    routes
}

/// Matches one rule pair against `svc`, returning the resulting route spec.
fn bind(
    export: &RoutePolicySpecRule,
    import: &RoutePolicySpecRule,
    svc: &Service,
) -> Option<RouteSpec> {
    let mut e = export.service.clone();
    let mut i = import.service.clone();
    mirror(&mut e.name, &mut i.name);
    mirror(&mut e.namespace, &mut i.namespace);

    let svc_ns = svc.namespace().unwrap_or_default();
    let svc_name = svc.name_any();

    let selector = Selector::from_map(e.labels.clone()).merge(&i.labels);
    if !selector.is_empty() && e.name.is_empty() {
        if !e.namespace.is_empty() && e.namespace != svc_ns {
            return None;
        }
        if !selector.matches(&Labels::from(svc.labels().clone())) {
            return None;
        }
        e.namespace = svc_ns;
        e.name = svc_name;
    } else {
        if e.namespace.is_empty() || e.namespace != svc_ns {
            return None;
        }
        if e.name.is_empty() {
            e.name = svc_name;
        } else if e.name != svc_name {
            return None;
        }
    }

    if i.name.is_empty() {
        i.name.clone_from(&e.name);
    }
    if i.namespace.is_empty() {
        i.namespace.clone_from(&e.namespace);
    }

    Some(RouteSpec {
        export: rule(&export.hub_name, e),
        import: rule(&import.hub_name, i),
    })
}

/// Fills whichever side is empty from the other.
fn mirror(export: &mut String, import: &mut String) {
    if export.is_empty() && !import.is_empty() {
        export.clone_from(import);
    } else if import.is_empty() && !export.is_empty() {
        import.clone_from(export);
    }
}

fn rule(hub: &str, svc: RoutePolicySpecRuleService) -> RouteSpecRule {
    RouteSpecRule::new(hub, svc.namespace, svc.name)
}

fn generated_route(policy: &RoutePolicy, policy_name: &str, spec: RouteSpec) -> Route {
    let mut labels = generated_labels(policy.meta().labels.as_ref());
    labels.insert(
        labels::GENERATED.to_string(),
        labels::GENERATED_ROUTE.to_string(),
    );
    Route {
        metadata: ObjectMeta {
            namespace: policy.namespace(),
            name: Some(route_name(policy_name, &spec.export, &spec.import)),
            labels: Some(labels),
            owner_references: policy.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

fn generated_labels(inherited: Option<&labels::Map>) -> labels::Map {
    let mut labels = inherited.cloned().unwrap_or_default();
    labels.insert(
        labels::GENERATED_BY.to_string(),
        labels::GENERATED_BY_FERRY.to_string(),
    );
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_controller_k8s_api::{HubSpec, RoutePolicySpec};
    use maplit::{btreemap, hashmap};
    use pretty_assertions::assert_eq;

    fn svc(ns: &str, name: &str, app: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                labels: Some(btreemap! { "app".to_string() => app.to_string() }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn policy(
        name: &str,
        exports: Vec<RoutePolicySpecRule>,
        imports: Vec<RoutePolicySpecRule>,
    ) -> RoutePolicy {
        let mut policy = RoutePolicy::new(name, RoutePolicySpec { exports, imports });
        policy.metadata.namespace = Some("ferry-system".to_string());
        policy
    }

    fn specs(routes: &[Route]) -> Vec<(String, String)> {
        routes
            .iter()
            .map(|r| (r.spec.export.to_string(), r.spec.import.to_string()))
            .collect()
    }

    fn lookup(
        services: std::collections::HashMap<&'static str, Vec<Service>>,
    ) -> impl Fn(&str) -> Vec<Service> {
        move |hub| services.get(hub).cloned().unwrap_or_default()
    }

    #[test]
    fn label_selected_export() {
        let services = lookup(hashmap! {
            "export-1" => vec![
                svc("default", "app-1", "app-1"),
                svc("default", "app-2", "app-2"),
                svc("test", "app-1", "app-1"),
            ],
        });
        let policies = [policy(
            "policy-1",
            vec![RoutePolicySpecRule::hub("export-1")
                .labels([("app".to_string(), "app-1".to_string())])],
            vec![RoutePolicySpecRule::hub("import-1")],
        )];

        let mut generated = specs(&routes(&policies, services));
        generated.sort();
        assert_eq!(
            generated,
            vec![
                (
                    "export-1.default/app-1".to_string(),
                    "import-1.default/app-1".to_string()
                ),
                (
                    "export-1.test/app-1".to_string(),
                    "import-1.test/app-1".to_string()
                ),
            ]
        );
    }

    #[test]
    fn explicit_service_mirrors_onto_import() {
        let services = lookup(hashmap! {
            "export-1" => vec![svc("default", "app-1", "x"), svc("default", "app-2", "x")],
        });
        let policies = [policy(
            "policy-1",
            vec![RoutePolicySpecRule::hub("export-1").service("default", "app-1")],
            vec![RoutePolicySpecRule::hub("import-1").service("", "renamed")],
        )];

        assert_eq!(
            specs(&routes(&policies, &services)),
            vec![(
                "export-1.default/app-1".to_string(),
                "import-1.default/renamed".to_string()
            )]
        );

        // An import name is mirrored onto an unnamed export.
        let policies = [policy(
            "policy-1",
            vec![RoutePolicySpecRule::hub("export-1").service("default", "")],
            vec![RoutePolicySpecRule::hub("import-1").service("mirror", "app-2")],
        )];
        assert_eq!(
            specs(&routes(&policies, &services)),
            vec![(
                "export-1.default/app-2".to_string(),
                "import-1.mirror/app-2".to_string()
            )]
        );
    }

    #[test]
    fn namespace_only_export_binds_every_service() {
        let services = lookup(hashmap! {
            "export-1" => vec![svc("default", "app-1", "x"), svc("default", "app-2", "y"), svc("test", "app-3", "z")],
        });
        let policies = [policy(
            "policy-1",
            vec![RoutePolicySpecRule::hub("export-1").service("default", "")],
            vec![RoutePolicySpecRule::hub("import-1")],
        )];
        assert_eq!(routes(&policies, &services).len(), 2);
    }

    #[test]
    fn rules_without_namespace_or_selector_match_nothing() {
        let services = lookup(hashmap! {
            "export-1" => vec![svc("default", "app-1", "x")],
        });
        let policies = [policy(
            "policy-1",
            vec![RoutePolicySpecRule::hub("export-1")],
            vec![RoutePolicySpecRule::hub("import-1")],
        )];
        assert!(routes(&policies, &services).is_empty());
    }

    #[test]
    fn same_hub_pairs_are_skipped() {
        let services = lookup(hashmap! {
            "hub-1" => vec![svc("default", "app-1", "x")],
        });
        let policies = [policy(
            "policy-1",
            vec![RoutePolicySpecRule::hub("hub-1").service("default", "app-1")],
            vec![RoutePolicySpecRule::hub("hub-1")],
        )];
        assert!(routes(&policies, &services).is_empty());
    }

    #[test]
    fn generated_routes_are_labelled_and_stable() {
        let services = lookup(hashmap! {
            "export-1" => vec![svc("default", "app-1", "x")],
        });
        let mut p = policy(
            "policy-1",
            vec![RoutePolicySpecRule::hub("export-1").service("default", "app-1")],
            vec![RoutePolicySpecRule::hub("import-1")],
        );
        p.metadata.labels = Some(btreemap! { "team".to_string() => "a".to_string() });

        let first = routes(std::slice::from_ref(&p), &services);
        let second = routes(std::slice::from_ref(&p), &services);
        assert_eq!(first, second);

        let route = &first[0];
        let name = route.name_any();
        assert!(name.starts_with("policy-1-"));
        assert_eq!(name.len(), "policy-1-".len() + 12);
        assert_eq!(route.namespace().as_deref(), Some("ferry-system"));
        assert_eq!(route.labels().get("team").map(String::as_str), Some("a"));
        assert_eq!(
            route.labels().get(labels::GENERATED_BY).map(String::as_str),
            Some(labels::GENERATED_BY_FERRY)
        );
        assert_eq!(
            route.labels().get(labels::GENERATED).map(String::as_str),
            Some(labels::GENERATED_ROUTE)
        );
    }

    #[test]
    fn route_names_depend_on_every_field() {
        let export = RouteSpecRule::new("export-1", "default", "app-1");
        let import = RouteSpecRule::new("import-1", "default", "app-1");
        let name = route_name("p", &export, &import);
        // sha256("export-1|default|app-1|import-1|default|app-1")
        assert_eq!(name, "p-cd2f4ea8a90c");
        assert_ne!(
            name,
            route_name("p", &export, &RouteSpecRule::new("import-2", "default", "app-1"))
        );
        assert_ne!(name, route_name("p", &import, &export));
    }

    #[test]
    fn mirrors_every_tunnel_into_control_plane() {
        let hubs = ["control-plane", "cluster-1", "cluster-2"]
            .into_iter()
            .map(|name| Hub::new(name, HubSpec::default()))
            .collect::<Vec<_>>();

        let routes = mirror_tunnel_routes(
            "ferry-system",
            &hubs,
            "control-plane",
            "ferry-tunnel-system",
            "ferry-tunnel",
        );
        let names = routes.iter().map(|r| r.name_any()).collect::<Vec<_>>();
        assert_eq!(names, ["cluster-1-mirror-tunnel", "cluster-2-mirror-tunnel"]);
        assert_eq!(
            routes[0].spec.export.to_string(),
            "cluster-1.ferry-tunnel-system/ferry-tunnel"
        );
        assert_eq!(
            routes[0].spec.import.to_string(),
            "control-plane.ferry-tunnel-system/cluster-1-ferry-tunnel"
        );
        assert_eq!(
            routes[0].labels().get(labels::GENERATED).map(String::as_str),
            Some(labels::GENERATED_TUNNEL)
        );

        assert!(mirror_tunnel_routes(
            "ferry-system",
            &hubs[1..],
            "control-plane",
            "ferry-tunnel-system",
            "ferry-tunnel",
        )
        .is_empty());
    }
}
