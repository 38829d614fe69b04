//! Translates MCS `ServiceExport`/`ServiceImport` pairs into `RoutePolicy` objects.

use ferry_controller_k8s_api::{
    labels, route_policy::RoutePolicySpecRule, ObjectMeta, ResourceExt, RoutePolicy,
    RoutePolicySpec, ServiceExport, ServiceImport,
};
use std::collections::{BTreeMap, BTreeSet};

/// Name prefix of every policy bridged from MCS.
pub const POLICY_PREFIX: &str = "mcs";

type Hubs = BTreeSet<String>;

/// Builds one policy per service that is both exported and imported by some
/// hubs, with hubs ordered by name.
///
/// `exports` and `imports` map hub names to the resources observed on them.
pub fn policies(
    namespace: &str,
    exports: &BTreeMap<String, Vec<ServiceExport>>,
    imports: &BTreeMap<String, Vec<ServiceImport>>,
) -> Vec<RoutePolicy> {
    let exported = by_service(exports);
    let imported = by_service(imports);

    exported
        .iter()
        .filter_map(|(svc, export_hubs)| {
            let import_hubs = imported.get(svc)?;
            Some(policy(namespace, svc, export_hubs, import_hubs))
        })
        .collect()
}

pub fn policy_name(namespace: &str, name: &str) -> String {
    format!("{POLICY_PREFIX}-{namespace}-{name}")
}

fn by_service<T: ResourceExt>(by_hub: &BTreeMap<String, Vec<T>>) -> BTreeMap<(String, String), Hubs> {
    let mut services = BTreeMap::<_, Hubs>::new();
    for (hub, objs) in by_hub {
        for obj in objs {
            let svc = (obj.namespace().unwrap_or_default(), obj.name_any());
            services.entry(svc).or_default().insert(hub.clone());
        }
    }
    services
}

fn policy(
    namespace: &str,
    (svc_ns, svc_name): &(String, String),
    export_hubs: &Hubs,
    import_hubs: &Hubs,
) -> RoutePolicy {
    let rules = |hubs: &Hubs| {
        hubs.iter()
            .map(|hub| RoutePolicySpecRule::hub(hub).service(svc_ns, svc_name))
            .collect::<Vec<_>>()
    };

    RoutePolicy {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(policy_name(svc_ns, svc_name)),
            labels: Some(
                std::iter::once((
                    labels::GENERATED_BY.to_string(),
                    labels::GENERATED_BY_FERRY.to_string(),
                ))
                .collect(),
            ),
            ..Default::default()
        },
        spec: RoutePolicySpec {
            exports: rules(export_hubs),
            imports: rules(import_hubs),
        },
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_controller_k8s_api::mcs::{ServiceExportSpec, ServiceImportSpec};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn meta(ns: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn export(ns: &str, name: &str) -> ServiceExport {
        ServiceExport {
            metadata: meta(ns, name),
            spec: ServiceExportSpec {},
        }
    }

    fn import(ns: &str, name: &str) -> ServiceImport {
        ServiceImport {
            metadata: meta(ns, name),
            spec: ServiceImportSpec::default(),
        }
    }

    #[test]
    fn bridges_matching_pairs() {
        let exports = btreemap! {
            "cluster-1".to_string() => vec![export("default", "app-1"), export("default", "only-exported")],
        };
        let imports = btreemap! {
            "control-plane".to_string() => vec![import("default", "app-1")],
            "cluster-2".to_string() => vec![import("default", "app-1"), import("default", "only-imported")],
        };

        let policies = policies("ferry-system", &exports, &imports);
        assert_eq!(policies.len(), 1);

        let policy = &policies[0];
        assert_eq!(policy.name_any(), "mcs-default-app-1");
        assert_eq!(policy.namespace().as_deref(), Some("ferry-system"));
        assert_eq!(
            policy.labels().get(labels::GENERATED_BY).map(String::as_str),
            Some(labels::GENERATED_BY_FERRY)
        );
        assert_eq!(
            policy.spec,
            RoutePolicySpec {
                exports: vec![RoutePolicySpecRule::hub("cluster-1").service("default", "app-1")],
                imports: vec![
                    RoutePolicySpecRule::hub("cluster-2").service("default", "app-1"),
                    RoutePolicySpecRule::hub("control-plane").service("default", "app-1"),
                ],
            }
        );
    }

    #[test]
    fn disappearing_side_drops_policy() {
        let exports = btreemap! {
            "cluster-1".to_string() => vec![export("default", "app-1")],
        };
        assert!(policies("ferry-system", &exports, &BTreeMap::new()).is_empty());
        assert!(policies("ferry-system", &BTreeMap::new(), &BTreeMap::new()).is_empty());
    }

    #[test]
    fn hubs_are_sorted_and_deduplicated() {
        let exports = btreemap! {
            "b".to_string() => vec![export("ns", "svc")],
            "a".to_string() => vec![export("ns", "svc"), export("ns", "svc")],
        };
        let imports = btreemap! {
            "c".to_string() => vec![import("ns", "svc")],
        };
        let policies = policies("ferry-system", &exports, &imports);
        let hubs = policies[0]
            .spec
            .exports
            .iter()
            .map(|r| r.hub_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(hubs, ["a", "b"]);
    }
}
