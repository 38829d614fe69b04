use ferry_controller_k8s_api::{
    self as k8s, labels, Api, Client, ConfigMap, DeleteParams, Endpoints, Labels,
    NamespaceResourceScope, PostParams, Resource, ResourceExt, Route, RoutePolicy, Service,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} exists and is not managed by ferry")]
    NotManaged {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("hub {0} is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Kube(#[from] k8s::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// An object the controller writes into a hub.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Whether an existing object must carry the managed-by label before it
    /// may be overwritten.
    const REQUIRES_MANAGED: bool = false;

    /// Compares the fields the controller owns.
    fn same_content(&self, other: &Self) -> bool;

    /// Carries server-assigned fields from `existing` into an update.
    fn prepare_update(&mut self, _existing: &Self) {}
}

pub fn is_not_found(error: &k8s::Error) -> bool {
    matches!(error, k8s::Error::Api(rsp) if rsp.code == 404)
}

/// Creates `obj` or, when its content differs, replaces the existing object.
pub async fn apply<K: Object>(client: &Client, obj: &K) -> Result<Applied, StoreError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let api = Api::<K>::namespaced(client.clone(), &namespace);

    let existing = match api.get_opt(&name).await? {
        Some(existing) => existing,
        None => {
            api.create(&PostParams::default(), obj).await?;
            tracing::debug!(kind = %K::kind(&()), %namespace, %name, "Created");
            return Ok(Applied::Created);
        }
    };

    if K::REQUIRES_MANAGED && !Labels::from(existing.labels().clone()).is_managed() {
        return Err(StoreError::NotManaged {
            kind: K::kind(&()).to_string(),
            namespace,
            name,
        });
    }
    if existing.same_content(obj) {
        return Ok(Applied::Unchanged);
    }

    let mut obj = obj.clone();
    obj.prepare_update(&existing);
    obj.meta_mut().resource_version = existing.resource_version();
    api.replace(&name, &PostParams::default(), &obj).await?;
    tracing::debug!(kind = %K::kind(&()), %namespace, %name, "Updated");
    Ok(Applied::Updated)
}

/// Deletes `obj`, returning false if it did not exist.
pub async fn delete<K: Object>(client: &Client, obj: &K) -> Result<bool, StoreError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let api = Api::<K>::namespaced(client.clone(), &namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {
            tracing::debug!(kind = %K::kind(&()), %namespace, %name, "Deleted");
            Ok(true)
        }
        Err(error) if is_not_found(&error) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn same_labels<K: ResourceExt>(a: &K, b: &K) -> bool {
    a.labels() == b.labels()
}

// === impl ConfigMap ===

impl Object for ConfigMap {
    fn same_content(&self, other: &Self) -> bool {
        same_labels(self, other) && self.data == other.data
    }
}

// === impl Service ===

impl Object for Service {
    const REQUIRES_MANAGED: bool = true;

    fn same_content(&self, other: &Self) -> bool {
        fn ports(svc: &Service) -> Vec<(i32, String)> {
            let mut ports = svc
                .spec
                .iter()
                .flat_map(|spec| spec.ports.iter().flatten())
                .map(|p| {
                    let target = match &p.target_port {
                        Some(k8s::IntOrString::Int(port)) => port.to_string(),
                        Some(k8s::IntOrString::String(port)) => port.clone(),
                        None => p.port.to_string(),
                    };
                    (p.port, target)
                })
                .collect::<Vec<_>>();
            ports.sort();
            ports
        }

        same_labels(self, other) && ports(self) == ports(other)
    }

    fn prepare_update(&mut self, existing: &Self) {
        if let (Some(spec), Some(current)) = (self.spec.as_mut(), existing.spec.as_ref()) {
            spec.cluster_ip.clone_from(&current.cluster_ip);
            spec.cluster_ips.clone_from(&current.cluster_ips);
        }
    }
}

// === impl Endpoints ===

impl Object for Endpoints {
    const REQUIRES_MANAGED: bool = true;

    fn same_content(&self, other: &Self) -> bool {
        same_labels(self, other) && self.subsets == other.subsets
    }
}

// === impl Route ===

impl Object for Route {
    fn same_content(&self, other: &Self) -> bool {
        same_labels(self, other)
            && self.spec == other.spec
            && self.metadata.owner_references == other.metadata.owner_references
    }
}

// === impl RoutePolicy ===

impl Object for RoutePolicy {
    fn same_content(&self, other: &Self) -> bool {
        same_labels(self, other) && self.spec == other.spec
    }
}

macro_rules! projected {
    ($($kind:ty),+) => {
        $(
            impl crate::Projected for $kind {
                fn uniq_name(&self) -> String {
                    format!(
                        "{}/{}/{}",
                        <$kind as Resource>::kind(&()),
                        self.namespace().unwrap_or_default(),
                        self.name_any()
                    )
                }

                fn same_content(&self, other: &Self) -> bool {
                    Object::same_content(self, other)
                }
            }
        )+
    };
}

projected!(Route, RoutePolicy);

/// Returns the labels every object written by the controller carries.
pub fn managed_labels() -> labels::Map {
    std::iter::once((
        labels::MANAGED_BY.to_string(),
        labels::MANAGED_BY_FERRY.to_string(),
    ))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use ferry_controller_k8s_api::{ObjectMeta, ServicePort, ServiceSpec};

    fn svc(ports: &[(i32, i32)], cluster_ip: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("app-1".to_string()),
                labels: Some(managed_labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(Into::into),
                ports: Some(
                    ports
                        .iter()
                        .map(|&(port, target)| ServicePort {
                            port,
                            target_port: Some(k8s::IntOrString::Int(target)),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_content_ignores_server_fields() {
        let desired = svc(&[(80, 10001), (443, 10002)], None);
        let existing = svc(&[(443, 10002), (80, 10001)], Some("10.96.0.12"));
        assert!(desired.same_content(&existing));

        let moved = svc(&[(80, 10003), (443, 10002)], None);
        assert!(!moved.same_content(&existing));
    }

    #[test]
    fn service_update_keeps_cluster_ip() {
        let mut desired = svc(&[(80, 10003)], None);
        desired.prepare_update(&svc(&[(80, 10001)], Some("10.96.0.12")));
        assert_eq!(
            desired.spec.unwrap().cluster_ip.as_deref(),
            Some("10.96.0.12")
        );
    }

    const SVC_PATH: &str = "/api/v1/namespaces/default/services/app-1";

    #[tokio::test(start_paused = true)]
    async fn unmanaged_services_are_not_replaced() {
        let mut existing = svc(&[(80, 8080)], Some("10.96.0.12"));
        existing.metadata.labels = None;
        let (client, requests) = mock::client(move |method, _, _| {
            (method == http::Method::GET).then(|| mock::json(200, &existing))
        });

        let error = apply(&client, &svc(&[(80, 10001)], None))
            .await
            .expect_err("must not overwrite an unmanaged service");
        assert!(
            matches!(
                &error,
                StoreError::NotManaged { kind, namespace, name }
                    if kind == "Service" && namespace == "default" && name == "app-1"
            ),
            "{error}"
        );

        let sent = requests
            .lock()
            .iter()
            .map(|(method, path, _)| (method.clone(), path.clone()))
            .collect::<Vec<_>>();
        assert_eq!(sent, [(http::Method::GET, SVC_PATH.to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn managed_services_are_replaced_at_their_version() {
        let mut existing = svc(&[(80, 8080)], Some("10.96.0.12"));
        existing.metadata.resource_version = Some("12".to_string());
        let (client, requests) = mock::client(move |method, _, _| {
            [http::Method::GET, http::Method::PUT]
                .contains(method)
                .then(|| mock::json(200, &existing))
        });

        let applied = apply(&client, &svc(&[(80, 10001)], None)).await.unwrap();
        assert_eq!(applied, Applied::Updated);

        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        let (method, path, body) = &requests[1];
        assert_eq!((method, path.as_str()), (&http::Method::PUT, SVC_PATH));
        let sent: Service = serde_json::from_slice(body).unwrap();
        assert_eq!(sent.metadata.resource_version.as_deref(), Some("12"));
        assert_eq!(
            sent.spec.unwrap().cluster_ip.as_deref(),
            Some("10.96.0.12")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_missing_object_is_not_an_error() {
        let (client, requests) = mock::client(|method, _, _| {
            (method == http::Method::DELETE).then(|| mock::failure(404, "NotFound"))
        });

        let deleted = delete(&client, &svc(&[(80, 10001)], None)).await.unwrap();
        assert!(!deleted);
        assert_eq!(requests.lock()[0].1, SVC_PATH);
    }

    #[test]
    fn managed_kinds() {
        assert!(<Service as Object>::REQUIRES_MANAGED);
        assert!(<Endpoints as Object>::REQUIRES_MANAGED);
        assert!(!<ConfigMap as Object>::REQUIRES_MANAGED);
        assert!(managed_labels().contains_key(labels::MANAGED_BY));
    }
}
