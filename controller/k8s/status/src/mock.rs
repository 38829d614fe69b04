//! A `kube::Client` whose API server is a closure.

use bytes::Bytes;
use http_body_util::BodyExt;
use kube::client::Body;
use parking_lot::Mutex;
use serde::Serialize;
use std::{convert::Infallible, sync::Arc};

/// Every request served so far, as `(method, path, body)`.
pub(crate) type Requests = Arc<Mutex<Vec<(http::Method, String, Bytes)>>>;

/// Builds a client whose requests are answered by `respond`. Requests for
/// which `respond` returns `None` never complete.
pub(crate) fn client<F>(respond: F) -> (kube::Client, Requests)
where
    F: Fn(&http::Method, &str, &[u8]) -> Option<http::Response<Body>> + Send + Sync + 'static,
{
    let respond = Arc::new(respond);
    let requests = Requests::default();
    let log = requests.clone();
    let service = tower::service_fn(move |req: http::Request<Body>| {
        let respond = respond.clone();
        let log = log.clone();
        async move {
            let (parts, body) = req.into_parts();
            let body = body
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            let path = parts.uri.path().to_string();
            let rsp = respond(&parts.method, &path, &body);
            log.lock().push((parts.method, path, body));
            match rsp {
                Some(rsp) => Ok::<_, Infallible>(rsp),
                None => std::future::pending().await,
            }
        }
    });
    (kube::Client::new(service, "default"), requests)
}

pub(crate) fn json(status: u16, body: &impl Serialize) -> http::Response<Body> {
    http::Response::builder()
        .status(status)
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// A `metav1.Status` failure.
pub(crate) fn failure(code: u16, reason: &str) -> http::Response<Body> {
    json(
        code,
        &serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "reason": reason,
            "code": code,
        }),
    )
}
