//! An in-memory API server behind a mocked kube client, for reconciler tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Default)]
struct Inner {
    /// Objects by collection path, then by name
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    calls: Vec<String>,
}

/// Serves get, list, apply and delete of namespaced objects and records each call as
/// `METHOD plural/name`, e.g. `PATCH services/dataplane-ingress-edge` or `LIST secrets`.
#[derive(Clone, Default)]
pub struct InMemoryApiServer {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryApiServer {
    /// A client whose requests are answered by a fresh server running on the test runtime.
    pub fn start() -> (Client, InMemoryApiServer) {
        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let server = InMemoryApiServer::default();
        let serving = server.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let response = serving.handle(request).await;
                send.send_response(response);
            }
        });
        (Client::new(mock_service, "default"), server)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let collection = K::url_path(&(), obj.meta().namespace.as_deref());
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut value = serde_json::to_value(obj).unwrap();
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        self.lock()
            .collections
            .entry(collection)
            .or_default()
            .insert(name, value);
    }

    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let collection = K::url_path(&(), Some(namespace));
        self.lock()
            .collections
            .get(&collection)
            .and_then(|c| c.get(name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Names of the stored objects of kind `K` in `namespace`.
    pub fn names<K>(&self, namespace: &str) -> Vec<String>
    where
        K: Resource<DynamicType = ()>,
    {
        let collection = K::url_path(&(), Some(namespace));
        self.lock()
            .collections
            .get(&collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// The calls that changed something.
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("PATCH ") || c.starts_with("DELETE "))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();
        let query = request.uri().query().unwrap_or_default().to_owned();
        let body = request.into_body().collect_bytes().await.unwrap();

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let Some(ns_index) = segments
            .iter()
            .position(|s| *s == "namespaces")
            .filter(|i| segments.len() >= i + 3)
        else {
            return status(StatusCode::NOT_FOUND, "only namespaced collections are served");
        };
        // namespaces/{ns}/{plural}[/{name}[/status]]
        let rest = &segments[ns_index + 2..];
        let collection = segments[..ns_index + 3].join("/");
        let collection = format!("/{collection}");

        let mut inner = self.lock();
        match (method, rest) {
            (Method::GET, [plural]) => {
                inner.calls.push(format!("LIST {plural}"));
                let selector = url::form_urlencoded::parse(query.as_bytes())
                    .find(|(k, _)| k == "labelSelector")
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default();
                let items: Vec<Value> = inner
                    .collections
                    .get(&collection)
                    .into_iter()
                    .flat_map(|c| c.values())
                    .filter(|obj| matches_selector(obj, &selector))
                    .cloned()
                    .collect();
                ok(&json!({
                    "apiVersion": "v1",
                    "kind": "List",
                    "metadata": {},
                    "items": items,
                }))
            }
            (Method::GET, [plural, name]) => {
                inner.calls.push(format!("GET {plural}/{name}"));
                match inner.collections.get(&collection).and_then(|c| c.get(*name)) {
                    Some(obj) => ok(obj),
                    None => status(StatusCode::NOT_FOUND, &format!("{plural} {name} not found")),
                }
            }
            (Method::PATCH, [plural, name]) => {
                inner.calls.push(format!("PATCH {plural}/{name}"));
                let applied: Value = serde_json::from_slice(&body).unwrap();
                inner
                    .collections
                    .entry(collection)
                    .or_default()
                    .insert((*name).to_owned(), applied.clone());
                ok(&applied)
            }
            (Method::PATCH, [plural, name, "status"]) => {
                inner.calls.push(format!("PATCH {plural}/{name}/status"));
                let applied: Value = serde_json::from_slice(&body).unwrap();
                let precondition = &applied["metadata"]["resourceVersion"];
                match inner.collections.get_mut(&collection).and_then(|c| c.get_mut(*name)) {
                    Some(obj)
                        if !precondition.is_null()
                            && obj["metadata"]["resourceVersion"] != *precondition =>
                    {
                        status(StatusCode::CONFLICT, &format!("{plural} {name} has been modified"))
                    }
                    Some(obj) => {
                        obj["status"] = applied["status"].clone();
                        ok(obj)
                    }
                    None => status(StatusCode::NOT_FOUND, &format!("{plural} {name} not found")),
                }
            }
            (Method::DELETE, [plural, name]) => {
                inner.calls.push(format!("DELETE {plural}/{name}"));
                match inner.collections.get_mut(&collection).and_then(|c| c.remove(*name)) {
                    Some(obj) => ok(&obj),
                    None => status(StatusCode::NOT_FOUND, &format!("{plural} {name} not found")),
                }
            }
            (method, _) => status(
                StatusCode::METHOD_NOT_ALLOWED,
                &format!("{method} {path} is not served"),
            ),
        }
    }
}

/// Equality-based selectors only, which is all the reconcilers use.
fn matches_selector(obj: &Value, selector: &str) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels[key] == value,
            None => !labels[term].is_null(),
        })
}

fn ok(value: &Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(serde_json::to_vec(value).unwrap()))
        .unwrap()
}

fn status(code: StatusCode, message: &str) -> Response<Body> {
    let body = json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": code.canonical_reason().unwrap_or_default(),
        "code": code.as_u16(),
    });
    Response::builder()
        .status(code)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{Api, ListParams};

    #[tokio::test]
    async fn lists_filter_by_label() {
        let (client, server) = InMemoryApiServer::start();
        let mut labelled = ConfigMap::default();
        labelled.metadata.name = Some("a".into());
        labelled.metadata.namespace = Some("ns".into());
        labelled.metadata.labels = Some(BTreeMap::from([("app".into(), "x".into())]));
        let mut other = labelled.clone();
        other.metadata.name = Some("b".into());
        other.metadata.labels = None;
        server.insert(&labelled);
        server.insert(&other);

        let api: Api<ConfigMap> = Api::namespaced(client, "ns");
        let found = api.list(&ListParams::default().labels("app=x")).await.unwrap();
        assert_eq!(found.items.len(), 1);
        assert!(api.get_opt("missing").await.unwrap().is_none());
        assert_eq!(server.calls(), vec!["LIST configmaps", "GET configmaps/missing"]);
    }
}
