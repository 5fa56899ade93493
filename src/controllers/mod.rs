use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{Service, ServiceSpec, ServiceStatus};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::*;

use crate::konnect::http::HttpKonnectApiFactory;
use crate::Metrics;

pub mod dataplane;
pub mod konnect;
pub mod konnectextension;
#[cfg(test)]
pub(crate) mod testing;

/// Field manager and event reporter name
pub const MANAGER: &str = "gateway-operator";

/// Set to [`MANAGER`] on every object the operator creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Image of the proxy container when a DataPlane does not set one
    pub default_dataplane_image: String,
    /// How often converged Konnect entities are compared with Konnect again
    pub konnect_sync_period: Duration,
    /// Deadline of a single Konnect API call
    pub konnect_request_timeout: Duration,
    /// Reconciles running at once per controller
    pub controller_concurrency: u16,
    /// Whether the Konnect controllers run at all
    pub konnect_enabled: bool,
}

impl Default for State {
    fn default() -> Self {
        Self::new(
            "kong/kong-gateway:3.9".into(),
            Duration::from_secs(60),
            Duration::from_secs(30),
            4,
            true,
        )
    }
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(
        default_dataplane_image: String,
        konnect_sync_period: Duration,
        konnect_request_timeout: Duration,
        controller_concurrency: u16,
        konnect_enabled: bool,
    ) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            default_dataplane_image,
            konnect_sync_period,
            konnect_request_timeout,
            controller_concurrency,
            konnect_enabled,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create kube Client: {e:?}");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Failed to register metrics: {e:?}");
            std::process::exit(1);
        }
    };

    let dataplanes = dataplane::run(client.clone(), metrics.clone(), state.clone());
    if !state.konnect_enabled {
        info!("Konnect integration is disabled");
        dataplanes.await;
        return;
    }

    let konnect_api = match HttpKonnectApiFactory::new(state.konnect_request_timeout) {
        Ok(factory) => factory,
        Err(e) => {
            error!("Failed to create the Konnect HTTP client: {e:?}");
            std::process::exit(1);
        }
    };
    tokio::join!(dataplanes, konnect::run(client, metrics, state, konnect_api));
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
pub(crate) fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

pub(crate) fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    // ignore status
    Some(hasher.finish())
}

/// Child objects whose status is read back by a reconciler.
pub(crate) trait ObservedStatus {
    type Status;

    fn observed_status(&self) -> Option<&Self::Status>;
}

impl ObservedStatus for Deployment {
    type Status = DeploymentStatus;

    fn observed_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl ObservedStatus for Service {
    type Status = ServiceStatus;

    fn observed_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

pub(crate) fn status_predicate_serde<K: Resource + ObservedStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.observed_status() {
        serde_hashkey::to_key(s)
            .expect("serde_hashkey never to return an error")
            .hash(&mut hasher);
    }
    Some(hasher.finish())
}

/// Server-side apply body for the status of `obj`. It carries the resourceVersion the status was
/// computed from, so a write based on a stale read fails with a conflict and is retried.
pub(crate) fn status_patch<K>(obj: &K, status: &impl Serialize) -> Value
where
    K: Resource<DynamicType = ()>,
{
    let mut patch = json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "status": status,
    });
    if let Some(version) = obj.resource_version() {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    patch
}

/// Services have no generation, so their spec is hashed instead.
pub(crate) fn service_spec_predicate(obj: &Service) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    let spec: &Option<ServiceSpec> = &obj.spec;
    serde_hashkey::to_key(spec)
        .expect("serde_hashkey never to return an error")
        .hash(&mut hasher);
    Some(hasher.finish())
}
