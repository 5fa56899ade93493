use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{metadata_watcher, reflector, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Resource,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::conditions::{reasons, set_condition, ConditionStatus, READY};
use crate::controllers::{
    changed_predicate, ensure_deletion_change, service_spec_predicate, status_patch,
    status_predicate_serde, Diagnostics, State, MANAGED_BY_LABEL, MANAGER,
};
use crate::resources::dataplanes::{
    Address, DataPlane, DataPlanePhase, DataPlaneSpec, DataPlaneStatus, DATAPLANE_FINALIZER,
};
use crate::resources::konnectextensions::{KonnectExtension, KonnectExtensionOutput};
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::certificate::reconcile_cluster_certificate;
use super::reconcilers::scaling::disruption_summary;
use super::reconcilers::synthesizer::{synthesize, SynthesisInput};
use super::reconcilers::{
    apply_if_changed, delete_child, delete_stale, selector_string, DATAPLANE_LABEL,
    INGRESS_SERVICE_TYPE, SERVICE_TYPE_LABEL,
};

const IP_ADDRESS: &str = "IPAddress";
const HOSTNAME: &str = "Hostname";
const PUBLIC_LOAD_BALANCER: &str = "PublicLoadBalancer";
const PRIVATE_LOAD_BALANCER: &str = "PrivateLoadBalancer";
const PRIVATE_IP: &str = "PrivateIP";

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    // Store for the Deployments we own, to find the ones left behind by renames
    pub deployments: Store<Deployment>,
    // Store for KonnectExtensions, None when the Konnect integration is disabled
    pub extensions: Option<Store<KonnectExtension>>,
    /// Image of the proxy container when the DataPlane does not set one
    pub default_image: String,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    fn new(
        client: Client,
        metrics: Metrics,
        state: &State,
        deployments: Store<Deployment>,
        extensions: Option<Store<KonnectExtension>>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, MANAGER.into()),
            deployments,
            extensions,
            default_image: state.default_dataplane_image.clone(),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, dp), fields(trace_id))]
async fn reconcile(dp: Arc<DataPlane>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<DataPlane>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = dp.namespace().unwrap_or_default();
    let dps: Api<DataPlane> = Api::namespaced(ctx.client.clone(), &namespace);

    info!("Reconciling DataPlane {namespace}/{}", dp.name_any());
    match finalizer(&dps, DATAPLANE_FINALIZER, dp.clone(), |event| async {
        match event {
            Finalizer::Apply(dp) => apply(dp, ctx.clone()).await,
            Finalizer::Cleanup(dp) => cleanup(dp, ctx.clone()).await,
        }
    })
    .await
    {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &dp.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(dp.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_dp: Arc<DataPlane>, err: &Error, _ctx: Arc<Context>) -> Action {
    // somebody else wrote the object in between, retry against fresh state
    if err.is_conflict() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

fn waiting(message: String) -> Error {
    Error::NotReady {
        message,
        reason: reasons::WAITING_TO_BECOME_READY.into(),
        requeue_after: None,
    }
}

/// What the KonnectExtension attached to `dp` contributes, if it has one.
///
/// A DataPlane may use at most one KonnectExtension and only from its own namespace. Any other
/// kind of extension is rejected.
pub(super) fn attached_extension(
    dp: &DataPlane,
    extensions: Option<&Store<KonnectExtension>>,
) -> Result<Option<KonnectExtensionOutput>> {
    let namespace = dp.namespace().unwrap_or_default();
    if let Some(unsupported) = dp
        .spec
        .extensions
        .iter()
        .flatten()
        .find(|e| !e.is_konnect_extension())
    {
        return Err(Error::InvalidDataPlaneSpec(format!(
            "extension {} of kind {}/{} is not supported",
            unsupported.name,
            unsupported.group.as_deref().unwrap_or_default(),
            unsupported.kind
        )));
    }

    let refs: Vec<(&str, &str)> = dp.konnect_extensions(&namespace).collect();
    let (ext_namespace, name) = match refs.as_slice() {
        [] => return Ok(None),
        [single] => *single,
        _ => {
            return Err(Error::InvalidDataPlaneSpec(
                "at most one KonnectExtension can be attached to a DataPlane".into(),
            ))
        }
    };
    if ext_namespace != namespace {
        return Err(Error::InvalidDataPlaneSpec(format!(
            "KonnectExtension {ext_namespace}/{name} must be in the DataPlane namespace {namespace}"
        )));
    }

    let Some(extensions) = extensions else {
        return Err(Error::NotReady {
            message: format!(
                "KonnectExtension {ext_namespace}/{name} cannot be used while the Konnect integration is disabled"
            ),
            reason: reasons::WAITING_TO_BECOME_READY.into(),
            requeue_after: Some(Duration::from_secs(5 * 60)),
        });
    };
    let ext = extensions
        .get(&ObjectRef::new(name).within(ext_namespace))
        .ok_or_else(|| waiting(format!("KonnectExtension {ext_namespace}/{name} does not exist")))?;
    KonnectExtensionOutput::from_extension(&ext)
        .map(Some)
        .ok_or_else(|| waiting(format!("KonnectExtension {ext_namespace}/{name} is not ready yet")))
}

fn uses_extension(dp: &DataPlane, namespace: &str, name: &str) -> bool {
    let dp_namespace = dp.namespace().unwrap_or_default();
    let uses = dp
        .konnect_extensions(&dp_namespace)
        .any(|(ns, n)| ns == namespace && n == name);
    uses
}

fn load_balancer_source(ip: &str) -> &'static str {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) if v4.is_private() || v4.is_loopback() => PRIVATE_LOAD_BALANCER,
        Ok(IpAddr::V6(v6)) if v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 => {
            PRIVATE_LOAD_BALANCER
        }
        _ => PUBLIC_LOAD_BALANCER,
    }
}

/// Load balancer addresses first, then the cluster IPs.
pub(super) fn service_addresses(service: &Service) -> Vec<Address> {
    let mut addresses = Vec::new();
    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    for lb in ingress.into_iter().flatten() {
        if let Some(ip) = &lb.ip {
            addresses.push(Address {
                r#type: IP_ADDRESS.into(),
                value: ip.clone(),
                source_type: load_balancer_source(ip).into(),
            });
        }
        if let Some(hostname) = &lb.hostname {
            addresses.push(Address {
                r#type: HOSTNAME.into(),
                value: hostname.clone(),
                source_type: PUBLIC_LOAD_BALANCER.into(),
            });
        }
    }

    let spec = service.spec.as_ref();
    let cluster_ips = spec
        .and_then(|s| s.cluster_ips.clone())
        .or_else(|| spec.and_then(|s| s.cluster_ip.clone()).map(|ip| vec![ip]));
    for ip in cluster_ips.into_iter().flatten().filter(|ip| ip != "None" && !ip.is_empty()) {
        addresses.push(Address {
            r#type: IP_ADDRESS.into(),
            value: ip,
            source_type: PRIVATE_IP.into(),
        });
    }
    addresses
}

/// Copy what the children report back into the DataPlane status.
pub(super) fn record_observed(
    status: &mut DataPlaneStatus,
    dataplane: &str,
    spec: &DataPlaneSpec,
    deployment: &Deployment,
    ingress: Option<&Service>,
) {
    let deployment_status = deployment.status.clone().unwrap_or_default();
    let ready = deployment_status.ready_replicas.unwrap_or(0);
    status.replicas = Some(deployment_status.replicas.unwrap_or(0));
    status.ready_replicas = Some(ready);
    status.selector = Some(selector_string(dataplane));
    status.service = ingress.map(|s| s.name_any());
    status.addresses = ingress.map(service_addresses);
    // the options were validated while synthesizing the budget
    status.pod_disruption_budget = spec
        .resources
        .pod_disruption_budget
        .as_ref()
        .and_then(|pdb| disruption_summary(&pdb.spec, ready).ok());
}

/// Whether the Deployment has rolled the current template out to every desired replica.
/// `autoscaler` holds the min and max replicas when an autoscaler owns the replica count.
pub(super) fn rollout_status(
    deployment: &Deployment,
    autoscaler: Option<(i32, i32)>,
) -> Result<()> {
    let name = deployment.name_any();
    let Some(status) = deployment.status.as_ref() else {
        return Err(waiting(format!("Deployment {name} has no status yet")));
    };
    if status.observed_generation < deployment.metadata.generation {
        return Err(waiting(format!(
            "Deployment {name} has not observed its latest spec yet"
        )));
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    if let Some((min, max)) = autoscaler {
        if desired < min || desired > max {
            return Err(waiting(format!(
                "Deployment {name} runs {desired} replicas, outside of the autoscaler range {min} to {max}"
            )));
        }
    }

    let replicas = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    if updated < desired || ready < desired || replicas > desired {
        return Err(waiting(format!(
            "Deployment {name} has {ready}/{desired} ready and {updated} updated replicas"
        )));
    }
    Ok(())
}

/// Owned Deployments other than `keep`, e.g. after a rename.
pub(super) fn stale_deployments(
    deployments: &Store<Deployment>,
    namespace: &str,
    dataplane: &str,
    keep: &str,
) -> Vec<String> {
    let mut stale: Vec<String> = deployments
        .state()
        .into_iter()
        .filter(|d| d.namespace().as_deref() == Some(namespace))
        .filter(|d| d.labels().get(DATAPLANE_LABEL).map(String::as_str) == Some(dataplane))
        .map(|d| d.name_any())
        .filter(|name| name != keep)
        .collect();
    stale.sort();
    stale
}

/// Apply `desired` if set and remove every other object of its kind owned by the DataPlane.
async fn reconcile_optional<K>(
    api: &Api<K>,
    namespace: &str,
    selector: &str,
    desired: Option<K>,
) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    match desired {
        Some(desired) => {
            let keep = [desired.name_any()];
            let applied = apply_if_changed(api, namespace, desired).await?;
            delete_stale(api, namespace, selector, &keep).await?;
            Ok(Some(applied))
        }
        None => {
            delete_stale(api, namespace, selector, &[]).await?;
            Ok(None)
        }
    }
}

async fn converge(dp: &DataPlane, status: &mut DataPlaneStatus, ctx: &Context) -> Result<()> {
    status.phase = Some(DataPlanePhase::Pending);
    let name = dp.name_any();
    let namespace = dp.namespace().unwrap_or_default();
    let oref = dp
        .controller_owner_ref(&())
        .ok_or_else(|| waiting(format!("DataPlane {namespace}/{name} has no uid yet")))?;

    let base_metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace.clone()),
        labels: Some(dp.labels().clone()),
        owner_references: Some(vec![oref]),
        ..Default::default()
    };

    let extension = attached_extension(dp, ctx.extensions.as_ref())?;

    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let (certificate_secret, certificate) =
        reconcile_cluster_certificate(&secret_api, &namespace, &base_metadata, &name).await?;

    let children = synthesize(
        &name,
        &base_metadata,
        &dp.spec,
        &SynthesisInput {
            default_image: &ctx.default_image,
            cluster_certificate_secret: &certificate_secret,
            cluster_certificate: &certificate.cert,
            extension: extension.as_ref(),
        },
    )?;
    let selector = selector_string(&name);

    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let keep: Vec<String> = children.services.iter().map(|s| s.name_any()).collect();
    let mut ingress = None;
    for service in children.services {
        let is_ingress = service.labels().get(SERVICE_TYPE_LABEL).map(String::as_str)
            == Some(INGRESS_SERVICE_TYPE);
        let applied = apply_if_changed(&svc_api, &namespace, service).await?;
        if is_ingress {
            ingress = Some(applied);
        }
    }
    delete_stale(&svc_api, &namespace, &selector, &keep).await?;

    let autoscaler = children
        .horizontal_pod_autoscaler
        .as_ref()
        .and_then(|hpa| hpa.spec.as_ref())
        .map(|spec| (spec.min_replicas.unwrap_or(1), spec.max_replicas));
    let hpa_api: Api<HorizontalPodAutoscaler> = Api::namespaced(ctx.client.clone(), &namespace);
    reconcile_optional(
        &hpa_api,
        &namespace,
        &selector,
        children.horizontal_pod_autoscaler,
    )
    .await?;
    let pdb_api: Api<PodDisruptionBudget> = Api::namespaced(ctx.client.clone(), &namespace);
    reconcile_optional(&pdb_api, &namespace, &selector, children.pod_disruption_budget).await?;

    let deployment_api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let deployment_name = children.deployment.name_any();
    let deployment = apply_if_changed(&deployment_api, &namespace, children.deployment).await?;
    status.phase = Some(DataPlanePhase::Provisioning);
    record_observed(status, &name, &dp.spec, &deployment, ingress.as_ref());

    let stale = stale_deployments(&ctx.deployments, &namespace, &name, &deployment_name);
    for old in &stale {
        info!("Deleting stale Deployment {old} in namespace {namespace}");
        delete_child(&deployment_api, &namespace, old).await?;
    }
    if !stale.is_empty() {
        return Err(waiting(format!(
            "Waiting for old Deployments to be removed: {}",
            stale.join(", ")
        )));
    }

    rollout_status(&deployment, autoscaler)
}

async fn patch_status(client: &Client, dp: &DataPlane, status: &DataPlaneStatus) -> Result<()> {
    let api: Api<DataPlane> = Api::namespaced(client.clone(), &dp.namespace().unwrap_or_default());
    debug!("Patching status of DataPlane {}", dp.name_any());
    api.patch_status(
        &dp.name_any(),
        &PatchParams::apply(MANAGER).force(),
        &Patch::Apply(status_patch(dp, status)),
    )
    .await?;
    Ok(())
}

async fn apply(dp: Arc<DataPlane>, ctx: Arc<Context>) -> Result<Action> {
    let mut status = dp.status.clone().unwrap_or_default();

    let (result, condition, reason, message) = match converge(&dp, &mut status, &ctx).await {
        Ok(()) => {
            status.phase = Some(DataPlanePhase::Ready);
            // If no events were received, check back every 5 minutes
            (
                Ok(Action::requeue(Duration::from_secs(5 * 60))),
                ConditionStatus::True,
                reasons::READY.to_owned(),
                "DataPlane is ready".to_owned(),
            )
        }
        Err(Error::NotReady {
            message,
            reason,
            requeue_after,
        }) => {
            // default 1 minute in the NotReady case
            let requeue_after = requeue_after.unwrap_or(Duration::from_secs(60));
            info!("DataPlane is not yet ready: {message}");
            (
                Ok(Action::requeue(requeue_after)),
                ConditionStatus::False,
                reason,
                message,
            )
        }
        Err(Error::InvalidDataPlaneSpec(message)) => {
            warn!("DataPlane is invalid: {message}");
            (
                Ok(Action::requeue(Duration::from_secs(5 * 60))),
                ConditionStatus::False,
                reasons::INVALID_SPEC.to_owned(),
                message,
            )
        }
        Err(err) => {
            let message = err.to_string();
            (
                Err(err),
                ConditionStatus::Unknown,
                reasons::FAILED_RECONCILE.to_owned(),
                message,
            )
        }
    };

    let mut updated = dp.as_ref().clone();
    status.observed_generation = dp.metadata.generation;
    updated.status = Some(status);
    set_condition(&mut updated, READY, condition, reason, message);

    if dp.status != updated.status {
        if let Some(status) = &updated.status {
            patch_status(&ctx.client, &dp, status).await?;
        }
    }
    result
}

// Finalizer cleanup; children go away through their owner references
async fn cleanup(dp: Arc<DataPlane>, ctx: Arc<Context>) -> Result<Action> {
    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", dp.name_any())),
                action: "Deleting".into(),
                secondary: None,
            },
            &dp.object_ref(&()),
        )
        .await?;

    let mut status = dp.status.clone().unwrap_or_default();
    if status.phase != Some(DataPlanePhase::Terminating) {
        status.phase = Some(DataPlanePhase::Terminating);
        patch_status(&ctx.client, &dp, &status).await?;
    }
    Ok(Action::await_change())
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let dp_api = Api::<DataPlane>::all(client.clone());
    let deployment_api = Api::<Deployment>::all(client.clone());
    let svc_api = Api::<Service>::all(client.clone());
    let hpa_api = Api::<HorizontalPodAutoscaler>::all(client.clone());
    let pdb_api = Api::<PodDisruptionBudget>::all(client.clone());
    let secret_api = Api::<Secret>::all(client.clone());

    if let Err(e) = dp_api.list(&ListParams::default().limit(1)).await {
        error!("DataPlane is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all resources we create have this label
    let cfg = Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGER}"));

    let (deployment_store, deployment_writer) = reflector::store();
    let deployment_reflector = reflector(deployment_writer, watcher(deployment_api, cfg.clone()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let svc_watcher = watcher(svc_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        // svc has no generation so we hash the spec to check for changes, the status carries
        // the load balancer addresses
        .predicate_filter(
            changed_predicate
                .combine(service_spec_predicate)
                .combine(status_predicate_serde),
        );

    let hpa_watcher = metadata_watcher(hpa_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let pdb_watcher = metadata_watcher(pdb_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let secret_watcher = metadata_watcher(secret_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let controller = Controller::new(dp_api, Config::default())
        .with_config(ControllerConfig::default().concurrency(state.controller_concurrency))
        .shutdown_on_signal()
        .owns_stream(deployment_reflector)
        .owns_stream(svc_watcher)
        .owns_stream(hpa_watcher)
        .owns_stream(pdb_watcher)
        .owns_stream(secret_watcher);

    let (controller, extensions) = if state.konnect_enabled {
        let (ext_store, ext_writer) = reflector::store();
        // extensions become usable through their status, so every change counts
        let ext_reflector = reflector(
            ext_writer,
            watcher(
                Api::<KonnectExtension>::all(client.clone()),
                Config::default(),
            ),
        )
        .touched_objects()
        .default_backoff();

        let dataplanes = controller.store();
        let controller = controller.watches_stream(ext_reflector, move |ext| {
            let namespace = ext.namespace().unwrap_or_default();
            let name = ext.name_any();
            dataplanes
                .state()
                .into_iter()
                .filter(move |dp| uses_extension(dp, &namespace, &name))
                .map(|dp| ObjectRef::from_obj(dp.as_ref()))
        });
        (controller, Some(ext_store))
    } else {
        (controller, None)
    };

    controller
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, &state, deployment_store, extensions),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
