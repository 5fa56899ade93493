use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{metadata_watcher, reflector, watcher, WatchStreamExt};
use kube::Resource;
use tracing::*;

use crate::backoff::{RequeueIntervals, RequeuePolicy};
use crate::conditions::{
    get_condition, is_condition_current_and_true, is_condition_true, reasons, set_condition,
    ConditionStatus, CONTROL_PLANE_REF_VALID, DATA_PLANE_CERTIFICATE_PROVISIONED, MIRRORED,
    PROGRAMMED, READY,
};
use crate::controllers::konnect::apiauth::usable_credentials;
use crate::controllers::konnect::{Context as KonnectContext, KonnectStores};
use crate::controllers::{changed_predicate, ensure_deletion_change, status_patch, MANAGER};
use crate::konnect::{Identifiable, KonnectApiFactory, KonnectError};
use crate::pki::KeyPairPem;
use crate::resources::common::{EntityRef, RefType};
use crate::resources::dataplanes::DataPlane;
use crate::resources::kongservices::validate_control_plane_ref;
use crate::resources::konnectextensions::{
    DataPlaneClientAuthStatus, KonnectExtension, KonnectExtensionControlPlaneStatus, SecretRef,
    KONNECT_EXTENSION_FINALIZER,
};
use crate::resources::konnectgatewaycontrolplanes::{
    ControlPlaneEndpoints, KonnectGatewayControlPlane,
};
use crate::{telemetry, Error, Result};

use super::certificate::{self, KeyPairSource, EXTENSION_LABEL};

// Context for our reconciler
pub(crate) struct Context<F: KonnectApiFactory> {
    /// Client, stores and Konnect access shared with the entity reconcilers
    pub shared: Arc<KonnectContext<F>>,
    /// DataPlanes, to hold back deletion of extensions still in use
    pub dataplanes: Store<DataPlane>,
}

#[instrument(skip(ctx, ext), fields(trace_id))]
async fn reconcile<F: KonnectApiFactory>(
    ext: Arc<KonnectExtension>,
    ctx: Arc<Context<F>>,
) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.shared.metrics.count_and_measure::<KonnectExtension>();
    ctx.shared.diagnostics.write().await.last_event = Utc::now();
    let namespace = ext.namespace().unwrap_or_default();
    let exts: Api<KonnectExtension> = Api::namespaced(ctx.shared.client.clone(), &namespace);

    info!("Reconciling KonnectExtension {namespace}/{}", ext.name_any());
    match finalizer(&exts, KONNECT_EXTENSION_FINALIZER, ext.clone(), |event| async {
        match event {
            Finalizer::Apply(ext) => apply(ext, ctx.clone()).await,
            Finalizer::Cleanup(ext) => cleanup(ext, ctx.clone()).await,
        }
    })
    .await
    {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.shared
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &ext.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.shared.metrics.reconcile_failure(ext.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<F: KonnectApiFactory>(
    _ext: Arc<KonnectExtension>,
    err: &Error,
    ctx: Arc<Context<F>>,
) -> Action {
    if err.is_conflict() {
        return Action::requeue(Duration::from_secs(1));
    }
    match err.inner() {
        Error::NotReady {
            requeue_after: Some(after),
            ..
        } => Action::requeue(*after),
        Error::NotReady { .. } | Error::DeletionBlocked { .. } => {
            Action::requeue(ctx.shared.policy.intervals.dependency)
        }
        _ => Action::requeue(Duration::from_secs(30)),
    }
}

/// The control plane an extension attaches its data planes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AttachedControlPlane {
    pub id: String,
    pub endpoints: ControlPlaneEndpoints,
    /// Namespace and name of the auth configuration certificates are registered with
    pub auth: (String, String),
}

fn describe(reference: &EntityRef, namespace: &str) -> String {
    match (&reference.namespaced_ref, &reference.konnect_id) {
        (Some(r), _) if reference.r#type == RefType::NamespacedRef => format!(
            "KonnectGatewayControlPlane {}/{}",
            r.namespace_or(namespace),
            r.name
        ),
        (_, Some(id)) => format!("KonnectGatewayControlPlane with Konnect ID {id}"),
        _ => "KonnectGatewayControlPlane".into(),
    }
}

fn find_control_plane(
    reference: &EntityRef,
    namespace: &str,
    stores: &KonnectStores,
) -> Option<Arc<KonnectGatewayControlPlane>> {
    match reference.r#type {
        RefType::NamespacedRef => reference.namespaced_ref.as_ref().and_then(|r| {
            stores
                .control_planes
                .get(&ObjectRef::new(&r.name).within(r.namespace_or(namespace)))
        }),
        RefType::KonnectId => reference
            .konnect_id
            .as_deref()
            .and_then(|id| stores.control_plane_by_id(namespace, id)),
    }
}

/// Whether `ext` points at the control plane with this namespace, name and Konnect ID.
fn attaches_to(ext: &KonnectExtension, namespace: &str, name: &str, id: Option<&str>) -> bool {
    let reference = &ext.spec.konnect.control_plane.control_plane_ref;
    match reference.r#type {
        RefType::NamespacedRef => reference.namespaced_ref.as_ref().is_some_and(|r| {
            r.name == name
                && r.namespace_or(ext.namespace().as_deref().unwrap_or_default()) == namespace
        }),
        RefType::KonnectId => id.is_some() && reference.konnect_id.as_deref() == id,
    }
}

/// Look up the control plane `ext` references and check that data planes can connect to it.
pub(crate) fn attached_control_plane(
    ext: &KonnectExtension,
    stores: &KonnectStores,
) -> Result<AttachedControlPlane> {
    let namespace = ext.namespace().unwrap_or_default();
    let reference = &ext.spec.konnect.control_plane.control_plane_ref;
    validate_control_plane_ref(reference).map_err(|message| Error::InvalidEntity {
        reason: reasons::INVALID_SPEC.into(),
        message,
    })?;

    let described = describe(reference, &namespace);
    let cp = find_control_plane(reference, &namespace, stores).ok_or_else(|| Error::NotReady {
        message: format!("{described} does not exist"),
        reason: reasons::CONTROL_PLANE_REF_NOT_FOUND.into(),
        requeue_after: None,
    })?;

    let converged =
        is_condition_true(cp.as_ref(), PROGRAMMED) || is_condition_true(cp.as_ref(), MIRRORED);
    match (cp.konnect_id(), cp.endpoints()) {
        (Some(id), Some(endpoints)) if converged => Ok(AttachedControlPlane {
            id: id.to_owned(),
            endpoints: endpoints.clone(),
            auth: (
                cp.namespace().unwrap_or_default(),
                cp.spec.konnect.api_auth_configuration_ref.name.clone(),
            ),
        }),
        _ => Err(Error::NotReady {
            message: format!("{described} is not programmed yet"),
            reason: reasons::CONTROL_PLANE_REF_NOT_PROGRAMMED.into(),
            requeue_after: None,
        }),
    }
}

pub(crate) fn record_control_plane(ext: &mut KonnectExtension, cp: &AttachedControlPlane) {
    set_condition(
        ext,
        CONTROL_PLANE_REF_VALID,
        ConditionStatus::True,
        reasons::VALID,
        format!("control plane {} is ready", cp.id),
    );
    let status = ext.status.get_or_insert_with(Default::default);
    // a certificate registered with another control plane is not reused
    let certificate_id = status
        .konnect
        .take()
        .filter(|k| k.control_plane_id == cp.id)
        .and_then(|k| k.certificate_id);
    status.konnect = Some(KonnectExtensionControlPlaneStatus {
        control_plane_id: cp.id.clone(),
        endpoints: cp.endpoints.clone(),
        certificate_id,
    });
}

/// Report why `condition` cannot be satisfied yet. Errors that say nothing about the
/// extension's inputs are handed back.
fn blocked(
    ext: &mut KonnectExtension,
    condition: &str,
    err: Error,
    intervals: &RequeueIntervals,
) -> Result<Action> {
    let (reason, message, after) = match err {
        Error::NotReady {
            reason,
            message,
            requeue_after,
        } => (reason, message, requeue_after.unwrap_or(intervals.dependency)),
        Error::InvalidEntity { reason, message } => (reason, message, intervals.slow),
        err => return Err(err),
    };
    info!("KonnectExtension {} is not ready: {message}", ext.name_any());
    set_condition(ext, condition, ConditionStatus::False, reason, message);
    Ok(Action::requeue(after))
}

/// Record the outcome of registering the client certificate and pick the requeue delay.
pub(crate) fn settle_registration(
    ext: &mut KonnectExtension,
    result: Result<String, KonnectError>,
    policy: &RequeuePolicy,
    key: &str,
) -> Action {
    match result {
        Ok(id) => {
            policy.succeeded(key);
            if let Some(konnect) = ext.status.as_mut().and_then(|s| s.konnect.as_mut()) {
                konnect.certificate_id = Some(id);
            }
            set_condition(
                ext,
                DATA_PLANE_CERTIFICATE_PROVISIONED,
                ConditionStatus::True,
                reasons::PROVISIONED,
                "",
            );
            Action::requeue(policy.intervals.resync)
        }
        Err(err) if err.is_retryable() => {
            let retry_after = match err {
                KonnectError::RateLimited { retry_after } => retry_after,
                _ => None,
            };
            let (delay, degraded) = policy.transient_failure(key, retry_after);
            if degraded {
                set_condition(
                    ext,
                    DATA_PLANE_CERTIFICATE_PROVISIONED,
                    ConditionStatus::Unknown,
                    reasons::RETRIES_EXHAUSTED,
                    err.to_string(),
                );
            }
            Action::requeue(delay)
        }
        Err(err) => {
            policy.succeeded(key);
            set_condition(
                ext,
                DATA_PLANE_CERTIFICATE_PROVISIONED,
                ConditionStatus::False,
                reasons::KONNECT_API_OP_FAILED,
                err.to_string(),
            );
            Action::requeue(policy.intervals.slow)
        }
    }
}

/// Ready is the conjunction of the control plane and certificate conditions.
pub(crate) fn aggregate_ready(ext: &mut KonnectExtension) {
    let pending = [CONTROL_PLANE_REF_VALID, DATA_PLANE_CERTIFICATE_PROVISIONED]
        .into_iter()
        .find(|c| !is_condition_current_and_true(ext, c));
    let Some(pending) = pending else {
        set_condition(ext, READY, ConditionStatus::True, reasons::READY, "");
        return;
    };
    match get_condition(ext, pending).cloned() {
        Some(c) if c.observed_generation == ext.metadata.generation => {
            let status = match c.status {
                ConditionStatus::Unknown => ConditionStatus::Unknown,
                _ => ConditionStatus::False,
            };
            set_condition(ext, READY, status, c.reason, c.message)
        }
        _ => set_condition(
            ext,
            READY,
            ConditionStatus::False,
            reasons::PENDING,
            format!("{pending} has not been evaluated yet"),
        ),
    }
}

async fn provision(ext: &mut KonnectExtension, secret_api: &Api<Secret>) -> Result<KeyPairPem> {
    let name = certificate::secret_name(ext)?;
    let existing = secret_api.get_opt(&name).await?;
    let source = certificate::key_pair(ext, &name, existing.as_ref())?;
    if let KeyPairSource::Generated(pair) = &source {
        info!(
            "Generating client certificate Secret {name} for KonnectExtension {}",
            ext.name_any()
        );
        let secret = certificate::certificate_secret(ext, &name, pair)?;
        certificate::apply_secret(secret_api, secret).await?;
    }
    ext.status
        .get_or_insert_with(Default::default)
        .data_plane_client_auth = Some(DataPlaneClientAuthStatus {
        certificate_secret_ref: Some(SecretRef { name }),
    });
    Ok(source.pair().clone())
}

async fn converge<F: KonnectApiFactory>(
    ext: &mut KonnectExtension,
    ctx: &Context<F>,
) -> Result<Action> {
    let shared = ctx.shared.as_ref();
    let intervals = &shared.policy.intervals;

    let control_plane = match attached_control_plane(ext, &shared.stores) {
        Ok(cp) => cp,
        Err(err) => return blocked(ext, CONTROL_PLANE_REF_VALID, err, intervals),
    };
    record_control_plane(ext, &control_plane);

    let secret_api: Api<Secret> =
        Api::namespaced(shared.client.clone(), &ext.namespace().unwrap_or_default());
    let pair = match provision(ext, &secret_api).await {
        Ok(pair) => pair,
        Err(err) => return blocked(ext, DATA_PLANE_CERTIFICATE_PROVISIONED, err, intervals),
    };

    let (auth_namespace, auth_name) = &control_plane.auth;
    let credentials = match usable_credentials(&shared.stores, auth_namespace, auth_name) {
        Ok((credentials, _)) => credentials,
        Err(err) => return blocked(ext, DATA_PLANE_CERTIFICATE_PROVISIONED, err, intervals),
    };

    let registered = ext
        .status
        .as_ref()
        .and_then(|s| s.konnect.as_ref())
        .and_then(|k| k.certificate_id.clone());
    let api = shared.konnect.api_for(&credentials);
    let result =
        certificate::register(&api, &control_plane.id, registered.as_deref(), &pair.cert).await;
    if let Err(err) = &result {
        warn!(
            "Registering the client certificate of KonnectExtension {} failed: {err}",
            ext.name_any()
        );
        shared.metrics.konnect_failure(ext, err);
    }
    Ok(settle_registration(ext, result, &shared.policy, &failure_key(ext)))
}

async fn apply<F: KonnectApiFactory>(
    ext: Arc<KonnectExtension>,
    ctx: Arc<Context<F>>,
) -> Result<Action> {
    let mut updated = ext.as_ref().clone();
    let result = converge(&mut updated, &ctx).await;
    aggregate_ready(&mut updated);
    if let Err(err) = &result {
        set_condition(
            &mut updated,
            READY,
            ConditionStatus::Unknown,
            reasons::FAILED_RECONCILE,
            err.to_string(),
        );
    }
    updated
        .status
        .get_or_insert_with(Default::default)
        .observed_generation = updated.metadata.generation;

    if ext.status != updated.status {
        let api: Api<KonnectExtension> =
            Api::namespaced(ctx.shared.client.clone(), &ext.namespace().unwrap_or_default());
        debug!("Patching status of KonnectExtension {}", ext.name_any());
        api.patch_status(
            &ext.name_any(),
            &PatchParams::apply(MANAGER).force(),
            &Patch::Apply(status_patch(ext.as_ref(), &updated.status)),
        )
        .await?;
    }
    result
}

/// DataPlanes that still list this extension.
pub(crate) fn referencing_dataplanes(
    dataplanes: &Store<DataPlane>,
    namespace: &str,
    name: &str,
) -> Vec<String> {
    let mut found: Vec<String> = dataplanes
        .state()
        .into_iter()
        .filter(|dp| {
            let dp_namespace = dp.namespace().unwrap_or_default();
            let uses = dp
                .konnect_extensions(&dp_namespace)
                .any(|(ns, n)| ns == namespace && n == name);
            uses
        })
        .map(|dp| format!("DataPlane {}/{}", dp.namespace().unwrap_or_default(), dp.name_any()))
        .collect();
    found.sort();
    found
}

// Finalizer cleanup (the object was deleted, unregister its certificate once no DataPlane uses it)
async fn cleanup<F: KonnectApiFactory>(
    ext: Arc<KonnectExtension>,
    ctx: Arc<Context<F>>,
) -> Result<Action> {
    let shared = ctx.shared.as_ref();
    shared
        .recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", ext.name_any())),
                action: "Deleting".into(),
                secondary: None,
            },
            &ext.object_ref(&()),
        )
        .await?;

    release(
        ext.as_ref(),
        &shared.stores,
        &ctx.dataplanes,
        &shared.konnect,
        &shared.policy,
    )
    .await?;
    Ok(Action::await_change())
}

fn failure_key(ext: &KonnectExtension) -> String {
    format!(
        "KonnectExtension/{}/{}",
        ext.namespace().unwrap_or_default(),
        ext.name_any()
    )
}

/// Unregister the client certificate of a deleted extension once no DataPlane uses it.
///
/// Returns whether a certificate was unregistered.
pub(crate) async fn release<F: KonnectApiFactory>(
    ext: &KonnectExtension,
    stores: &KonnectStores,
    dataplanes: &Store<DataPlane>,
    konnect: &F,
    policy: &RequeuePolicy,
) -> Result<bool> {
    let namespace = ext.namespace().unwrap_or_default();
    let dependents = referencing_dataplanes(dataplanes, &namespace, &ext.name_any());
    if !dependents.is_empty() {
        info!(
            "Deletion of KonnectExtension {namespace}/{} waits for {}",
            ext.name_any(),
            dependents.join(", ")
        );
        return Err(Error::DeletionBlocked { dependents });
    }
    policy.succeeded(&failure_key(ext));

    let Some(status) = ext.status.as_ref().and_then(|s| s.konnect.as_ref()) else {
        return Ok(false);
    };
    let Some(certificate_id) = status.certificate_id.as_deref() else {
        return Ok(false);
    };
    let Some(cp) = stores.control_plane_by_id(&namespace, &status.control_plane_id) else {
        warn!(
            "Control plane {} is gone, leaving client certificate {certificate_id} registered",
            status.control_plane_id
        );
        return Ok(false);
    };
    let credentials = match usable_credentials(
        stores,
        &cp.namespace().unwrap_or_default(),
        &cp.spec.konnect.api_auth_configuration_ref.name,
    ) {
        Ok((credentials, _)) => credentials,
        Err(Error::NotReady { message, .. }) => {
            warn!("Leaving client certificate {certificate_id} registered: {message}");
            return Ok(false);
        }
        Err(err) => return Err(err),
    };

    let api = konnect.api_for(&credentials);
    certificate::unregister(&api, &status.control_plane_id, certificate_id).await?;
    info!(
        "Unregistered client certificate {certificate_id} from control plane {}",
        status.control_plane_id
    );
    Ok(true)
}

/// Run the KonnectExtension controller. Extensions are requeued when their control plane, the
/// DataPlanes using them, or their generated Secret change.
pub(crate) async fn run<F: KonnectApiFactory>(
    client: Client,
    shared: Arc<KonnectContext<F>>,
    config: controller::Config,
) {
    let (dataplanes, dp_writer) = reflector::store();
    let dp_reflector = reflector(
        dp_writer,
        watcher(Api::<DataPlane>::all(client.clone()), watcher::Config::default()),
    )
    .map(|event| ensure_deletion_change(event))
    .touched_objects()
    .default_backoff()
    .predicate_filter(changed_predicate);

    // control planes become usable through their status, so every change counts
    let cp_watcher = watcher(
        Api::<KonnectGatewayControlPlane>::all(client.clone()),
        watcher::Config::default(),
    )
    .touched_objects()
    .default_backoff();

    let secret_watcher = metadata_watcher(
        Api::<Secret>::all(client.clone()),
        watcher::Config::default().labels(EXTENSION_LABEL),
    )
    .map(|event| ensure_deletion_change(event))
    .touched_objects()
    .predicate_filter(changed_predicate);

    let controller = Controller::new(
        Api::<KonnectExtension>::all(client),
        watcher::Config::default(),
    )
    .with_config(config)
    .shutdown_on_signal()
    .owns_stream(secret_watcher);
    let extensions = controller.store();

    controller
        .watches_stream(dp_reflector, |dp| {
            let namespace = dp.namespace().unwrap_or_default();
            dp.konnect_extensions(&namespace)
                .map(|(ns, name)| ObjectRef::new(name).within(ns))
                .collect::<Vec<_>>()
        })
        .watches_stream(cp_watcher, move |cp| {
            let namespace = cp.namespace().unwrap_or_default();
            let name = cp.name_any();
            let id = cp.konnect_id().map(str::to_owned);
            extensions
                .state()
                .into_iter()
                .filter(move |ext| attaches_to(ext, &namespace, &name, id.as_deref()))
                .map(|ext| ObjectRef::from_obj(ext.as_ref()))
        })
        .run(
            reconcile::<F>,
            error_policy::<F>,
            Arc::new(Context { shared, dataplanes }),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
