use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::Resource;
use tokio::sync::RwLock;
use tracing::*;

use crate::backoff::{RequeueIntervals, RequeuePolicy};
use crate::conditions::{reasons, set_condition, ConditionStatus, MIRRORED, PROGRAMMED};
use crate::controllers::{status_patch, Diagnostics, State, MANAGER};
use crate::konnect::{KonnectApi, KonnectApiFactory, KonnectEntity, KonnectError, Parents};
use crate::{telemetry, Error, Metrics, Result};

use super::apiauth::usable_credentials;
use super::resolver::{KonnectStores, ResolveError};
use super::sync::{self, SyncOutcome};

/// Everything the Konnect reconcilers share.
pub(crate) struct Context<F: KonnectApiFactory> {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Caches of every Konnect kind, for resolving references
    pub stores: KonnectStores,
    /// Builds Konnect clients per auth configuration
    pub konnect: F,
    /// Requeue timing and consecutive failure counts
    pub policy: RequeuePolicy,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl<F: KonnectApiFactory> Context<F> {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: &State,
        stores: KonnectStores,
        konnect: F,
    ) -> Arc<Context<F>> {
        let intervals = RequeueIntervals {
            resync: state.konnect_sync_period,
            ..Default::default()
        };
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, MANAGER.into()),
            stores,
            konnect,
            policy: RequeuePolicy::new(intervals, Default::default()),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, obj), fields(trace_id))]
async fn reconcile<E, F>(obj: Arc<E>, ctx: Arc<Context<F>>) -> Result<Action>
where
    E: KonnectEntity,
    F: KonnectApiFactory,
{
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<E>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let api: Api<E> = Api::namespaced(ctx.client.clone(), &obj.namespace().unwrap_or_default());

    info!("Reconciling {}", obj.display_name());
    match finalizer(&api, E::FINALIZER, obj.clone(), |event| async {
        match event {
            Finalizer::Apply(obj) => apply(obj, ctx.clone()).await,
            Finalizer::Cleanup(obj) => cleanup(obj, ctx.clone()).await,
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
                    &obj.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(obj.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, F: KonnectApiFactory>(_obj: Arc<K>, err: &Error, ctx: Arc<Context<F>>) -> Action {
    if err.is_conflict() {
        return Action::requeue(Duration::from_secs(1));
    }
    match err.inner() {
        Error::NotReady {
            requeue_after: Some(after),
            ..
        } => Action::requeue(*after),
        Error::NotReady { .. } | Error::DeletionBlocked { .. } => {
            Action::requeue(ctx.policy.intervals.dependency)
        }
        _ => Action::requeue(Duration::from_secs(30)),
    }
}

/// Key of an entity in the failure tracker.
fn failure_key<E: KonnectEntity>(entity: &E) -> String {
    format!(
        "{}/{}/{}",
        E::kind(&()),
        entity.namespace().unwrap_or_default(),
        entity.name_any()
    )
}

/// The condition reporting convergence: mirrors are never programmed, only mirrored.
pub(crate) fn programmed_condition<E: KonnectEntity>(entity: &E) -> &'static str {
    if entity.mirror_id().is_some() {
        MIRRORED
    } else {
        PROGRAMMED
    }
}

async fn apply<E, F>(obj: Arc<E>, ctx: Arc<Context<F>>) -> Result<Action>
where
    E: KonnectEntity,
    F: KonnectApiFactory,
{
    let mut entity = obj.as_ref().clone();
    let result = converge(&mut entity, &ctx).await;
    if let Err(err) = &result {
        let condition = programmed_condition(&entity);
        set_condition(
            &mut entity,
            condition,
            ConditionStatus::Unknown,
            reasons::FAILED_RECONCILE,
            err.to_string(),
        );
    }
    entity.konnect_status_mut().observed_generation = entity.meta().generation;
    patch_status(&ctx.client, obj.as_ref(), &entity).await?;
    result
}

async fn converge<E, F>(entity: &mut E, ctx: &Context<F>) -> Result<Action>
where
    E: KonnectEntity,
    F: KonnectApiFactory,
{
    let (parents, collection) = match gate(entity, &ctx.stores, &ctx.policy.intervals) {
        Ok(resolved) => resolved,
        Err(action) => return Ok(action),
    };

    let condition = programmed_condition(entity);
    let Some((auth_namespace, auth_name)) = parents.auth.clone() else {
        set_condition(
            entity,
            condition,
            ConditionStatus::False,
            reasons::AUTH_REF_NOT_READY,
            "no KonnectAPIAuthConfiguration is associated with this object",
        );
        return Ok(Action::requeue(ctx.policy.intervals.dependency));
    };
    let (credentials, organization_id) =
        match usable_credentials(&ctx.stores, &auth_namespace, &auth_name) {
            Ok(found) => found,
            Err(Error::NotReady {
                reason, message, ..
            }) => {
                set_condition(entity, condition, ConditionStatus::False, reason, message);
                return Ok(Action::requeue(ctx.policy.intervals.dependency));
            }
            Err(err) => return Err(err),
        };

    let status = entity.konnect_status_mut();
    status.server_url = Some(credentials.server_url.to_string());
    status.organization_id = organization_id;

    let api = ctx.konnect.api_for(&credentials);
    let outcome = program(&api, entity, &collection, &parents).await;
    match &outcome {
        Outcome::Synced(SyncOutcome::Unchanged) => {}
        Outcome::Synced(synced) => {
            info!("{} {synced} in Konnect", entity.display_name());
        }
        Outcome::Retrying(err) | Outcome::Rejected(err) => {
            warn!("Konnect call for {} failed: {err}", entity.display_name());
            ctx.metrics.konnect_failure(entity, err);
        }
    }
    Ok(settle(entity, &outcome, &ctx.policy, &failure_key(entity)))
}

/// Validate and resolve `entity`. When it cannot be sent to Konnect yet, its condition explains
/// why and the returned action says when to look again.
pub(crate) fn gate<E: KonnectEntity>(
    entity: &mut E,
    stores: &KonnectStores,
    intervals: &RequeueIntervals,
) -> Result<(Parents, String), Action> {
    let condition = programmed_condition(entity);
    if let Err(message) = entity.validate() {
        set_condition(
            entity,
            condition,
            ConditionStatus::False,
            reasons::INVALID_SPEC,
            message,
        );
        return Err(Action::requeue(intervals.slow));
    }

    let parents = match stores.resolve(entity) {
        Ok(parents) => parents,
        Err(err) => {
            let reason = err.reason();
            let message = err.message();
            debug!("{} is not resolvable: {message}", entity.display_name());
            set_condition(entity, condition, ConditionStatus::False, reason, message);
            return Err(match err {
                ResolveError::Missing(_) => Action::requeue(intervals.dependency),
                ResolveError::Invalid { .. } => Action::requeue(intervals.slow),
            });
        }
    };

    match entity.collection(&parents) {
        Some(collection) => Ok((parents, collection)),
        None => {
            set_condition(
                entity,
                condition,
                ConditionStatus::False,
                reasons::PENDING,
                "waiting for the IDs of referenced objects",
            );
            Err(Action::requeue(intervals.dependency))
        }
    }
}

/// How one round of calls against Konnect ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Synced(SyncOutcome),
    /// Transient failure, retried with backoff
    Retrying(KonnectError),
    /// Konnect refused; retried slowly in case the object is fixed
    Rejected(KonnectError),
}

pub(crate) async fn program<E, A>(
    api: &A,
    entity: &mut E,
    collection: &str,
    parents: &Parents,
) -> Outcome
where
    E: KonnectEntity,
    A: KonnectApi,
{
    let result = match entity.mirror_id().map(str::to_owned) {
        Some(id) => sync::mirror(api, entity, collection, &id).await,
        None => sync::sync(api, entity, collection, parents).await,
    };
    match result {
        Ok(synced) => Outcome::Synced(synced),
        Err(err) if err.is_retryable() => Outcome::Retrying(err),
        Err(err) => Outcome::Rejected(err),
    }
}

/// Record `outcome` in the entity's condition and pick the requeue delay.
pub(crate) fn settle<E: KonnectEntity>(
    entity: &mut E,
    outcome: &Outcome,
    policy: &RequeuePolicy,
    key: &str,
) -> Action {
    let condition = programmed_condition(entity);
    match outcome {
        Outcome::Synced(_) => {
            policy.succeeded(key);
            let reason = if condition == MIRRORED {
                reasons::MIRRORED
            } else {
                reasons::PROGRAMMED
            };
            set_condition(entity, condition, ConditionStatus::True, reason, "");
            Action::requeue(policy.intervals.resync)
        }
        Outcome::Retrying(err) => {
            let retry_after = match err {
                KonnectError::RateLimited { retry_after } => *retry_after,
                _ => None,
            };
            let (delay, degraded) = policy.transient_failure(key, retry_after);
            if degraded {
                set_condition(
                    entity,
                    condition,
                    ConditionStatus::Unknown,
                    reasons::RETRIES_EXHAUSTED,
                    err.to_string(),
                );
            }
            Action::requeue(delay)
        }
        Outcome::Rejected(err) => {
            policy.succeeded(key);
            set_condition(
                entity,
                condition,
                ConditionStatus::False,
                reasons::KONNECT_API_OP_FAILED,
                err.to_string(),
            );
            Action::requeue(policy.intervals.slow)
        }
    }
}

async fn patch_status<E: KonnectEntity>(client: &Client, original: &E, updated: &E) -> Result<()> {
    let status = serde_json::to_value(updated)?
        .get_mut("status")
        .map(serde_json::Value::take)
        .unwrap_or_default();
    if serde_json::to_value(original)?.get("status") == Some(&status) {
        return Ok(());
    }

    let api: Api<E> = Api::namespaced(client.clone(), &original.namespace().unwrap_or_default());
    let name = original.name_any();
    debug!("Patching status of {}", original.display_name());
    api.patch_status(
        &name,
        &PatchParams::apply(MANAGER).force(),
        &Patch::Apply(status_patch(original, &status)),
    )
    .await?;
    Ok(())
}

// Finalizer cleanup (the object was deleted, remove it from Konnect once nothing depends on it)
async fn cleanup<E, F>(obj: Arc<E>, ctx: Arc<Context<F>>) -> Result<Action>
where
    E: KonnectEntity,
    F: KonnectApiFactory,
{
    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", obj.name_any())),
                action: "Deleting".into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await?;

    if release(obj.as_ref(), &ctx.stores, &ctx.konnect, &ctx.policy).await? {
        info!("Deleted {} from Konnect", obj.display_name());
    }
    Ok(Action::await_change())
}

/// Delete the remote object of a deleted `entity` once no other object still lives inside it.
/// Objects that cannot be deleted remotely (mirrors, never programmed, no usable credentials)
/// are released without a call to Konnect.
///
/// Returns whether a Konnect object was deleted.
pub(crate) async fn release<E, F>(
    entity: &E,
    stores: &KonnectStores,
    konnect: &F,
    policy: &RequeuePolicy,
) -> Result<bool>
where
    E: KonnectEntity,
    F: KonnectApiFactory,
{
    if let Some(kind) = E::DEPENDENCY {
        let dependents =
            stores.dependents(kind, &entity.namespace().unwrap_or_default(), &entity.name_any());
        if !dependents.is_empty() {
            info!(
                "Deletion of {} waits for {}",
                entity.display_name(),
                dependents.join(", ")
            );
            return Err(Error::DeletionBlocked { dependents });
        }
    }
    // deleted objects are never reconciled again, so their failure count goes too
    policy.succeeded(&failure_key(entity));

    if entity.mirror_id().is_some() || entity.konnect_id().is_none() {
        return Ok(false);
    }
    let Some((auth_namespace, auth_name)) = stores.recorded_auth(entity) else {
        warn!(
            "{} has no control plane to authenticate with, releasing it without deleting Konnect object {}",
            entity.display_name(),
            entity.konnect_id().unwrap_or_default()
        );
        return Ok(false);
    };
    let credentials = match usable_credentials(stores, &auth_namespace, &auth_name) {
        Ok((credentials, _)) => credentials,
        Err(Error::NotReady { message, .. }) => {
            warn!(
                "Releasing {} without deleting it from Konnect: {message}",
                entity.display_name()
            );
            return Ok(false);
        }
        Err(err) => return Err(err),
    };

    let api = konnect.api_for(&credentials);
    Ok(sync::delete(&api, entity).await?)
}

/// Run the reconciler of one Konnect entity kind over an existing reflector stream.
pub(crate) async fn run_entity<E, F, S>(
    stream: S,
    store: Store<E>,
    ctx: Arc<Context<F>>,
    config: controller::Config,
) where
    E: KonnectEntity,
    F: KonnectApiFactory,
    S: Stream<Item = Result<E, watcher::Error>> + Send + 'static,
{
    Controller::for_stream(stream, store)
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile::<E, F>, error_policy::<E, F>, ctx)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{get_condition, is_condition_true};
    use crate::conditions::API_AUTH_VALID;
    use crate::controllers::konnect::resolver::tests::{
        control_plane, meta, programmed, route, service, store, stores_with, target, upstream,
    };
    use crate::konnect::testing::{InMemoryKonnect, Op};
    use crate::konnect::Identifiable;
    use crate::resources::common::{EntityRef, NamespacedRef};
    use crate::resources::kongcertificates::{
        KongCertificate, KongCertificateSpec, KongSNI, KongSNISpec,
    };
    use crate::resources::konnectapiauthconfigurations::{
        KonnectAPIAuthConfiguration, KonnectAPIAuthConfigurationSpec,
    };
    use crate::resources::konnectgatewaycontrolplanes::{EntitySource, MirrorKonnect, MirrorSpec};
    use serde_json::json;

    fn policy(degraded_after: u32) -> RequeuePolicy {
        RequeuePolicy::new(
            RequeueIntervals {
                degraded_after,
                ..Default::default()
            },
            crate::backoff::BackoffConfig {
                jitter: 0.0,
                ..Default::default()
            },
        )
    }

    #[test]
    fn invalid_spec_is_reported_and_retried_slowly() {
        let mut svc = service("svc");
        svc.spec.host = String::new();
        let stores = stores_with(vec![], vec![], vec![]);
        let intervals = RequeueIntervals::default();

        let action = gate(&mut svc, &stores, &intervals).unwrap_err();
        assert_eq!(action, Action::requeue(intervals.slow));
        let condition = get_condition(&svc, PROGRAMMED).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, reasons::INVALID_SPEC);
    }

    #[test]
    fn route_is_gated_on_unprogrammed_service() {
        let cp = programmed(control_plane("cp"), "cp-1", None);
        let stores = stores_with(vec![cp], vec![service("svc")], vec![]);
        let intervals = RequeueIntervals::default();
        let mut r = route("r", Some("svc"), None);

        let action = gate(&mut r, &stores, &intervals).unwrap_err();
        assert_eq!(action, Action::requeue(intervals.dependency));
        let condition = get_condition(&r, PROGRAMMED).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(condition.message.contains("KongService default/svc"));
        assert_eq!(r.konnect_id(), None);
    }

    #[tokio::test]
    async fn route_is_created_with_service_id_once_service_is_programmed() {
        let konnect = InMemoryKonnect::new();
        let cp = programmed(control_plane("cp"), "cp-1", None);
        let svc = programmed(service("svc"), "svc-1", Some("cp-1"));
        let stores = stores_with(vec![cp], vec![svc], vec![]);
        let policy = policy(8);
        let mut r = route("r", Some("svc"), None);

        let (parents, collection) = gate(&mut r, &stores, &policy.intervals).unwrap();
        let outcome = program(&konnect, &mut r, &collection, &parents).await;
        let action = settle(&mut r, &outcome, &policy, "r");

        assert_eq!(action, Action::requeue(policy.intervals.resync));
        assert!(is_condition_true(&r, PROGRAMMED));
        let id = r.konnect_id().unwrap();
        assert_eq!(
            konnect.object(&collection, id).unwrap()["service"]["id"],
            "svc-1"
        );
        assert_eq!(r.konnect_status().unwrap().service_id.as_deref(), Some("svc-1"));
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_degrade() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(2);
        let mut svc = service("svc");
        let parents = Parents::default().with(crate::konnect::DependencyKind::ControlPlane, "cp-1");
        let collection = "v2/control-planes/cp-1/core-entities/services";

        konnect.fail_next(
            Op::Create,
            KonnectError::Server {
                status: 503,
                message: "unavailable".into(),
            },
        );
        let outcome = program(&konnect, &mut svc, collection, &parents).await;
        assert_eq!(
            settle(&mut svc, &outcome, &policy, "svc"),
            Action::requeue(Duration::from_secs(1))
        );
        assert!(get_condition(&svc, PROGRAMMED).is_none());

        konnect.fail_next(Op::Create, KonnectError::Timeout(Duration::from_secs(30)));
        let outcome = program(&konnect, &mut svc, collection, &parents).await;
        assert_eq!(
            settle(&mut svc, &outcome, &policy, "svc"),
            Action::requeue(Duration::from_secs(2))
        );
        let condition = get_condition(&svc, PROGRAMMED).unwrap();
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(condition.reason, reasons::RETRIES_EXHAUSTED);

        let outcome = program(&konnect, &mut svc, collection, &parents).await;
        settle(&mut svc, &outcome, &policy, "svc");
        assert!(is_condition_true(&svc, PROGRAMMED));
        assert_eq!(policy.failures.attempts("svc"), 0);
    }

    #[tokio::test]
    async fn rate_limits_honour_retry_after() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(8);
        let mut svc = service("svc");
        let parents = Parents::default().with(crate::konnect::DependencyKind::ControlPlane, "cp-1");
        konnect.fail_next(
            Op::Create,
            KonnectError::RateLimited {
                retry_after: Some(Duration::from_secs(42)),
            },
        );
        let outcome = program(&konnect, &mut svc, "services", &parents).await;
        assert_eq!(
            settle(&mut svc, &outcome, &policy, "svc"),
            Action::requeue(Duration::from_secs(42))
        );
    }

    #[tokio::test]
    async fn rejection_is_surfaced_and_retried_slowly() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(8);
        let mut svc = service("svc");
        let parents = Parents::default().with(crate::konnect::DependencyKind::ControlPlane, "cp-1");
        konnect.fail_next(
            Op::Create,
            KonnectError::Validation {
                status: 400,
                message: "port must be an integer".into(),
            },
        );
        let outcome = program(&konnect, &mut svc, "services", &parents).await;
        assert_eq!(
            settle(&mut svc, &outcome, &policy, "svc"),
            Action::requeue(policy.intervals.slow)
        );
        let condition = get_condition(&svc, PROGRAMMED).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, reasons::KONNECT_API_OP_FAILED);
        assert!(condition.message.contains("port must be an integer"));
    }

    #[tokio::test]
    async fn mirror_control_plane_is_only_read() {
        let konnect = InMemoryKonnect::new();
        konnect.insert(
            "v2/control-planes",
            "remote-cp",
            serde_json::json!({
                "name": "shared",
                "config": {
                    "control_plane_endpoint": "https://remote.cp",
                    "telemetry_endpoint": "https://remote.tp",
                }
            }),
        );
        let policy = policy(8);
        let mut cp = control_plane("mirror");
        cp.spec.source = EntitySource::Mirror;
        cp.spec.mirror = Some(MirrorSpec {
            konnect: MirrorKonnect {
                id: "remote-cp".into(),
            },
        });

        let stores = stores_with(vec![], vec![], vec![]);
        let (parents, collection) = gate(&mut cp, &stores, &policy.intervals).unwrap();
        let outcome = program(&konnect, &mut cp, &collection, &parents).await;
        settle(&mut cp, &outcome, &policy, "mirror");

        assert!(is_condition_true(&cp, MIRRORED));
        assert!(get_condition(&cp, PROGRAMMED).is_none());
        assert_eq!(cp.konnect_id(), Some("remote-cp"));
        assert_eq!(
            cp.endpoints().map(|e| e.control_plane_endpoint.as_str()),
            Some("https://remote.cp")
        );
        assert_eq!(konnect.count(Op::Create), 0);
        assert_eq!(konnect.count(Op::Update), 0);
    }

    fn valid_auth() -> KonnectAPIAuthConfiguration {
        let mut auth = KonnectAPIAuthConfiguration::new(
            "auth",
            KonnectAPIAuthConfigurationSpec {
                token: Some("kpat_valid".into()),
                server_url: Some("eu.api.konghq.com".into()),
                ..Default::default()
            },
        );
        auth.metadata.namespace = Some("default".into());
        set_condition(&mut auth, API_AUTH_VALID, ConditionStatus::True, reasons::VALID, "");
        auth
    }

    /// Stores with a programmed control plane `cp-1` and credentials for it.
    fn authenticated_stores() -> KonnectStores {
        let mut stores = stores_with(vec![programmed(control_plane("cp"), "cp-1", None)], vec![], vec![]);
        stores.auth_configs = store(vec![valid_auth()]);
        stores
    }

    fn holding_finalizer<E: KonnectEntity>(mut obj: E) -> E {
        obj.meta_mut().finalizers = Some(vec![E::FINALIZER.into()]);
        obj
    }

    const CORE: &str = "v2/control-planes/cp-1/core-entities";

    #[tokio::test]
    async fn upstream_outlives_its_targets_in_konnect() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(8);
        let upstreams = format!("{CORE}/upstreams");
        konnect.insert(&upstreams, "up-1", json!({"name": "up.internal"}));
        let up = programmed(upstream("up"), "up-1", Some("cp-1"));
        let mut stores = authenticated_stores();
        stores.targets = store(vec![holding_finalizer(target("t", "up"))]);

        let err = release(&up, &stores, &konnect, &policy).await.unwrap_err();
        assert!(matches!(
            &err,
            Error::DeletionBlocked { dependents } if dependents == &["KongTarget default/t".to_owned()]
        ));
        assert_eq!(konnect.count(Op::Delete), 0);
        assert!(konnect.object(&upstreams, "up-1").is_some());

        // the target released its finalizer
        stores.targets = store(vec![target("t", "up")]);
        assert!(release(&up, &stores, &konnect, &policy).await.unwrap());
        assert_eq!(konnect.count(Op::Delete), 1);
        assert!(konnect.object(&upstreams, "up-1").is_none());
    }

    #[tokio::test]
    async fn service_outlives_its_routes_in_konnect() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(8);
        let services = format!("{CORE}/services");
        konnect.insert(&services, "svc-1", json!({"host": "example.com"}));
        let svc = programmed(service("svc"), "svc-1", Some("cp-1"));
        let mut stores = authenticated_stores();
        stores.routes = store(vec![holding_finalizer(route("r", Some("svc"), None))]);

        assert!(matches!(
            release(&svc, &stores, &konnect, &policy).await,
            Err(Error::DeletionBlocked { .. })
        ));
        assert!(konnect.object(&services, "svc-1").is_some());

        stores.routes = store(vec![]);
        assert!(release(&svc, &stores, &konnect, &policy).await.unwrap());
        assert!(konnect.object(&services, "svc-1").is_none());
    }

    #[tokio::test]
    async fn certificate_outlives_its_snis_in_konnect() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(8);
        let certificates = format!("{CORE}/certificates");
        konnect.insert(&certificates, "cert-1", json!({"cert": "pem"}));
        let cert = programmed(
            KongCertificate {
                metadata: meta("cert"),
                spec: KongCertificateSpec {
                    control_plane_ref: EntityRef::namespaced("cp"),
                    cert: "pem".into(),
                    key: "pem".into(),
                    ..Default::default()
                },
                status: None,
            },
            "cert-1",
            Some("cp-1"),
        );
        let sni = KongSNI {
            metadata: meta("sni"),
            spec: KongSNISpec {
                certificate_ref: NamespacedRef::new("cert"),
                name: "example.com".into(),
                tags: None,
            },
            status: None,
        };
        let mut stores = authenticated_stores();
        stores.snis = store(vec![holding_finalizer(sni)]);

        let err = release(&cert, &stores, &konnect, &policy).await.unwrap_err();
        assert!(matches!(
            &err,
            Error::DeletionBlocked { dependents } if dependents == &["KongSNI default/sni".to_owned()]
        ));
        assert!(konnect.object(&certificates, "cert-1").is_some());

        stores.snis = store(vec![]);
        assert!(release(&cert, &stores, &konnect, &policy).await.unwrap());
        assert!(konnect.object(&certificates, "cert-1").is_none());
    }

    #[tokio::test]
    async fn released_objects_leave_no_failure_count_behind() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(8);
        let svc = programmed(service("svc"), "svc-1", Some("cp-1"));
        let key = failure_key(&svc);
        policy.transient_failure(&key, None);
        policy.transient_failure(&key, None);

        let mut stores = authenticated_stores();
        stores.routes = store(vec![holding_finalizer(route("r", Some("svc"), None))]);
        assert!(release(&svc, &stores, &konnect, &policy).await.is_err());
        assert_eq!(policy.failures.attempts(&key), 2);

        stores.routes = store(vec![]);
        release(&svc, &stores, &konnect, &policy).await.unwrap();
        assert_eq!(policy.failures.attempts(&key), 0);
    }

    #[tokio::test]
    async fn objects_without_credentials_are_released_without_a_konnect_call() {
        let konnect = InMemoryKonnect::new();
        let policy = policy(8);
        let svc = programmed(service("svc"), "svc-1", Some("cp-1"));
        let stores = stores_with(vec![programmed(control_plane("cp"), "cp-1", None)], vec![], vec![]);

        assert!(!release(&svc, &stores, &konnect, &policy).await.unwrap());
        assert!(!release(&service("never-programmed"), &stores, &konnect, &policy).await.unwrap());
        assert!(konnect.credentials_used().is_empty());
        assert_eq!(konnect.count(Op::Delete), 0);
    }
}
