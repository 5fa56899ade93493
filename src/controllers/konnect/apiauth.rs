//! Validates KonnectAPIAuthConfigurations against the Konnect organization they grant access to.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::Resource;
use regex::Regex;
use tracing::*;

use crate::backoff::RequeuePolicy;
use crate::conditions::{is_condition_true, reasons, set_condition, ConditionStatus, API_AUTH_VALID};
use crate::controllers::{status_patch, MANAGER};
use crate::konnect::{Credentials, KonnectApi, KonnectApiFactory, KonnectEntity, KonnectError};
use crate::resources::konnectapiauthconfigurations::{
    KonnectAPIAuthConfiguration, KONNECT_API_AUTH_CONFIGURATION_FINALIZER,
};
use crate::resources::konnectgatewaycontrolplanes::KonnectGatewayControlPlane;
use crate::{telemetry, Error, Result};

use super::controller::Context;
use super::resolver::KonnectStores;

/// Personal (`kpat_`) and system account (`spat_`) access tokens.
pub fn validate_token(token: &str) -> Result<(), String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let pattern = REGEX.get_or_init(|| Regex::new(r"^(kpat|spat)_[0-9A-Za-z]+$").unwrap());
    if pattern.is_match(token) {
        Ok(())
    } else {
        Err("the token must be a Konnect personal (kpat_) or system account (spat_) access token".into())
    }
}

pub(crate) fn credentials(
    auth: &KonnectAPIAuthConfiguration,
    secrets: &Store<Secret>,
) -> Result<Credentials> {
    let token = auth.token(secrets)?;
    validate_token(&token).map_err(|message| Error::InvalidEntity {
        reason: reasons::INVALID_CREDENTIALS.into(),
        message,
    })?;
    Ok(Credentials {
        server_url: auth.server_url()?,
        token,
    })
}

fn auth_not_ready(message: String) -> Error {
    Error::NotReady {
        message,
        reason: reasons::AUTH_REF_NOT_READY.into(),
        requeue_after: None,
    }
}

/// Credentials of a validated auth configuration, with the organization it belongs to.
///
/// Anything short of a valid configuration is `Error::NotReady`.
pub(crate) fn usable_credentials(
    stores: &KonnectStores,
    namespace: &str,
    name: &str,
) -> Result<(Credentials, Option<String>)> {
    let auth = stores
        .auth_configs
        .get(&ObjectRef::new(name).within(namespace))
        .ok_or_else(|| {
            auth_not_ready(format!(
                "KonnectAPIAuthConfiguration {namespace}/{name} does not exist"
            ))
        })?;
    if !is_condition_true(auth.as_ref(), API_AUTH_VALID) {
        return Err(auth_not_ready(format!(
            "KonnectAPIAuthConfiguration {namespace}/{name} is not valid"
        )));
    }
    let credentials = credentials(&auth, &stores.secrets).map_err(|err| match err {
        Error::SecretNotFound(_)
        | Error::SecretKeyNotFound(_, _)
        | Error::InvalidEntity { .. }
        | Error::InvalidUrl(_) => auth_not_ready(err.to_string()),
        err => err,
    })?;
    let organization_id = auth.status.as_ref().and_then(|s| s.organization_id.clone());
    Ok((credentials, organization_id))
}

/// Ask Konnect who the token belongs to and record the answer in `auth`'s status.
pub(crate) async fn check<F: KonnectApiFactory>(
    auth: &mut KonnectAPIAuthConfiguration,
    secrets: &Store<Secret>,
    konnect: &F,
    policy: &RequeuePolicy,
    key: &str,
) -> Action {
    let credentials = match credentials(auth, secrets) {
        Ok(credentials) => credentials,
        Err(err) => {
            info!("KonnectAPIAuthConfiguration {} is unusable: {err}", auth.name_any());
            set_condition(
                auth,
                API_AUTH_VALID,
                ConditionStatus::False,
                reasons::INVALID_CREDENTIALS,
                err.to_string(),
            );
            auth.status.get_or_insert_with(Default::default).organization_id = None;
            return Action::requeue(policy.intervals.dependency);
        }
    };

    auth.status.get_or_insert_with(Default::default).server_url =
        Some(credentials.server_url.to_string());
    match konnect.api_for(&credentials).current_organization().await {
        Ok(organization) => {
            policy.succeeded(key);
            set_condition(
                auth,
                API_AUTH_VALID,
                ConditionStatus::True,
                reasons::VALID,
                format!(
                    "Token is valid for Konnect organization {} (ID: {})",
                    organization.name, organization.id
                ),
            );
            auth.status.get_or_insert_with(Default::default).organization_id = Some(organization.id);
            Action::requeue(policy.intervals.resync)
        }
        Err(err @ KonnectError::Unauthorized { .. }) => {
            policy.succeeded(key);
            set_condition(
                auth,
                API_AUTH_VALID,
                ConditionStatus::False,
                reasons::INVALID_TOKEN,
                err.to_string(),
            );
            auth.status.get_or_insert_with(Default::default).organization_id = None;
            Action::requeue(policy.intervals.slow)
        }
        Err(err) if err.is_retryable() => {
            warn!("Could not validate KonnectAPIAuthConfiguration {}: {err}", auth.name_any());
            let retry_after = match err {
                KonnectError::RateLimited { retry_after } => retry_after,
                _ => None,
            };
            let (delay, degraded) = policy.transient_failure(key, retry_after);
            if degraded {
                set_condition(
                    auth,
                    API_AUTH_VALID,
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
                auth,
                API_AUTH_VALID,
                ConditionStatus::False,
                reasons::KONNECT_API_OP_FAILED,
                err.to_string(),
            );
            Action::requeue(policy.intervals.slow)
        }
    }
}

/// Control planes that authenticate with this configuration and are still being cleaned up.
fn dependents(stores: &KonnectStores, namespace: &str, name: &str) -> Vec<String> {
    let mut found: Vec<String> = stores
        .control_planes
        .state()
        .into_iter()
        .filter(|cp| {
            cp.namespace().as_deref() == Some(namespace)
                && cp.spec.konnect.api_auth_configuration_ref.name == name
                && cp
                    .finalizers()
                    .iter()
                    .any(|f| f == KonnectGatewayControlPlane::FINALIZER)
        })
        .map(|cp| cp.display_name())
        .collect();
    found.sort();
    found
}

#[instrument(skip(ctx, auth), fields(trace_id))]
async fn reconcile<F: KonnectApiFactory>(
    auth: Arc<KonnectAPIAuthConfiguration>,
    ctx: Arc<Context<F>>,
) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<KonnectAPIAuthConfiguration>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = auth.namespace().unwrap_or_default();
    let api: Api<KonnectAPIAuthConfiguration> = Api::namespaced(ctx.client.clone(), &namespace);

    info!("Reconciling KonnectAPIAuthConfiguration {namespace}/{}", auth.name_any());
    match finalizer(
        &api,
        KONNECT_API_AUTH_CONFIGURATION_FINALIZER,
        auth.clone(),
        |event| async {
            match event {
                Finalizer::Apply(auth) => apply(auth, ctx.clone()).await,
                Finalizer::Cleanup(auth) => cleanup(auth, ctx.clone()).await,
            }
        },
    )
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
                    &auth.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(auth.as_ref(), &err);
            Err(err)
        }
    }
}

async fn apply<F: KonnectApiFactory>(
    auth: Arc<KonnectAPIAuthConfiguration>,
    ctx: Arc<Context<F>>,
) -> Result<Action> {
    let mut checked = auth.as_ref().clone();
    let action = check(
        &mut checked,
        &ctx.stores.secrets,
        &ctx.konnect,
        &ctx.policy,
        &failure_key(&auth),
    )
    .await;
    let status = checked.status.get_or_insert_with(Default::default);
    status.observed_generation = checked.metadata.generation;

    if auth.status != checked.status {
        let api: Api<KonnectAPIAuthConfiguration> =
            Api::namespaced(ctx.client.clone(), &auth.namespace().unwrap_or_default());
        api.patch_status(
            &auth.name_any(),
            &PatchParams::apply(MANAGER).force(),
            &Patch::Apply(status_patch(auth.as_ref(), &checked.status)),
        )
        .await?;
    }
    Ok(action)
}

async fn cleanup<F: KonnectApiFactory>(
    auth: Arc<KonnectAPIAuthConfiguration>,
    ctx: Arc<Context<F>>,
) -> Result<Action> {
    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", auth.name_any())),
                action: "Deleting".into(),
                secondary: None,
            },
            &auth.object_ref(&()),
        )
        .await?;

    release(&auth, &ctx.stores, &ctx.policy)?;
    Ok(Action::await_change())
}

fn failure_key(auth: &KonnectAPIAuthConfiguration) -> String {
    format!(
        "KonnectAPIAuthConfiguration/{}/{}",
        auth.namespace().unwrap_or_default(),
        auth.name_any()
    )
}

/// Let a deleted configuration go once no control plane authenticates with it.
fn release(
    auth: &KonnectAPIAuthConfiguration,
    stores: &KonnectStores,
    policy: &RequeuePolicy,
) -> Result<()> {
    let dependents = dependents(stores, &auth.namespace().unwrap_or_default(), &auth.name_any());
    if !dependents.is_empty() {
        return Err(Error::DeletionBlocked { dependents });
    }
    policy.succeeded(&failure_key(auth));
    Ok(())
}

fn error_policy<F: KonnectApiFactory>(
    _auth: Arc<KonnectAPIAuthConfiguration>,
    err: &Error,
    ctx: Arc<Context<F>>,
) -> Action {
    match err.inner() {
        err if err.is_conflict() => Action::requeue(std::time::Duration::from_secs(1)),
        Error::DeletionBlocked { .. } => Action::requeue(ctx.policy.intervals.dependency),
        _ => Action::requeue(std::time::Duration::from_secs(30)),
    }
}

/// Run the KonnectAPIAuthConfiguration controller. Changes to credential Secrets requeue the
/// configurations that reference them.
pub(crate) async fn run<F, S, W>(
    stream: S,
    store: Store<KonnectAPIAuthConfiguration>,
    secrets: W,
    ctx: Arc<Context<F>>,
    config: controller::Config,
) where
    F: KonnectApiFactory,
    S: Stream<Item = Result<KonnectAPIAuthConfiguration, watcher::Error>> + Send + 'static,
    W: Stream<Item = Result<Secret, watcher::Error>> + Send + 'static,
{
    let referencing = store.clone();
    Controller::for_stream(stream, store)
        .with_config(config)
        .shutdown_on_signal()
        .watches_stream(secrets, move |secret| {
            let namespace = secret.namespace().unwrap_or_default();
            let name = secret.name_any();
            referencing
                .state()
                .into_iter()
                .filter(move |auth| {
                    auth.spec.secret_ref.as_ref().is_some_and(|r| {
                        r.name == name
                            && r.namespace_or(auth.namespace().as_deref().unwrap_or_default())
                                == namespace
                    })
                })
                .map(|auth| ObjectRef::from_obj(auth.as_ref()))
        })
        .run(reconcile::<F>, error_policy::<F>, ctx)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RequeueIntervals;
    use crate::conditions::get_condition;
    use crate::controllers::konnect::resolver::tests::{control_plane, store, stores_with};
    use crate::konnect::testing::{InMemoryKonnect, Op};
    use crate::resources::konnectapiauthconfigurations::KonnectAPIAuthConfigurationSpec;
    use std::time::Duration;

    fn auth(token: &str) -> KonnectAPIAuthConfiguration {
        let mut auth = KonnectAPIAuthConfiguration::new(
            "auth",
            KonnectAPIAuthConfigurationSpec {
                token: Some(token.into()),
                server_url: Some("eu.api.konghq.com".into()),
                ..Default::default()
            },
        );
        auth.metadata.namespace = Some("default".into());
        auth.metadata.generation = Some(1);
        auth
    }

    #[test]
    fn token_format() {
        assert!(validate_token("kpat_0123abcXYZ").is_ok());
        assert!(validate_token("spat_abc").is_ok());
        assert!(validate_token("kpat_").is_err());
        assert!(validate_token("token_abc").is_err());
        assert!(validate_token("kpat_abc def").is_err());
    }

    #[tokio::test]
    async fn valid_token_publishes_organization() {
        let konnect = InMemoryKonnect::new();
        let policy = RequeuePolicy::default();
        let mut auth = auth("kpat_valid");

        let action = check(&mut auth, &store(vec![]), &konnect, &policy, "auth").await;
        assert_eq!(action, Action::requeue(policy.intervals.resync));
        assert!(is_condition_true(&auth, API_AUTH_VALID));
        let status = auth.status.as_ref().unwrap();
        assert_eq!(status.organization_id.as_deref(), Some("org-1"));
        assert_eq!(status.server_url.as_deref(), Some("https://eu.api.konghq.com/"));
        assert_eq!(
            konnect.credentials_used()[0].server_url.as_str(),
            "https://eu.api.konghq.com/"
        );
    }

    #[tokio::test]
    async fn malformed_token_never_reaches_konnect() {
        let konnect = InMemoryKonnect::new();
        let policy = RequeuePolicy::default();
        let mut auth = auth("not-a-token");

        let action = check(&mut auth, &store(vec![]), &konnect, &policy, "auth").await;
        assert_eq!(action, Action::requeue(policy.intervals.dependency));
        let condition = get_condition(&auth, API_AUTH_VALID).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, reasons::INVALID_CREDENTIALS);
        assert_eq!(konnect.count(Op::CurrentOrganization), 0);
    }

    #[tokio::test]
    async fn rejected_token_is_invalid() {
        let konnect = InMemoryKonnect::new();
        konnect.fail_next(
            Op::CurrentOrganization,
            KonnectError::Unauthorized {
                status: 401,
                message: "Invalid credentials".into(),
            },
        );
        let policy = RequeuePolicy::default();
        let mut auth = auth("kpat_revoked");

        let action = check(&mut auth, &store(vec![]), &konnect, &policy, "auth").await;
        assert_eq!(action, Action::requeue(policy.intervals.slow));
        let condition = get_condition(&auth, API_AUTH_VALID).unwrap();
        assert_eq!(condition.reason, reasons::INVALID_TOKEN);
        assert_eq!(auth.status.as_ref().unwrap().organization_id, None);
    }

    #[tokio::test]
    async fn outage_backs_off_without_invalidating() {
        let konnect = InMemoryKonnect::new();
        konnect.fail_next(
            Op::CurrentOrganization,
            KonnectError::Server {
                status: 502,
                message: "bad gateway".into(),
            },
        );
        let policy = RequeuePolicy::new(
            RequeueIntervals::default(),
            crate::backoff::BackoffConfig {
                jitter: 0.0,
                ..Default::default()
            },
        );
        let mut auth = auth("kpat_valid");

        let action = check(&mut auth, &store(vec![]), &konnect, &policy, "auth").await;
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert!(get_condition(&auth, API_AUTH_VALID).is_none());
    }

    #[test]
    fn entities_only_use_validated_configurations() {
        let mut stores = stores_with(vec![], vec![], vec![]);
        let err = usable_credentials(&stores, "default", "auth").unwrap_err();
        assert!(matches!(err, Error::NotReady { ref reason, .. } if reason == reasons::AUTH_REF_NOT_READY));

        let unchecked = auth("kpat_valid");
        stores.auth_configs = store(vec![unchecked.clone()]);
        assert!(usable_credentials(&stores, "default", "auth").is_err());

        let mut valid = unchecked;
        set_condition(&mut valid, API_AUTH_VALID, ConditionStatus::True, reasons::VALID, "");
        valid.status.get_or_insert_with(Default::default).organization_id = Some("org-1".into());
        stores.auth_configs = store(vec![valid]);
        let (credentials, organization) = usable_credentials(&stores, "default", "auth").unwrap();
        assert_eq!(credentials.token, "kpat_valid");
        assert_eq!(organization.as_deref(), Some("org-1"));
    }

    #[test]
    fn deletion_waits_for_control_planes_using_it() {
        let mut cp = control_plane("cp");
        cp.metadata.finalizers = Some(vec![KonnectGatewayControlPlane::FINALIZER.into()]);
        let mut released = control_plane("released");
        released.spec.konnect.api_auth_configuration_ref.name = "auth".into();
        let stores = stores_with(vec![cp, released], vec![], vec![]);

        assert_eq!(
            dependents(&stores, "default", "auth"),
            vec!["KonnectGatewayControlPlane default/cp".to_owned()]
        );
        assert!(dependents(&stores, "default", "other").is_empty());
    }

    #[test]
    fn released_configuration_forgets_its_failures() {
        let policy = RequeuePolicy::default();
        let auth = auth("kpat_valid");
        policy.transient_failure(&failure_key(&auth), None);

        let mut cp = control_plane("cp");
        cp.metadata.finalizers = Some(vec![KonnectGatewayControlPlane::FINALIZER.into()]);
        let stores = stores_with(vec![cp], vec![], vec![]);
        assert!(matches!(
            release(&auth, &stores, &policy),
            Err(Error::DeletionBlocked { .. })
        ));
        assert_eq!(policy.failures.attempts(&failure_key(&auth)), 1);

        release(&auth, &stores_with(vec![], vec![], vec![]), &policy).unwrap();
        assert_eq!(policy.failures.attempts(&failure_key(&auth)), 0);
    }
}
