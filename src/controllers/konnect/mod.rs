//! Reconcilers for KonnectAPIAuthConfigurations and every kind of Konnect entity.

use std::fmt::Debug;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::*;

use crate::konnect::KonnectApiFactory;
use crate::resources::kongcertificates::{KongCertificate, KongSNI};
use crate::resources::kongconsumers::{KongConsumer, KongConsumerGroup};
use crate::resources::kongplugins::{KongPlugin, KongPluginBinding};
use crate::resources::kongroutes::KongRoute;
use crate::resources::kongservices::KongService;
use crate::resources::kongupstreams::{KongTarget, KongUpstream};
use crate::resources::kongvaults::KongVault;
use crate::resources::konnectapiauthconfigurations::{
    KonnectAPIAuthConfiguration, CREDENTIAL_LABEL, CREDENTIAL_LABEL_VALUE,
};
use crate::resources::konnectgatewaycontrolplanes::KonnectGatewayControlPlane;
use crate::{Metrics, State};

use super::{changed_predicate, ensure_deletion_change, konnectextension};

pub mod apiauth;
pub mod controller;
pub mod resolver;
pub mod sync;

pub(crate) use controller::Context;
pub use resolver::KonnectStores;

/// A reflector that feeds a store and yields objects whose spec, labels, annotations or
/// deletion state changed.
fn reflect<K>(
    api: Api<K>,
    cfg: Config,
) -> (
    Store<K>,
    impl Stream<Item = Result<K, watcher::Error>> + Send + 'static,
)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (store, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, cfg))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);
    (store, stream)
}

/// Run every Konnect controller until shutdown.
pub async fn run<F: KonnectApiFactory>(client: Client, metrics: Metrics, state: State, konnect: F) {
    let control_planes = Api::<KonnectGatewayControlPlane>::all(client.clone());
    if let Err(e) = control_planes.list(&ListParams::default().limit(1)).await {
        error!("KonnectGatewayControlPlane is not queryable; {e:?}. Are the CRDs installed?");
        std::process::exit(1);
    }

    let cfg = Config::default();
    let config = ControllerConfig::default().concurrency(state.controller_concurrency);

    let (auth_store, auth_stream) =
        reflect(Api::<KonnectAPIAuthConfiguration>::all(client.clone()), cfg.clone());
    let (cp_store, cp_stream) = reflect(control_planes, cfg.clone());
    let (service_store, service_stream) =
        reflect(Api::<KongService>::all(client.clone()), cfg.clone());
    let (route_store, route_stream) = reflect(Api::<KongRoute>::all(client.clone()), cfg.clone());
    let (consumer_store, consumer_stream) =
        reflect(Api::<KongConsumer>::all(client.clone()), cfg.clone());
    let (group_store, group_stream) =
        reflect(Api::<KongConsumerGroup>::all(client.clone()), cfg.clone());
    let (upstream_store, upstream_stream) =
        reflect(Api::<KongUpstream>::all(client.clone()), cfg.clone());
    let (target_store, target_stream) =
        reflect(Api::<KongTarget>::all(client.clone()), cfg.clone());
    let (vault_store, vault_stream) = reflect(Api::<KongVault>::all(client.clone()), cfg.clone());
    let (certificate_store, certificate_stream) =
        reflect(Api::<KongCertificate>::all(client.clone()), cfg.clone());
    let (sni_store, sni_stream) = reflect(Api::<KongSNI>::all(client.clone()), cfg.clone());
    let (binding_store, binding_stream) =
        reflect(Api::<KongPluginBinding>::all(client.clone()), cfg.clone());

    // plugins are never reconciled on their own, bindings read them from the store
    let (plugin_store, plugin_writer) = reflector::store();
    let plugin_reflector = reflector(
        plugin_writer,
        watcher(Api::<KongPlugin>::all(client.clone()), cfg.clone()),
    )
    .touched_objects()
    .default_backoff()
    .for_each(|_| futures::future::ready(()));

    // credential secrets are only read through the store
    let (secret_store, secret_writer) = reflector::store();
    let secret_reflector = reflector(
        secret_writer,
        watcher(
            Api::<Secret>::all(client.clone()),
            Config::default().labels(&format!("{CREDENTIAL_LABEL}={CREDENTIAL_LABEL_VALUE}")),
        ),
    )
    .touched_objects()
    .default_backoff();

    let stores = KonnectStores {
        auth_configs: auth_store.clone(),
        control_planes: cp_store.clone(),
        services: service_store.clone(),
        routes: route_store.clone(),
        consumers: consumer_store.clone(),
        upstreams: upstream_store.clone(),
        targets: target_store.clone(),
        certificates: certificate_store.clone(),
        snis: sni_store.clone(),
        plugins: plugin_store,
        bindings: binding_store.clone(),
        secrets: secret_store,
    };
    let ctx = Context::new(client.clone(), metrics, &state, stores, konnect);

    info!("Starting Konnect controllers");
    tokio::join!(
        plugin_reflector,
        apiauth::run(
            auth_stream,
            auth_store,
            secret_reflector,
            ctx.clone(),
            config.clone()
        ),
        controller::run_entity(cp_stream, cp_store, ctx.clone(), config.clone()),
        controller::run_entity(service_stream, service_store, ctx.clone(), config.clone()),
        controller::run_entity(route_stream, route_store, ctx.clone(), config.clone()),
        controller::run_entity(consumer_stream, consumer_store, ctx.clone(), config.clone()),
        controller::run_entity(group_stream, group_store, ctx.clone(), config.clone()),
        controller::run_entity(upstream_stream, upstream_store, ctx.clone(), config.clone()),
        controller::run_entity(target_stream, target_store, ctx.clone(), config.clone()),
        controller::run_entity(vault_stream, vault_store, ctx.clone(), config.clone()),
        controller::run_entity(
            certificate_stream,
            certificate_store,
            ctx.clone(),
            config.clone()
        ),
        controller::run_entity(sni_stream, sni_store, ctx.clone(), config.clone()),
        controller::run_entity(binding_stream, binding_store, ctx.clone(), config.clone()),
        konnectextension::run(client, ctx, config),
    );
}

