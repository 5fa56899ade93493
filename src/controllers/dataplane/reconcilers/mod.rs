use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hasher;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::*;

use crate::controllers::{MANAGED_BY_LABEL, MANAGER};
use crate::diff::differs;
use crate::Error;

pub mod certificate;
pub mod scaling;
pub mod synthesizer;

/// Value is the name of the owning DataPlane
pub const DATAPLANE_LABEL: &str = "gateway-operator.konghq.com/dataplane";
/// `ingress` or `admin` on Services
pub const SERVICE_TYPE_LABEL: &str = "gateway-operator.konghq.com/dataplane-service-type";
/// What a Secret is used for
pub const SECRET_PURPOSE_LABEL: &str = "gateway-operator.konghq.com/secret-purpose";

pub const INGRESS_SERVICE_TYPE: &str = "ingress";
pub const ADMIN_SERVICE_TYPE: &str = "admin";
pub const CLUSTER_CERTIFICATE_PURPOSE: &str = "cluster-certificate";
/// Digest of the object as last applied; removed fields do not show up as drift otherwise
pub const SPEC_HASH_ANNOTATION: &str = "gateway-operator.konghq.com/spec-hash";

// mandatory_labels are applied to every child of a DataPlane; the Deployment selector is built
// from them, so they must never change
pub fn mandatory_labels(dataplane: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (MANAGED_BY_LABEL.into(), MANAGER.into()),
        (DATAPLANE_LABEL.into(), dataplane.into()),
    ])
}

pub fn label_selector(dataplane: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(mandatory_labels(dataplane)),
        match_expressions: None,
    }
}

/// `k=v,k=v` form of the selector, as used by list calls and the scale subresource.
pub fn selector_string(dataplane: &str) -> String {
    mandatory_labels(dataplane)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn object_meta(base_metadata: &ObjectMeta, name: impl Into<String>) -> ObjectMeta {
    let mut meta = base_metadata.clone();
    meta.name = Some(name.into());
    let dataplane = base_metadata.name.clone().unwrap_or_default();
    meta.labels
        .get_or_insert_with(Default::default)
        .extend(mandatory_labels(&dataplane));
    meta
}

pub fn deployment_name(dataplane: &str) -> String {
    format!("dataplane-{dataplane}")
}

pub fn ingress_service_name(dataplane: &str) -> String {
    format!("dataplane-ingress-{dataplane}")
}

pub fn admin_service_name(dataplane: &str) -> String {
    format!("dataplane-admin-{dataplane}")
}

pub fn cluster_certificate_name(dataplane: &str) -> String {
    format!("dataplane-{dataplane}-cluster-cert")
}

fn with_spec_hash<K: Resource + Serialize>(mut obj: K) -> Result<K, Error> {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(serde_json::to_string(&obj)?.as_bytes());
    obj.annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.into(), format!("{:016x}", hasher.finish()));
    Ok(obj)
}

/// Server-side apply `desired` unless the live object already holds every field it sets.
pub async fn apply_if_changed<K>(api: &Api<K>, namespace: &str, desired: K) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let desired = with_spec_hash(desired)?;
    let name = desired.name_any();
    if let Some(observed) = api.get_opt(&name).await? {
        if !differs(&serde_json::to_value(&desired)?, &serde_json::to_value(&observed)?) {
            trace!("{} {name} in namespace {namespace} is up to date", K::kind(&()));
            return Ok(observed);
        }
    }
    let params = PatchParams::apply(MANAGER).force();
    debug!("Applying {} {name} in namespace {namespace}", K::kind(&()));
    Ok(api.patch(&name, &params, &Patch::Apply(&desired)).await?)
}

pub async fn delete_child<K>(api: &Api<K>, namespace: &str, name: &str) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    debug!(
        "Ensuring {} {name} in namespace {namespace} does not exist",
        K::kind(&())
    );
    match api.delete(name, &DeleteParams::default()).await {
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
        Err(err) => Err(err.into()),
        Ok(_) => Ok(()),
    }
}

/// Delete the objects matching `selector` that are not named in `keep`.
pub async fn delete_stale<K>(
    api: &Api<K>,
    namespace: &str,
    selector: &str,
    keep: &[String],
) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    let children = api
        .list_metadata(&ListParams::default().labels(selector))
        .await?;
    for child in children.items {
        let name = child.name_any();
        if !keep.contains(&name) {
            info!(
                "Deleting stale {} {name} in namespace {namespace}",
                K::kind(&())
            );
            delete_child(api, namespace, &name).await?;
        }
    }
    Ok(())
}
