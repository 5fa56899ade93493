//! The self-signed cluster certificate mounted into every data plane.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::*;

use crate::pki::{self, KeyPairPem, TLS_SECRET_TYPE};
use crate::Error;

use super::{
    apply_if_changed, cluster_certificate_name, delete_child, object_meta, selector_string,
    CLUSTER_CERTIFICATE_PURPOSE, SECRET_PURPOSE_LABEL,
};

pub fn cluster_certificate_selector(dataplane: &str) -> String {
    format!(
        "{},{SECRET_PURPOSE_LABEL}={CLUSTER_CERTIFICATE_PURPOSE}",
        selector_string(dataplane)
    )
}

pub fn cluster_certificate_secret(
    base_metadata: &ObjectMeta,
    dataplane: &str,
    pair: &KeyPairPem,
) -> Secret {
    let mut metadata = object_meta(base_metadata, cluster_certificate_name(dataplane));
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(SECRET_PURPOSE_LABEL.into(), CLUSTER_CERTIFICATE_PURPOSE.into());
    Secret {
        metadata,
        type_: Some(TLS_SECRET_TYPE.into()),
        data: Some(pair.secret_data()),
        ..Default::default()
    }
}

/// The usable key pair stored under `name`, if any.
pub fn stored_certificate(secrets: &[Secret], name: &str) -> Option<KeyPairPem> {
    let secret = secrets.iter().find(|s| s.name_any() == name)?;
    match KeyPairPem::from_secret_data(secret.data.as_ref()) {
        Ok(pair) => Some(pair),
        Err(err) => {
            warn!("Cluster certificate Secret {name} is unusable and will be replaced: {err}");
            None
        }
    }
}

/// Make sure the DataPlane has exactly one cluster certificate Secret and return its name and
/// key pair. Secrets are found by label, leftovers from earlier names are removed.
pub async fn reconcile_cluster_certificate(
    secret_api: &Api<Secret>,
    namespace: &str,
    base_metadata: &ObjectMeta,
    dataplane: &str,
) -> Result<(String, KeyPairPem), Error> {
    let selector = cluster_certificate_selector(dataplane);
    let secrets = secret_api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;
    let name = cluster_certificate_name(dataplane);

    for stale in secrets.iter().filter(|s| s.name_any() != name) {
        delete_child(secret_api, namespace, &stale.name_any()).await?;
    }

    let pair = match stored_certificate(&secrets, &name) {
        Some(pair) => pair,
        None => {
            info!("Generating cluster certificate Secret {name} in namespace {namespace}");
            let pair = pki::generate_client_certificate(&format!("{dataplane}.{namespace}"))?;
            apply_if_changed(
                secret_api,
                namespace,
                cluster_certificate_secret(base_metadata, dataplane, &pair),
            )
            .await?;
            pair
        }
    };
    Ok((name, pair))
}
