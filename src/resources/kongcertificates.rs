use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::konnect::entity::{entity_tags, id_ref, strip_nulls};
use crate::konnect::{
    DependencyKind, DependencyResolvable, EntityReference, KonnectEntity, Parents,
};
use crate::resources::common::{
    konnect_entity_status, AdoptOptions, EntityRef, KonnectEntityStatus, NamespacedRef,
};
use crate::resources::kongservices::{
    control_plane_reference, core_entities, validate_control_plane_ref,
};

pub static KONG_CERTIFICATE_FINALIZER: &str = "konnect.konghq.com/kongcertificate";
pub static KONG_SNI_FINALIZER: &str = "konnect.konghq.com/kongsni";

/// A TLS certificate served by the gateway
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongCertificate",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongCertificateSpec {
    pub control_plane_ref: EntityRef,
    pub adopt: Option<AdoptOptions>,
    /// PEM-encoded certificate
    pub cert: String,
    /// PEM-encoded private key
    pub key: String,
    #[serde(rename = "cert_alt")]
    pub cert_alt: Option<String>,
    #[serde(rename = "key_alt")]
    pub key_alt: Option<String>,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongCertificate, KonnectEntityStatus);

impl DependencyResolvable for KongCertificate {
    fn references(&self) -> Vec<EntityReference> {
        control_plane_reference(&self.spec.control_plane_ref, &self.namespace().unwrap_or_default())
            .into_iter()
            .collect()
    }
}

impl KonnectEntity for KongCertificate {
    const FINALIZER: &'static str = KONG_CERTIFICATE_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = Some(DependencyKind::Certificate);

    fn validate(&self) -> Result<(), String> {
        if self.spec.cert_alt.is_some() != self.spec.key_alt.is_some() {
            return Err("cert_alt and key_alt must be set together".into());
        }
        validate_control_plane_ref(&self.spec.control_plane_ref)
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "certificates"))
    }

    fn payload(&self, _parents: &Parents) -> Value {
        let spec = &self.spec;
        strip_nulls(json!({
            "cert": spec.cert,
            "key": spec.key,
            "cert_alt": spec.cert_alt,
            "key_alt": spec.key_alt,
            "tags": entity_tags(self, spec.tags.as_deref()),
        }))
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }
}

/// A server name the parent KongCertificate is served for
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongSNI",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Name", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongSNISpec {
    /// KongCertificate in the same namespace
    pub certificate_ref: NamespacedRef,
    pub name: String,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongSNI, KonnectEntityStatus);

impl DependencyResolvable for KongSNI {
    fn references(&self) -> Vec<EntityReference> {
        let certificate = NamespacedRef::new(self.spec.certificate_ref.name.clone());
        vec![EntityReference::namespaced(
            DependencyKind::Certificate,
            &certificate,
            &self.namespace().unwrap_or_default(),
        )
        .parent()]
    }
}

impl KonnectEntity for KongSNI {
    const FINALIZER: &'static str = KONG_SNI_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = None;

    fn collection(&self, parents: &Parents) -> Option<String> {
        parents.get(DependencyKind::Certificate)?;
        Some(core_entities(parents.control_plane_id()?, "snis"))
    }

    fn payload(&self, parents: &Parents) -> Value {
        json!({
            "name": self.spec.name,
            "certificate": id_ref(parents.get(DependencyKind::Certificate)),
            "tags": entity_tags(self, self.spec.tags.as_deref()),
        })
    }
}
