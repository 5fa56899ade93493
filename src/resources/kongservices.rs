use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::konnect::entity::{entity_tags, strip_nulls};
use crate::konnect::{
    DependencyKind, DependencyResolvable, EntityReference, KonnectEntity, Parents,
};
use crate::resources::common::{
    konnect_entity_status, AdoptOptions, EntityRef, KonnectEntityStatus,
};

pub static KONG_SERVICE_FINALIZER: &str = "konnect.konghq.com/kongservice";

/// An upstream service proxied by the gateway
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongService",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#,
    printcolumn = r#"{"name":"ID", "type":"string", "priority": 1, "jsonPath":".status.id"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongServiceSpec {
    pub control_plane_ref: EntityRef,
    pub adopt: Option<AdoptOptions>,
    pub name: Option<String>,
    pub host: String,
    pub port: Option<i32>,
    pub protocol: Option<String>,
    pub path: Option<String>,
    pub retries: Option<i32>,
    pub connect_timeout: Option<i64>,
    pub read_timeout: Option<i64>,
    pub write_timeout: Option<i64>,
    pub enabled: Option<bool>,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongService, KonnectEntityStatus);

impl DependencyResolvable for KongService {
    fn references(&self) -> Vec<EntityReference> {
        control_plane_reference(&self.spec.control_plane_ref, &self.namespace().unwrap_or_default())
            .into_iter()
            .collect()
    }
}

impl KonnectEntity for KongService {
    const FINALIZER: &'static str = KONG_SERVICE_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = Some(DependencyKind::Service);

    fn validate(&self) -> Result<(), String> {
        if self.spec.host.is_empty() {
            return Err("host must not be empty".into());
        }
        validate_control_plane_ref(&self.spec.control_plane_ref)
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "services"))
    }

    fn payload(&self, _parents: &Parents) -> Value {
        let spec = &self.spec;
        strip_nulls(json!({
            "name": spec.name,
            "host": spec.host,
            "port": spec.port,
            "protocol": spec.protocol,
            "path": spec.path,
            "retries": spec.retries,
            "connect_timeout": spec.connect_timeout,
            "read_timeout": spec.read_timeout,
            "write_timeout": spec.write_timeout,
            "enabled": spec.enabled,
            "tags": entity_tags(self, spec.tags.as_deref()),
        }))
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }
}

/// Path of a core entity collection inside a control plane.
pub(crate) fn core_entities(control_plane_id: &str, collection: &str) -> String {
    format!("v2/control-planes/{control_plane_id}/core-entities/{collection}")
}

/// The control plane reference of an entity, if it is well formed.
pub(crate) fn control_plane_reference(r: &EntityRef, namespace: &str) -> Option<EntityReference> {
    use crate::konnect::RefTarget;
    use crate::resources::common::RefType;

    let target = match r.r#type {
        RefType::NamespacedRef => {
            let named = r.namespaced_ref.as_ref()?;
            RefTarget::Namespaced {
                namespace: named.namespace_or(namespace).to_owned(),
                name: named.name.clone(),
            }
        }
        RefType::KonnectId => RefTarget::KonnectId(r.konnect_id.clone()?),
    };
    Some(EntityReference {
        kind: DependencyKind::ControlPlane,
        target,
        is_parent: false,
    })
}

pub(crate) fn validate_control_plane_ref(r: &EntityRef) -> Result<(), String> {
    use crate::resources::common::RefType;

    match r.r#type {
        RefType::NamespacedRef if r.namespaced_ref.is_none() => {
            Err("controlPlaneRef.namespacedRef is required when type is namespacedRef".into())
        }
        RefType::KonnectId if r.konnect_id.is_none() => {
            Err("controlPlaneRef.konnectID is required when type is konnectID".into())
        }
        _ => Ok(()),
    }
}
