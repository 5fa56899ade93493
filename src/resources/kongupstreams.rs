use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::konnect::entity::{entity_tags, strip_nulls};
use crate::konnect::{
    DependencyKind, DependencyResolvable, EntityReference, KonnectEntity, Parents,
};
use crate::resources::common::{
    konnect_entity_status, AdoptOptions, EntityRef, KonnectEntityStatus, NamespacedRef,
};
use crate::resources::kongservices::{
    control_plane_reference, core_entities, validate_control_plane_ref,
};

pub static KONG_UPSTREAM_FINALIZER: &str = "konnect.konghq.com/kongupstream";
pub static KONG_TARGET_FINALIZER: &str = "konnect.konghq.com/kongtarget";

/// A load-balanced virtual hostname
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongUpstream",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongUpstreamSpec {
    pub control_plane_ref: EntityRef,
    pub adopt: Option<AdoptOptions>,
    pub name: String,
    /// round-robin, consistent-hashing, least-connections or latency
    pub algorithm: Option<String>,
    pub slots: Option<i32>,
    pub hash_on: Option<String>,
    pub host_header: Option<String>,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongUpstream, KonnectEntityStatus);

impl DependencyResolvable for KongUpstream {
    fn references(&self) -> Vec<EntityReference> {
        control_plane_reference(&self.spec.control_plane_ref, &self.namespace().unwrap_or_default())
            .into_iter()
            .collect()
    }
}

impl KonnectEntity for KongUpstream {
    const FINALIZER: &'static str = KONG_UPSTREAM_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = Some(DependencyKind::Upstream);

    fn validate(&self) -> Result<(), String> {
        validate_control_plane_ref(&self.spec.control_plane_ref)
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "upstreams"))
    }

    fn payload(&self, _parents: &Parents) -> Value {
        let spec = &self.spec;
        strip_nulls(json!({
            "name": spec.name,
            "algorithm": spec.algorithm,
            "slots": spec.slots,
            "hash_on": spec.hash_on,
            "host_header": spec.host_header,
            "tags": entity_tags(self, spec.tags.as_deref()),
        }))
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }
}

/// A backend address of a KongUpstream
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongTarget",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.target"}"#,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongTargetSpec {
    /// KongUpstream in the same namespace
    pub upstream_ref: NamespacedRef,
    /// host:port of the backend
    pub target: String,
    pub weight: Option<i32>,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongTarget, KonnectEntityStatus);

impl DependencyResolvable for KongTarget {
    fn references(&self) -> Vec<EntityReference> {
        let upstream = NamespacedRef::new(self.spec.upstream_ref.name.clone());
        vec![EntityReference::namespaced(
            DependencyKind::Upstream,
            &upstream,
            &self.namespace().unwrap_or_default(),
        )
        .parent()]
    }
}

impl KonnectEntity for KongTarget {
    const FINALIZER: &'static str = KONG_TARGET_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = None;

    fn validate(&self) -> Result<(), String> {
        if self.spec.target.is_empty() {
            return Err("target must not be empty".into());
        }
        if matches!(self.spec.weight, Some(w) if !(0..=65535).contains(&w)) {
            return Err("weight must be between 0 and 65535".into());
        }
        Ok(())
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        let upstream = parents.get(DependencyKind::Upstream)?;
        Some(format!(
            "{}/{upstream}/targets",
            core_entities(parents.control_plane_id()?, "upstreams")
        ))
    }

    fn payload(&self, _parents: &Parents) -> Value {
        strip_nulls(json!({
            "target": self.spec.target,
            "weight": self.spec.weight,
            "tags": entity_tags(self, self.spec.tags.as_deref()),
        }))
    }
}
