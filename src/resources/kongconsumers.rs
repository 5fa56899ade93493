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
use crate::resources::kongservices::{
    control_plane_reference, core_entities, validate_control_plane_ref,
};

pub static KONG_CONSUMER_FINALIZER: &str = "konnect.konghq.com/kongconsumer";
pub static KONG_CONSUMER_GROUP_FINALIZER: &str = "konnect.konghq.com/kongconsumergroup";

/// A consumer of the proxied services
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongConsumer",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Username", "type":"string", "jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongConsumerSpec {
    pub control_plane_ref: EntityRef,
    pub adopt: Option<AdoptOptions>,
    pub username: Option<String>,
    #[serde(rename = "custom_id")]
    pub custom_id: Option<String>,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongConsumer, KonnectEntityStatus);

impl DependencyResolvable for KongConsumer {
    fn references(&self) -> Vec<EntityReference> {
        control_plane_reference(&self.spec.control_plane_ref, &self.namespace().unwrap_or_default())
            .into_iter()
            .collect()
    }
}

impl KonnectEntity for KongConsumer {
    const FINALIZER: &'static str = KONG_CONSUMER_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = Some(DependencyKind::Consumer);

    fn validate(&self) -> Result<(), String> {
        if self.spec.username.is_none() && self.spec.custom_id.is_none() {
            return Err("one of username or custom_id must be set".into());
        }
        validate_control_plane_ref(&self.spec.control_plane_ref)
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "consumers"))
    }

    fn payload(&self, _parents: &Parents) -> Value {
        strip_nulls(json!({
            "username": self.spec.username,
            "custom_id": self.spec.custom_id,
            "tags": entity_tags(self, self.spec.tags.as_deref()),
        }))
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }
}

/// A named group of consumers
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongConsumerGroup",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongConsumerGroupSpec {
    pub control_plane_ref: EntityRef,
    pub adopt: Option<AdoptOptions>,
    pub name: String,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongConsumerGroup, KonnectEntityStatus);

impl DependencyResolvable for KongConsumerGroup {
    fn references(&self) -> Vec<EntityReference> {
        control_plane_reference(&self.spec.control_plane_ref, &self.namespace().unwrap_or_default())
            .into_iter()
            .collect()
    }
}

impl KonnectEntity for KongConsumerGroup {
    const FINALIZER: &'static str = KONG_CONSUMER_GROUP_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = None;

    fn validate(&self) -> Result<(), String> {
        validate_control_plane_ref(&self.spec.control_plane_ref)
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "consumer_groups"))
    }

    fn payload(&self, _parents: &Parents) -> Value {
        json!({
            "name": self.spec.name,
            "tags": entity_tags(self, self.spec.tags.as_deref()),
        })
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }
}
