use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::konnect::entity::{entity_tags, strip_nulls};
use crate::konnect::{
    DependencyKind, DependencyResolvable, EntityReference, KonnectEntity, Parents,
};
use crate::resources::common::{
    konnect_entity_status, preserve_unknown_fields, AdoptOptions, EntityRef, KonnectEntityStatus,
};
use crate::resources::kongservices::{
    control_plane_reference, core_entities, validate_control_plane_ref,
};

pub static KONG_VAULT_FINALIZER: &str = "konnect.konghq.com/kongvault";

/// A secret store the gateway resolves `{vault://...}` references against
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongVault",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Backend", "type":"string", "jsonPath":".spec.backend"}"#,
    printcolumn = r#"{"name":"Prefix", "type":"string", "jsonPath":".spec.prefix"}"#,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongVaultSpec {
    pub control_plane_ref: EntityRef,
    pub adopt: Option<AdoptOptions>,
    /// Vault implementation, e.g. env, aws, gcp or hcv
    pub backend: String,
    /// Prefix used in vault references
    pub prefix: String,
    pub description: Option<String>,
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<Value>,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongVault, KonnectEntityStatus);

impl DependencyResolvable for KongVault {
    fn references(&self) -> Vec<EntityReference> {
        control_plane_reference(&self.spec.control_plane_ref, &self.namespace().unwrap_or_default())
            .into_iter()
            .collect()
    }
}

impl KonnectEntity for KongVault {
    const FINALIZER: &'static str = KONG_VAULT_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = None;

    fn validate(&self) -> Result<(), String> {
        if self.spec.config.as_ref().is_some_and(|c| !c.is_object()) {
            return Err("config must be an object".into());
        }
        validate_control_plane_ref(&self.spec.control_plane_ref)
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "vaults"))
    }

    fn payload(&self, _parents: &Parents) -> Value {
        let spec = &self.spec;
        strip_nulls(json!({
            "name": spec.backend,
            "prefix": spec.prefix,
            "description": spec.description,
            "config": spec.config,
            "tags": entity_tags(self, spec.tags.as_deref()),
        }))
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }
}
