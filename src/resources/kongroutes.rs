use std::collections::BTreeMap;

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

pub static KONG_ROUTE_FINALIZER: &str = "konnect.konghq.com/kongroute";

/// Request matching rules, optionally bound to a KongService
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongRoute",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#,
    printcolumn = r#"{"name":"ID", "type":"string", "priority": 1, "jsonPath":".status.id"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongRouteSpec {
    /// Required when serviceRef is not set; otherwise the service's control plane is used
    pub control_plane_ref: Option<EntityRef>,
    /// KongService in the same namespace this route sends traffic to
    pub service_ref: Option<NamespacedRef>,
    pub adopt: Option<AdoptOptions>,
    pub name: Option<String>,
    pub protocols: Option<Vec<String>>,
    pub methods: Option<Vec<String>>,
    pub hosts: Option<Vec<String>>,
    pub paths: Option<Vec<String>>,
    pub headers: Option<BTreeMap<String, Vec<String>>>,
    pub strip_path: Option<bool>,
    pub preserve_host: Option<bool>,
    pub https_redirect_status_code: Option<i32>,
    pub regex_priority: Option<i64>,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongRoute, KonnectEntityStatus);

impl DependencyResolvable for KongRoute {
    fn references(&self) -> Vec<EntityReference> {
        let namespace = self.namespace().unwrap_or_default();
        let mut refs = Vec::new();
        if let Some(cp) = &self.spec.control_plane_ref {
            refs.extend(control_plane_reference(cp, &namespace));
        }
        if let Some(svc) = &self.spec.service_ref {
            // services can only be referenced from their own namespace
            let svc = NamespacedRef::new(svc.name.clone());
            refs.push(EntityReference::namespaced(DependencyKind::Service, &svc, &namespace).parent());
        }
        refs
    }
}

impl KonnectEntity for KongRoute {
    const FINALIZER: &'static str = KONG_ROUTE_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = Some(DependencyKind::Route);

    fn validate(&self) -> Result<(), String> {
        match (&self.spec.control_plane_ref, &self.spec.service_ref) {
            (None, None) => Err("either controlPlaneRef or serviceRef must be set".into()),
            (Some(cp), _) => validate_control_plane_ref(cp),
            (None, Some(_)) => Ok(()),
        }
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "routes"))
    }

    fn payload(&self, parents: &Parents) -> Value {
        let spec = &self.spec;
        let mut payload = strip_nulls(json!({
            "name": spec.name,
            "protocols": spec.protocols,
            "methods": spec.methods,
            "hosts": spec.hosts,
            "paths": spec.paths,
            "headers": spec.headers,
            "strip_path": spec.strip_path,
            "preserve_host": spec.preserve_host,
            "https_redirect_status_code": spec.https_redirect_status_code,
            "regex_priority": spec.regex_priority,
            "tags": entity_tags(self, spec.tags.as_deref()),
        }));
        // an explicit null detaches the route from a previously set service
        payload["service"] = id_ref(parents.get(DependencyKind::Service));
        payload
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }
}
