use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::konnect::entity::{entity_tags, id_ref, strip_nulls};
use crate::konnect::{
    DependencyKind, DependencyResolvable, EntityReference, KonnectEntity, Parents,
};
use crate::resources::common::{
    konnect_entity_status, preserve_unknown_fields, EntityRef, KonnectEntityStatus, NamespacedRef,
};
use crate::resources::kongservices::{
    control_plane_reference, core_entities, validate_control_plane_ref,
};

pub static KONG_PLUGIN_BINDING_FINALIZER: &str = "konnect.konghq.com/kongpluginbinding";

/// Plugin configuration, applied through KongPluginBindings
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongPlugin",
    group = "configuration.konghq.com",
    version = "v1",
    namespaced,
    printcolumn = r#"{"name":"Plugin", "type":"string", "jsonPath":".spec.pluginName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KongPluginSpec {
    /// Name of the plugin, e.g. rate-limiting
    pub plugin_name: String,
    pub instance_name: Option<String>,
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<Value>,
    pub protocols: Option<Vec<String>>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum BindingScope {
    /// Apply the plugin only to the combination of targets
    #[default]
    OnlyTargets,
    /// Apply the plugin to everything in the control plane
    GlobalInControlPlane,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginBindingTargets {
    pub service_ref: Option<NamespacedRef>,
    pub route_ref: Option<NamespacedRef>,
    pub consumer_ref: Option<NamespacedRef>,
}

/// Applies a KongPlugin to services, routes and consumers, or to a whole control plane
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KongPluginBinding",
    group = "configuration.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Plugin", "type":"string", "jsonPath":".spec.pluginRef.name"}"#,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#
)]
#[kube(status = "KonnectEntityStatus")]
#[serde(rename_all = "camelCase")]
pub struct KongPluginBindingSpec {
    /// Required for global bindings; otherwise inherited from the targets
    pub control_plane_ref: Option<EntityRef>,
    /// KongPlugin in the same namespace
    pub plugin_ref: NamespacedRef,
    #[serde(default)]
    pub targets: PluginBindingTargets,
    #[serde(default)]
    pub scope: BindingScope,
    pub tags: Option<Vec<String>>,
}

konnect_entity_status!(KongPluginBinding, KonnectEntityStatus);

impl DependencyResolvable for KongPluginBinding {
    fn references(&self) -> Vec<EntityReference> {
        let namespace = self.namespace().unwrap_or_default();
        let local = |r: &NamespacedRef| NamespacedRef::new(r.name.clone());
        let mut refs = Vec::new();
        if let Some(cp) = &self.spec.control_plane_ref {
            refs.extend(control_plane_reference(cp, &namespace));
        }
        refs.push(EntityReference::namespaced(
            DependencyKind::Plugin,
            &local(&self.spec.plugin_ref),
            &namespace,
        ));
        let targets = &self.spec.targets;
        for (kind, target) in [
            (DependencyKind::Service, &targets.service_ref),
            (DependencyKind::Route, &targets.route_ref),
            (DependencyKind::Consumer, &targets.consumer_ref),
        ] {
            if let Some(target) = target {
                refs.push(EntityReference::namespaced(kind, &local(target), &namespace).parent());
            }
        }
        refs
    }
}

impl KonnectEntity for KongPluginBinding {
    const FINALIZER: &'static str = KONG_PLUGIN_BINDING_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = None;

    fn validate(&self) -> Result<(), String> {
        let targets = &self.spec.targets;
        let has_targets = targets.service_ref.is_some()
            || targets.route_ref.is_some()
            || targets.consumer_ref.is_some();
        match self.spec.scope {
            BindingScope::OnlyTargets if !has_targets => {
                Err("at least one target is required when scope is OnlyTargets".into())
            }
            BindingScope::GlobalInControlPlane if has_targets => {
                Err("targets must not be set when scope is GlobalInControlPlane".into())
            }
            BindingScope::GlobalInControlPlane if self.spec.control_plane_ref.is_none() => {
                Err("controlPlaneRef is required when scope is GlobalInControlPlane".into())
            }
            _ => match &self.spec.control_plane_ref {
                Some(cp) => validate_control_plane_ref(cp),
                None => Ok(()),
            },
        }
    }

    fn collection(&self, parents: &Parents) -> Option<String> {
        Some(core_entities(parents.control_plane_id()?, "plugins"))
    }

    fn payload(&self, parents: &Parents) -> Value {
        let plugin = parents.plugin.clone().unwrap_or_default();
        let mut payload = strip_nulls(json!({
            "name": plugin.plugin_name,
            "instance_name": plugin.instance_name,
            "config": plugin.config,
            "protocols": plugin.protocols,
            "enabled": !plugin.disabled,
            "tags": entity_tags(self, self.spec.tags.as_deref()),
        }));
        // dropped targets go out as null so the plugin is unbound from them
        for (key, kind) in [
            ("service", DependencyKind::Service),
            ("route", DependencyKind::Route),
            ("consumer", DependencyKind::Consumer),
        ] {
            payload[key] = id_ref(parents.get(kind));
        }
        payload
    }
}
