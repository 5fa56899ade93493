use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::konnect::entity::{strip_nulls, UID_KEY};
use crate::konnect::{
    AuthSource, DependencyKind, DependencyResolvable, EntityReference, KonnectEntity, ListFilter,
    Parents, RemoteObject,
};
use crate::resources::common::{konnect_entity_status, AdoptOptions, KonnectEntityStatus};

pub const CONTROL_PLANES_COLLECTION: &str = "v2/control-planes";

pub static KONNECT_GATEWAY_CONTROL_PLANE_FINALIZER: &str =
    "konnect.konghq.com/konnectgatewaycontrolplane";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EntitySource {
    /// The control plane is created and owned by this object
    #[default]
    Origin,
    /// The control plane already exists in Konnect and is only reflected here
    Mirror,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MirrorKonnect {
    pub id: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MirrorSpec {
    pub konnect: MirrorKonnect,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct APIAuthConfigurationRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectConfiguration {
    /// The KonnectAPIAuthConfiguration, in the same namespace, used for all Konnect calls
    pub api_auth_configuration_ref: APIAuthConfigurationRef,
}

/// A control plane in Konnect
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KonnectGatewayControlPlane",
    group = "konnect.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Programmed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Programmed\")].status"}"#,
    printcolumn = r#"{"name":"ID", "type":"string", "jsonPath":".status.id"}"#,
    printcolumn = r#"{"name":"OrgID", "type":"string", "jsonPath":".status.organizationID"}"#
)]
#[kube(status = "KonnectGatewayControlPlaneStatus", shortname = "kgcp")]
#[serde(rename_all = "camelCase")]
pub struct KonnectGatewayControlPlaneSpec {
    /// Name of the control plane in Konnect; defaults to the object name
    pub name: Option<String>,
    pub description: Option<String>,
    /// e.g. CLUSTER_TYPE_CONTROL_PLANE
    pub cluster_type: Option<String>,
    /// e.g. pinned_client_certs
    pub auth_type: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub source: EntitySource,
    /// Required when source is Mirror
    pub mirror: Option<MirrorSpec>,
    pub konnect: KonnectConfiguration,
    pub adopt: Option<AdoptOptions>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneEndpoints {
    /// Address data planes connect to for configuration
    pub control_plane_endpoint: String,
    /// Address data planes send telemetry to
    pub telemetry_endpoint: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectGatewayControlPlaneStatus {
    #[serde(flatten)]
    pub entity: KonnectEntityStatus,
    pub endpoints: Option<ControlPlaneEndpoints>,
}

konnect_entity_status!(KonnectGatewayControlPlane, KonnectGatewayControlPlaneStatus, entity);

impl KonnectGatewayControlPlane {
    pub fn is_mirror(&self) -> bool {
        self.spec.source == EntitySource::Mirror
    }

    pub fn endpoints(&self) -> Option<&ControlPlaneEndpoints> {
        self.status.as_ref().and_then(|s| s.endpoints.as_ref())
    }
}

impl DependencyResolvable for KonnectGatewayControlPlane {
    fn references(&self) -> Vec<EntityReference> {
        Vec::new()
    }
}

impl KonnectEntity for KonnectGatewayControlPlane {
    const FINALIZER: &'static str = KONNECT_GATEWAY_CONTROL_PLANE_FINALIZER;
    const DEPENDENCY: Option<DependencyKind> = Some(DependencyKind::ControlPlane);

    fn validate(&self) -> Result<(), String> {
        match (&self.spec.source, &self.spec.mirror) {
            (EntitySource::Mirror, None) => {
                Err("mirror.konnect.id is required when source is Mirror".into())
            }
            (EntitySource::Mirror, Some(m)) if m.konnect.id.is_empty() => {
                Err("mirror.konnect.id must not be empty".into())
            }
            (EntitySource::Origin, Some(_)) => {
                Err("mirror must not be set when source is Origin".into())
            }
            _ => Ok(()),
        }
    }

    fn collection(&self, _parents: &Parents) -> Option<String> {
        Some(CONTROL_PLANES_COLLECTION.to_owned())
    }

    fn payload(&self, _parents: &Parents) -> Value {
        let spec = &self.spec;
        let mut labels = spec.labels.clone().unwrap_or_default();
        labels.insert(UID_KEY.to_owned(), self.uid().unwrap_or_default());
        strip_nulls(json!({
            "name": self.remote_name(),
            "description": spec.description,
            "cluster_type": spec.cluster_type,
            "auth_type": spec.auth_type,
            "labels": labels,
        }))
    }

    fn adopt(&self) -> Option<&AdoptOptions> {
        self.spec.adopt.as_ref()
    }

    // Control planes carry labels rather than tags, and names are unique per organization.
    fn adoption_filter(&self) -> ListFilter {
        ListFilter::Name(self.remote_name())
    }

    fn auth_source(&self) -> AuthSource {
        AuthSource::Direct {
            namespace: self.namespace().unwrap_or_default(),
            name: self.spec.konnect.api_auth_configuration_ref.name.clone(),
        }
    }

    fn mirror_id(&self) -> Option<&str> {
        if !self.is_mirror() {
            return None;
        }
        self.spec.mirror.as_ref().map(|m| m.konnect.id.as_str())
    }

    fn on_programmed(&mut self, remote: &RemoteObject) {
        let config = remote.fields.get("config");
        let endpoint = |key: &str| {
            config
                .and_then(|c| c.get(key))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        let endpoints = match (endpoint("control_plane_endpoint"), endpoint("telemetry_endpoint")) {
            (Some(control_plane_endpoint), Some(telemetry_endpoint)) => Some(ControlPlaneEndpoints {
                control_plane_endpoint,
                telemetry_endpoint,
            }),
            _ => None,
        };
        let status = self.status.get_or_insert_with(Default::default);
        status.endpoints = endpoints;
        // A control plane is its own control plane, which lets children inherit its ID.
        status.entity.control_plane_id = Some(remote.id.clone());
    }
}

impl KonnectGatewayControlPlane {
    /// Name of the control plane in Konnect.
    pub fn remote_name(&self) -> String {
        self.spec.name.clone().unwrap_or_else(|| self.name_any())
    }
}
