use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, Conditioned};
use crate::resources::common::EntityRef;
use crate::resources::konnectgatewaycontrolplanes::ControlPlaneEndpoints;

pub static KONNECT_EXTENSION_FINALIZER: &str = "konnect.konghq.com/konnectextension";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectExtensionControlPlane {
    /// The KonnectGatewayControlPlane data planes using this extension connect to
    #[serde(rename = "ref")]
    pub control_plane_ref: EntityRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectExtensionKonnect {
    pub control_plane: KonnectExtensionControlPlane,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CertificateProvisioning {
    /// The operator generates a self-signed certificate
    #[default]
    Automatic,
    /// The certificate is read from certificateSecretRef
    Manual,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSecret {
    #[serde(default)]
    pub provisioning: CertificateProvisioning,
    /// kubernetes.io/tls Secret in the same namespace, required for Manual provisioning
    pub certificate_secret_ref: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneClientAuth {
    #[serde(default)]
    pub certificate_secret: CertificateSecret,
}

/// Attaches DataPlanes to a Konnect control plane
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "KonnectExtension",
    group = "konnect.konghq.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"ControlPlaneID", "type":"string", "jsonPath":".status.konnect.controlPlaneID"}"#
)]
#[kube(status = "KonnectExtensionStatus")]
#[serde(rename_all = "camelCase")]
pub struct KonnectExtensionSpec {
    pub konnect: KonnectExtensionKonnect,
    pub client_auth: Option<DataPlaneClientAuth>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectExtensionControlPlaneStatus {
    #[serde(rename = "controlPlaneID")]
    pub control_plane_id: String,
    pub endpoints: ControlPlaneEndpoints,
    /// ID of the client certificate registered with the control plane
    #[serde(rename = "certificateID")]
    pub certificate_id: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneClientAuthStatus {
    pub certificate_secret_ref: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectExtensionStatus {
    pub konnect: Option<KonnectExtensionControlPlaneStatus>,
    pub data_plane_client_auth: Option<DataPlaneClientAuthStatus>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Conditioned for KonnectExtension {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    fn generation(&self) -> Option<i64> {
        self.metadata.generation
    }
}

impl KonnectExtension {
    pub fn provisioning(&self) -> CertificateProvisioning {
        self.spec
            .client_auth
            .as_ref()
            .map(|a| a.certificate_secret.provisioning)
            .unwrap_or_default()
    }
}

/// What a ready KonnectExtension contributes to the DataPlanes that use it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KonnectExtensionOutput {
    pub control_plane_id: String,
    pub endpoints: ControlPlaneEndpoints,
    pub certificate_secret: String,
}

impl KonnectExtensionOutput {
    /// Only available once the extension is ready for its current generation.
    pub fn from_extension(ext: &KonnectExtension) -> Option<Self> {
        if !crate::conditions::is_ready(ext) {
            return None;
        }
        let status = ext.status.as_ref()?;
        let konnect = status.konnect.as_ref()?;
        let secret = status
            .data_plane_client_auth
            .as_ref()?
            .certificate_secret_ref
            .as_ref()?;
        Some(Self {
            control_plane_id: konnect.control_plane_id.clone(),
            endpoints: konnect.endpoints.clone(),
            certificate_secret: secret.name.clone(),
        })
    }
}
