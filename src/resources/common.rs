//! Types shared by the Konnect custom resources.

use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::conditions::Condition;

/// How a reference is expressed.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RefType {
    /// Reference an object in the cluster by name
    #[default]
    #[serde(rename = "namespacedRef")]
    NamespacedRef,
    /// Reference a Konnect object by its ID
    #[serde(rename = "konnectID")]
    KonnectId,
}

/// A reference to an object by name, defaulting to the referrer's namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub struct NamespacedRef {
    pub name: String,
    pub namespace: Option<String>,
}

impl NamespacedRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// A reference to an object that is either in the cluster or only known to Konnect.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub r#type: RefType,
    /// Required when type is namespacedRef
    pub namespaced_ref: Option<NamespacedRef>,
    /// Required when type is konnectID
    #[serde(rename = "konnectID")]
    pub konnect_id: Option<String>,
}

impl EntityRef {
    pub fn namespaced(name: impl Into<String>) -> Self {
        Self {
            r#type: RefType::NamespacedRef,
            namespaced_ref: Some(NamespacedRef::new(name)),
            konnect_id: None,
        }
    }

    pub fn konnect_id(id: impl Into<String>) -> Self {
        Self {
            r#type: RefType::KonnectId,
            namespaced_ref: None,
            konnect_id: Some(id.into()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AdoptMode {
    /// Take over the remote object and overwrite it with the local spec
    #[default]
    #[serde(rename = "override")]
    Override,
    /// Take over the remote object only if it already matches the local spec
    #[serde(rename = "match")]
    Match,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct AdoptKonnectOptions {
    pub id: String,
}

/// Manage an existing Konnect object instead of creating a new one.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct AdoptOptions {
    #[serde(default)]
    pub mode: AdoptMode,
    pub konnect: AdoptKonnectOptions,
}

/// Status common to all objects that map to a Konnect entity.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KonnectEntityStatus {
    /// ID of the object in Konnect
    pub id: Option<String>,
    /// Konnect API server the object was created on
    #[serde(rename = "serverURL")]
    pub server_url: Option<String>,
    #[serde(rename = "organizationID")]
    pub organization_id: Option<String>,
    #[serde(rename = "controlPlaneID")]
    pub control_plane_id: Option<String>,
    #[serde(rename = "serviceID")]
    pub service_id: Option<String>,
    #[serde(rename = "routeID")]
    pub route_id: Option<String>,
    #[serde(rename = "consumerID")]
    pub consumer_id: Option<String>,
    #[serde(rename = "upstreamID")]
    pub upstream_id: Option<String>,
    #[serde(rename = "certificateID")]
    pub certificate_id: Option<String>,
    pub observed_generation: Option<i64>,
    /// Hash of the body last written to Konnect. A spec change that only clears fields changes
    /// the body without showing up as drift on the remote object.
    pub payload_hash: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Free-form JSON, kept verbatim by the API server.
pub(crate) fn preserve_unknown_fields(_g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    }))
    .unwrap()
}

/// Implements [`Conditioned`](crate::conditions::Conditioned) and
/// [`Identifiable`](crate::konnect::Identifiable) for a custom resource whose status is a
/// [`KonnectEntityStatus`], reached through the given field path.
macro_rules! konnect_entity_status {
    ($kind:ty, $status:ty $(, $field:ident)?) => {
        impl crate::conditions::Conditioned for $kind {
            fn conditions(&self) -> &[crate::conditions::Condition] {
                self.status
                    .as_ref()
                    .map(|s| s$(.$field)?.conditions.as_slice())
                    .unwrap_or_default()
            }

            fn conditions_mut(&mut self) -> &mut Vec<crate::conditions::Condition> {
                &mut self
                    .status
                    .get_or_insert_with(<$status>::default)
                    $(.$field)?
                    .conditions
            }

            fn generation(&self) -> Option<i64> {
                self.metadata.generation
            }
        }

        impl crate::konnect::Identifiable for $kind {
            fn konnect_status(&self) -> Option<&crate::resources::common::KonnectEntityStatus> {
                self.status.as_ref().map(|s| &(*s)$(.$field)?)
            }

            fn konnect_status_mut(&mut self) -> &mut crate::resources::common::KonnectEntityStatus {
                &mut (*self.status.get_or_insert_with(<$status>::default))$(.$field)?
            }
        }
    };
}

pub(crate) use konnect_entity_status;
