use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{HorizontalPodAutoscalerBehavior, MetricSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::conditions::{Condition, Conditioned};

pub static DATAPLANE_FINALIZER: &str = "gateway-operator.konghq.com/dataplane";

/// A gateway data plane deployment and its networking
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "DataPlane",
    group = "gateway-operator.konghq.com",
    version = "v1beta1",
    namespaced,
    schema = "manual",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Service", "type":"string", "priority": 1, "jsonPath":".status.service"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    scale = r#"{"specReplicasPath":".spec.deployment.replicas", "statusReplicasPath":".status.replicas", "labelSelectorPath":".status.selector"}"#
)]
#[kube(status = "DataPlaneStatus", shortname = "dp")]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneSpec {
    #[serde(default)]
    pub deployment: DataPlaneDeploymentOptions,
    #[serde(default)]
    pub network: DataPlaneNetworkOptions,
    #[serde(default)]
    pub resources: DataPlaneResources,
    /// Extensions applied to the data plane, e.g. a KonnectExtension
    pub extensions: Option<Vec<ExtensionRef>>,
}

// Hoisted from the derived implementation so that generated child names stay within limits
impl schemars::JsonSchema for DataPlane {
    fn schema_name() -> String {
        "DataPlane".to_owned()
    }
    fn schema_id() -> Cow<'static, str> {
        "gateway_operator::resources::DataPlane".into()
    }
    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> Schema {
        let mut schema_object = SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::Object.into()),
            metadata: Some(Box::new(schemars::schema::Metadata {
                description: Some(
                    "DataPlane describes a gateway data plane deployment and its networking."
                        .to_owned(),
                ),
                ..Default::default()
            })),
            ..Default::default()
        };
        let object_validation = schema_object.object();

        object_validation.properties.insert(
            "metadata".to_owned(),
            serde_json::from_value(json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "minLength": 1,
                        "maxLength": 40,
                        "pattern": "^[a-z0-9]([-a-z0-9]*[a-z0-9])?$",
                    }
                }
            }))
            .unwrap(),
        );
        object_validation.required.insert("metadata".to_owned());

        object_validation
            .properties
            .insert("spec".to_owned(), gen.subschema_for::<DataPlaneSpec>());
        object_validation.required.insert("spec".to_owned());

        object_validation.properties.insert(
            "status".to_owned(),
            gen.subschema_for::<Option<DataPlaneStatus>>(),
        );
        Schema::Object(schema_object)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneDeploymentOptions {
    /// Fixed number of replicas; ignored when scaling.horizontalScaling is set. Defaults to 1.
    pub replicas: Option<i32>,
    pub scaling: Option<Scaling>,
    /// Pod template; the container named `proxy` receives operator defaults
    pub pod_template_spec: Option<PodTemplateSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    pub horizontal_scaling: Option<HorizontalScaling>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    pub metrics: Option<Vec<MetricSpec>>,
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneNetworkOptions {
    pub services: Option<DataPlaneServices>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneServices {
    pub ingress: Option<DataPlaneServiceOptions>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneServiceOptions {
    /// Name of the ingress Service; generated when unset
    pub name: Option<String>,
    /// Service type; defaults to LoadBalancer
    pub r#type: Option<String>,
    pub annotations: Option<BTreeMap<String, String>>,
    pub ports: Option<Vec<DataPlaneServicePort>>,
    pub external_traffic_policy: Option<String>,
    /// Do not create an ingress Service
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneServicePort {
    pub name: Option<String>,
    pub port: i32,
    pub target_port: Option<IntOrString>,
    pub node_port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneResources {
    pub pod_disruption_budget: Option<PodDisruptionBudgetOptions>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetOptions {
    pub spec: PodDisruptionBudgetOptionsSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetOptionsSpec {
    pub min_available: Option<IntOrString>,
    pub max_unavailable: Option<IntOrString>,
    pub unhealthy_pod_eviction_policy: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtensionRef {
    /// Defaults to konnect.konghq.com
    pub group: Option<String>,
    pub kind: String,
    pub name: String,
    /// Defaults to the DataPlane's namespace
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DataPlanePhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Terminating,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// IPAddress or Hostname
    pub r#type: String,
    pub value: String,
    /// PublicLoadBalancer, PrivateLoadBalancer, PublicIP or PrivateIP
    pub source_type: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSummary {
    pub expected_pods: i32,
    pub current_healthy: i32,
    pub desired_healthy: i32,
    pub disruptions_allowed: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneStatus {
    pub phase: Option<DataPlanePhase>,
    /// Name of the ingress Service
    pub service: Option<String>,
    pub addresses: Option<Vec<Address>>,
    /// Label selector of the data plane pods
    pub selector: Option<String>,
    pub replicas: Option<i32>,
    pub ready_replicas: Option<i32>,
    pub pod_disruption_budget: Option<PodDisruptionBudgetSummary>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Conditioned for DataPlane {
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

pub const KONNECT_EXTENSION_GROUP: &str = "konnect.konghq.com";
pub const KONNECT_EXTENSION_KIND: &str = "KonnectExtension";

impl ExtensionRef {
    pub fn is_konnect_extension(&self) -> bool {
        self.kind == KONNECT_EXTENSION_KIND
            && self.group.as_deref().unwrap_or(KONNECT_EXTENSION_GROUP) == KONNECT_EXTENSION_GROUP
    }
}

impl DataPlane {
    /// Extensions that are KonnectExtensions, as (namespace, name)
    pub fn konnect_extensions<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.spec
            .extensions
            .iter()
            .flatten()
            .filter(|e| e.is_konnect_extension())
            .map(move |e| (e.namespace.as_deref().unwrap_or(namespace), e.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{is_ready, set_condition, ConditionStatus, READY};
    use kube::CustomResourceExt;

    fn extension(group: Option<&str>, kind: &str, namespace: Option<&str>) -> ExtensionRef {
        ExtensionRef {
            group: group.map(Into::into),
            kind: kind.into(),
            name: "ext".into(),
            namespace: namespace.map(Into::into),
        }
    }

    #[test]
    fn konnect_extensions_default_group_and_namespace() {
        assert!(extension(None, "KonnectExtension", None).is_konnect_extension());
        assert!(extension(Some("konnect.konghq.com"), "KonnectExtension", None).is_konnect_extension());
        assert!(!extension(Some("example.com"), "KonnectExtension", None).is_konnect_extension());
        assert!(!extension(None, "DataPlaneMetricsExtension", None).is_konnect_extension());

        let dp = DataPlane::new(
            "edge",
            DataPlaneSpec {
                extensions: Some(vec![
                    extension(None, "KonnectExtension", None),
                    extension(None, "KonnectExtension", Some("shared")),
                    extension(None, "DataPlaneMetricsExtension", None),
                ]),
                ..Default::default()
            },
        );
        assert_eq!(
            dp.konnect_extensions("gateways").collect::<Vec<_>>(),
            vec![("gateways", "ext"), ("shared", "ext")]
        );
    }

    #[test]
    fn ready_tracks_the_generation() {
        let mut dp = DataPlane::new("edge", DataPlaneSpec::default());
        dp.metadata.generation = Some(1);
        set_condition(&mut dp, READY, ConditionStatus::True, "Ready", "");
        assert!(is_ready(&dp));

        dp.metadata.generation = Some(2);
        assert!(!is_ready(&dp));
    }

    #[test]
    fn crd_exposes_the_scale_subresource() {
        let crd = serde_json::to_value(DataPlane::crd()).unwrap();
        let version = &crd["spec"]["versions"][0];
        assert_eq!(
            version["subresources"]["scale"]["specReplicasPath"],
            ".spec.deployment.replicas"
        );
        assert_eq!(
            version["schema"]["openAPIV3Schema"]["properties"]["metadata"]["properties"]["name"]["maxLength"],
            40
        );
    }
}
