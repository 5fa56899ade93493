//! Desired children of a DataPlane, derived from its spec and nothing that has to be fetched.

use std::collections::{BTreeMap, HashSet};
use std::hash::Hasher;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodTemplateSpec, Probe, SecretVolumeSource,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use url::Url;

use crate::pki::{TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
use crate::resources::dataplanes::{DataPlaneServicePort, DataPlaneSpec};
use crate::resources::konnectextensions::KonnectExtensionOutput;
use crate::{Error, Result};

use super::scaling::{
    fixed_replicas, horizontal_pod_autoscaler, horizontal_scaling, pod_disruption_budget,
};
use super::{
    admin_service_name, deployment_name, ingress_service_name, label_selector, mandatory_labels,
    object_meta, ADMIN_SERVICE_TYPE, INGRESS_SERVICE_TYPE, SERVICE_TYPE_LABEL,
};

pub const PROXY_CONTAINER_NAME: &str = "proxy";
pub const CLUSTER_CERTIFICATE_VOLUME: &str = "cluster-certificate";
pub const CLUSTER_CERTIFICATE_PATH: &str = "/var/cluster-certificate";
pub const KONNECT_CERTIFICATE_VOLUME: &str = "konnect-client-tls";
pub const KONNECT_CERTIFICATE_PATH: &str = "/etc/secrets/konnect-client-tls";
/// Changes whenever a mounted certificate changes, so pods pick it up
pub const CERTIFICATE_HASH_ANNOTATION: &str = "gateway-operator.konghq.com/certificate-hash";

const PROXY_PORT: i32 = 8000;
const PROXY_SSL_PORT: i32 = 8443;
const ADMIN_PORT: i32 = 8444;
const STATUS_PORT: i32 = 8100;

/// What the synthesizer needs beyond the DataPlane spec.
pub struct SynthesisInput<'a> {
    pub default_image: &'a str,
    /// Name of the cluster certificate Secret
    pub cluster_certificate_secret: &'a str,
    /// PEM of the cluster certificate
    pub cluster_certificate: &'a str,
    /// Output of the attached KonnectExtension, if there is one
    pub extension: Option<&'a KonnectExtensionOutput>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataPlaneChildren {
    pub deployment: Deployment,
    /// The ingress Service unless it is disabled, then the admin Service
    pub services: Vec<Service>,
    pub horizontal_pod_autoscaler: Option<HorizontalPodAutoscaler>,
    pub pod_disruption_budget: Option<PodDisruptionBudget>,
}

pub fn synthesize(
    dataplane: &str,
    base_metadata: &ObjectMeta,
    spec: &DataPlaneSpec,
    input: &SynthesisInput,
) -> Result<DataPlaneChildren> {
    let deployment = deployment(dataplane, base_metadata, spec, input)?;

    let mut services = Vec::with_capacity(2);
    if let Some(ingress) = ingress_service(dataplane, base_metadata, spec) {
        services.push(ingress);
    }
    services.push(admin_service(dataplane, base_metadata));

    let horizontal_pod_autoscaler = horizontal_scaling(spec)
        .map(|scaling| horizontal_pod_autoscaler(base_metadata, dataplane, scaling))
        .transpose()?;
    let pod_disruption_budget = spec
        .resources
        .pod_disruption_budget
        .as_ref()
        .map(|pdb| pod_disruption_budget(base_metadata, dataplane, &pdb.spec))
        .transpose()?;

    Ok(DataPlaneChildren {
        deployment,
        services,
        horizontal_pod_autoscaler,
        pod_disruption_budget,
    })
}

/// User entries first; then `defaults` in order, skipping names already taken.
fn merge_by_name<T>(
    user: Option<Vec<T>>,
    defaults: impl IntoIterator<Item = T>,
    name: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut merged = user.unwrap_or_default();
    let mut taken: HashSet<String> = merged.iter().map(|item| name(item).to_owned()).collect();
    for item in defaults {
        if taken.insert(name(&item).to_owned()) {
            merged.push(item);
        }
    }
    merged
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn default_env() -> Vec<EnvVar> {
    [
        ("KONG_DATABASE", "off"),
        (
            "KONG_PROXY_LISTEN",
            "0.0.0.0:8000 reuseport backlog=16384, 0.0.0.0:8443 http2 ssl reuseport backlog=16384",
        ),
        (
            "KONG_ADMIN_LISTEN",
            "0.0.0.0:8444 http2 ssl reuseport backlog=16384",
        ),
        ("KONG_STATUS_LISTEN", "0.0.0.0:8100"),
        ("KONG_PORT_MAPS", "80:8000, 443:8443"),
        ("KONG_NGINX_WORKER_PROCESSES", "2"),
        ("KONG_PROXY_ACCESS_LOG", "/dev/stdout"),
        ("KONG_PROXY_ERROR_LOG", "/dev/stderr"),
        ("KONG_ADMIN_ACCESS_LOG", "/dev/stdout"),
        ("KONG_ADMIN_ERROR_LOG", "/dev/stderr"),
    ]
    .into_iter()
    .map(|(k, v)| env_var(k, v))
    .chain([
        env_var(
            "KONG_CLUSTER_CERT",
            format!("{CLUSTER_CERTIFICATE_PATH}/{TLS_CERT_KEY}"),
        ),
        env_var(
            "KONG_CLUSTER_CERT_KEY",
            format!("{CLUSTER_CERTIFICATE_PATH}/{TLS_PRIVATE_KEY_KEY}"),
        ),
    ])
    .collect()
}

/// Host and `host:port` of a Konnect endpoint URL.
fn endpoint_address(endpoint: &str) -> Result<(String, String)> {
    let url = Url::parse(endpoint)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidDataPlaneSpec(format!("endpoint {endpoint} has no host")))?;
    let port = url.port_or_known_default().unwrap_or(443);
    Ok((host.to_owned(), format!("{host}:{port}")))
}

fn extension_env(output: &KonnectExtensionOutput) -> Result<Vec<EnvVar>> {
    let (cp_host, cp_address) = endpoint_address(&output.endpoints.control_plane_endpoint)?;
    let (tp_host, tp_address) = endpoint_address(&output.endpoints.telemetry_endpoint)?;
    Ok(vec![
        env_var("KONG_ROLE", "data_plane"),
        env_var("KONG_CLUSTER_MTLS", "pki"),
        env_var("KONG_CLUSTER_CONTROL_PLANE", cp_address),
        env_var("KONG_CLUSTER_SERVER_NAME", cp_host),
        env_var("KONG_CLUSTER_TELEMETRY_ENDPOINT", tp_address),
        env_var("KONG_CLUSTER_TELEMETRY_SERVER_NAME", tp_host),
        env_var(
            "KONG_CLUSTER_CERT",
            format!("{KONNECT_CERTIFICATE_PATH}/{TLS_CERT_KEY}"),
        ),
        env_var(
            "KONG_CLUSTER_CERT_KEY",
            format!("{KONNECT_CERTIFICATE_PATH}/{TLS_PRIVATE_KEY_KEY}"),
        ),
        env_var("KONG_LUA_SSL_TRUSTED_CERTIFICATE", "system"),
        env_var("KONG_KONNECT_MODE", "on"),
        env_var("KONG_VITALS", "off"),
    ])
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.into(),
        mount_path: path.into(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

fn certificate_hash(input: &SynthesisInput) -> String {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(input.cluster_certificate.as_bytes());
    if let Some(extension) = input.extension {
        hasher.write(extension.control_plane_id.as_bytes());
        hasher.write(extension.certificate_secret.as_bytes());
    }
    format!("{:016x}", hasher.finish())
}

fn pod_template(
    dataplane: &str,
    spec: &DataPlaneSpec,
    input: &SynthesisInput,
) -> Result<PodTemplateSpec> {
    let mut template = spec.deployment.pod_template_spec.clone().unwrap_or_default();
    let mut pod = template.spec.take().unwrap_or_default();

    if pod.containers.is_empty() {
        pod.containers.push(Container {
            name: PROXY_CONTAINER_NAME.into(),
            ..Default::default()
        });
    }
    let proxy = pod
        .containers
        .iter_mut()
        .find(|c| c.name == PROXY_CONTAINER_NAME)
        .ok_or_else(|| {
            Error::InvalidDataPlaneSpec(format!(
                "podTemplateSpec has containers but none named {PROXY_CONTAINER_NAME}"
            ))
        })?;

    let mut volumes = vec![secret_volume(
        CLUSTER_CERTIFICATE_VOLUME,
        input.cluster_certificate_secret,
    )];
    let mut mounts = vec![read_only_mount(
        CLUSTER_CERTIFICATE_VOLUME,
        CLUSTER_CERTIFICATE_PATH,
    )];
    let mut env = Vec::new();
    if let Some(extension) = input.extension {
        volumes.push(secret_volume(
            KONNECT_CERTIFICATE_VOLUME,
            &extension.certificate_secret,
        ));
        mounts.push(read_only_mount(
            KONNECT_CERTIFICATE_VOLUME,
            KONNECT_CERTIFICATE_PATH,
        ));
        env = extension_env(extension)?;
    }
    // user entries win, then the extension, then our defaults
    env.extend(default_env());

    proxy
        .image
        .get_or_insert_with(|| input.default_image.to_owned());
    proxy.env = Some(merge_by_name(proxy.env.take(), env, |e| e.name.as_str()));
    proxy.volume_mounts = Some(merge_by_name(proxy.volume_mounts.take(), mounts, |m| {
        m.name.as_str()
    }));
    proxy.ports = Some(merge_by_name(
        proxy.ports.take(),
        [
            container_port("proxy", PROXY_PORT),
            container_port("proxy-ssl", PROXY_SSL_PORT),
            container_port("admin", ADMIN_PORT),
            container_port("metrics", STATUS_PORT),
        ],
        |p| p.name.as_deref().unwrap_or_default(),
    ));
    proxy.readiness_probe.get_or_insert_with(|| Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/status/ready".into()),
            port: IntOrString::Int(STATUS_PORT),
            scheme: Some("HTTP".into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        ..Default::default()
    });
    pod.volumes = Some(merge_by_name(pod.volumes.take(), volumes, |v| v.name.as_str()));

    let mut metadata = template.metadata.take().unwrap_or_default();
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(mandatory_labels(dataplane));
    metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CERTIFICATE_HASH_ANNOTATION.into(), certificate_hash(input));

    Ok(PodTemplateSpec {
        metadata: Some(metadata),
        spec: Some(pod),
    })
}

fn deployment(
    dataplane: &str,
    base_metadata: &ObjectMeta,
    spec: &DataPlaneSpec,
    input: &SynthesisInput,
) -> Result<Deployment> {
    Ok(Deployment {
        metadata: object_meta(base_metadata, deployment_name(dataplane)),
        spec: Some(DeploymentSpec {
            replicas: fixed_replicas(spec),
            selector: label_selector(dataplane),
            template: pod_template(dataplane, spec, input)?,
            ..Default::default()
        }),
        status: None,
    })
}

fn service_metadata(
    base_metadata: &ObjectMeta,
    name: String,
    service_type: &str,
    annotations: Option<BTreeMap<String, String>>,
) -> ObjectMeta {
    let mut metadata = object_meta(base_metadata, name);
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(SERVICE_TYPE_LABEL.into(), service_type.into());
    if let Some(annotations) = annotations {
        metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(annotations);
    }
    metadata
}

fn service_port(port: DataPlaneServicePort) -> ServicePort {
    ServicePort {
        name: Some(port.name.unwrap_or_else(|| format!("port-{}", port.port))),
        port: port.port,
        target_port: Some(port.target_port.unwrap_or(IntOrString::Int(port.port))),
        node_port: port.node_port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

pub fn ingress_service(
    dataplane: &str,
    base_metadata: &ObjectMeta,
    spec: &DataPlaneSpec,
) -> Option<Service> {
    let options = spec
        .network
        .services
        .as_ref()
        .and_then(|s| s.ingress.clone())
        .unwrap_or_default();
    if options.disabled {
        return None;
    }

    let name = options
        .name
        .unwrap_or_else(|| ingress_service_name(dataplane));
    let ports = match options.ports {
        Some(ports) if !ports.is_empty() => ports.into_iter().map(service_port).collect(),
        _ => vec![
            ServicePort {
                name: Some("http".into()),
                port: 80,
                target_port: Some(IntOrString::Int(PROXY_PORT)),
                protocol: Some("TCP".into()),
                ..Default::default()
            },
            ServicePort {
                name: Some("https".into()),
                port: 443,
                target_port: Some(IntOrString::Int(PROXY_SSL_PORT)),
                protocol: Some("TCP".into()),
                ..Default::default()
            },
        ],
    };

    Some(Service {
        metadata: service_metadata(base_metadata, name, INGRESS_SERVICE_TYPE, options.annotations),
        spec: Some(ServiceSpec {
            type_: Some(options.r#type.unwrap_or_else(|| "LoadBalancer".into())),
            selector: label_selector(dataplane).match_labels,
            ports: Some(ports),
            external_traffic_policy: options.external_traffic_policy,
            ..Default::default()
        }),
        status: None,
    })
}

fn admin_service(dataplane: &str, base_metadata: &ObjectMeta) -> Service {
    Service {
        metadata: service_metadata(
            base_metadata,
            admin_service_name(dataplane),
            ADMIN_SERVICE_TYPE,
            None,
        ),
        spec: Some(ServiceSpec {
            selector: label_selector(dataplane).match_labels,
            ports: Some(vec![ServicePort {
                name: Some("admin".into()),
                port: ADMIN_PORT,
                target_port: Some(IntOrString::Int(ADMIN_PORT)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            cluster_ip: Some("None".into()), // headless service
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::dataplane::reconcilers::DATAPLANE_LABEL;
    use crate::resources::dataplanes::{
        DataPlaneDeploymentOptions, DataPlaneNetworkOptions, DataPlaneResources,
        DataPlaneServiceOptions, DataPlaneServices, HorizontalScaling, PodDisruptionBudgetOptions,
        PodDisruptionBudgetOptionsSpec, Scaling,
    };
    use crate::resources::konnectgatewaycontrolplanes::ControlPlaneEndpoints;
    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::core::v1::PodSpec;
    use serde_json::json;

    fn base() -> ObjectMeta {
        ObjectMeta {
            name: Some("edge".into()),
            namespace: Some("gateways".into()),
            ..Default::default()
        }
    }

    fn input<'a>(extension: Option<&'a KonnectExtensionOutput>) -> SynthesisInput<'a> {
        SynthesisInput {
            default_image: "kong/kong-gateway:3.9",
            cluster_certificate_secret: "dataplane-edge-cluster-cert",
            cluster_certificate: "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
            extension,
        }
    }

    fn extension_output() -> KonnectExtensionOutput {
        KonnectExtensionOutput {
            control_plane_id: "cp-1".into(),
            endpoints: ControlPlaneEndpoints {
                control_plane_endpoint: "https://abc123.eu.cp0.konghq.com".into(),
                telemetry_endpoint: "https://abc123.eu.tp0.konghq.com:8443".into(),
            },
            certificate_secret: "konnect-client-tls-ext".into(),
        }
    }

    fn with_template(containers: Vec<Container>, volumes: Option<Vec<Volume>>) -> DataPlaneSpec {
        DataPlaneSpec {
            deployment: DataPlaneDeploymentOptions {
                pod_template_spec: Some(PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers,
                        volumes,
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn proxy(children: &DataPlaneChildren) -> &Container {
        children
            .deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.iter().find(|c| c.name == PROXY_CONTAINER_NAME))
            .unwrap()
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Vec<&'a str> {
        container
            .env
            .iter()
            .flatten()
            .filter(|e| e.name == name)
            .filter_map(|e| e.value.as_deref())
            .collect()
    }

    #[test]
    fn default_spec_yields_one_replica_and_both_services() {
        let children = synthesize("edge", &base(), &DataPlaneSpec::default(), &input(None)).unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&children.deployment).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "dataplane-edge",
                    "labels": {DATAPLANE_LABEL: "edge"},
                },
                "spec": {
                    "replicas": 1,
                    "selector": {"matchLabels": {DATAPLANE_LABEL: "edge"}},
                    "template": {
                        "metadata": {"labels": {DATAPLANE_LABEL: "edge"}},
                        "spec": {
                            "containers": [{
                                "name": "proxy",
                                "image": "kong/kong-gateway:3.9",
                                "readinessProbe": {"httpGet": {"path": "/status/ready", "port": 8100}},
                                "volumeMounts": [{
                                    "name": CLUSTER_CERTIFICATE_VOLUME,
                                    "mountPath": CLUSTER_CERTIFICATE_PATH,
                                    "readOnly": true,
                                }],
                            }],
                            "volumes": [{
                                "name": CLUSTER_CERTIFICATE_VOLUME,
                                "secret": {"secretName": "dataplane-edge-cluster-cert"},
                            }],
                        },
                    },
                },
            })
        );
        assert_eq!(env_value(proxy(&children), "KONG_DATABASE"), vec!["off"]);
        assert_eq!(
            env_value(proxy(&children), "KONG_CLUSTER_CERT"),
            vec!["/var/cluster-certificate/tls.crt"]
        );

        assert_eq!(children.services.len(), 2);
        assert_json_include!(
            actual: serde_json::to_value(&children.services[0]).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "dataplane-ingress-edge",
                    "labels": {SERVICE_TYPE_LABEL: "ingress", DATAPLANE_LABEL: "edge"},
                },
                "spec": {
                    "type": "LoadBalancer",
                    "ports": [
                        {"name": "http", "port": 80, "targetPort": 8000},
                        {"name": "https", "port": 443, "targetPort": 8443},
                    ],
                },
            })
        );
        assert_json_include!(
            actual: serde_json::to_value(&children.services[1]).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "dataplane-admin-edge",
                    "labels": {SERVICE_TYPE_LABEL: "admin"},
                },
                "spec": {"clusterIP": "None", "ports": [{"port": 8444}]},
            })
        );
        assert!(children.horizontal_pod_autoscaler.is_none());
        assert!(children.pod_disruption_budget.is_none());
    }

    #[test]
    fn user_env_is_never_overwritten() {
        let spec = with_template(
            vec![Container {
                name: PROXY_CONTAINER_NAME.into(),
                image: Some("kong:3.8".into()),
                env: Some(vec![
                    env_var("KONG_DATABASE", "postgres"),
                    env_var("KONG_CLUSTER_CERT", "/custom/tls.crt"),
                ]),
                ..Default::default()
            }],
            None,
        );
        let output = extension_output();
        let children = synthesize("edge", &base(), &spec, &input(Some(&output))).unwrap();
        let proxy = proxy(&children);

        assert_eq!(proxy.image.as_deref(), Some("kong:3.8"));
        assert_eq!(env_value(proxy, "KONG_DATABASE"), vec!["postgres"]);
        assert_eq!(env_value(proxy, "KONG_CLUSTER_CERT"), vec!["/custom/tls.crt"]);
        // the extension still wins over defaults for what the user left alone
        assert_eq!(
            env_value(proxy, "KONG_CLUSTER_CERT_KEY"),
            vec!["/etc/secrets/konnect-client-tls/tls.key"]
        );
    }

    #[test]
    fn extension_output_is_mounted_and_configured() {
        let output = extension_output();
        let children =
            synthesize("edge", &base(), &DataPlaneSpec::default(), &input(Some(&output))).unwrap();
        let proxy = proxy(&children);

        assert_eq!(env_value(proxy, "KONG_ROLE"), vec!["data_plane"]);
        assert_eq!(
            env_value(proxy, "KONG_CLUSTER_CONTROL_PLANE"),
            vec!["abc123.eu.cp0.konghq.com:443"]
        );
        assert_eq!(
            env_value(proxy, "KONG_CLUSTER_TELEMETRY_ENDPOINT"),
            vec!["abc123.eu.tp0.konghq.com:8443"]
        );
        assert_eq!(
            env_value(proxy, "KONG_CLUSTER_CERT"),
            vec!["/etc/secrets/konnect-client-tls/tls.crt"]
        );

        let pod = children.deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volumes: Vec<_> = pod.volumes.iter().flatten().map(|v| v.name.as_str()).collect();
        assert_eq!(volumes, vec![CLUSTER_CERTIFICATE_VOLUME, KONNECT_CERTIFICATE_VOLUME]);
        assert!(proxy
            .volume_mounts
            .iter()
            .flatten()
            .any(|m| m.name == KONNECT_CERTIFICATE_VOLUME && m.mount_path == KONNECT_CERTIFICATE_PATH));
    }

    #[test]
    fn user_volume_with_a_reserved_name_wins() {
        let mine = Volume {
            name: KONNECT_CERTIFICATE_VOLUME.into(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        };
        let spec = with_template(
            vec![Container {
                name: PROXY_CONTAINER_NAME.into(),
                ..Default::default()
            }],
            Some(vec![mine.clone()]),
        );
        let output = extension_output();
        let children = synthesize("edge", &base(), &spec, &input(Some(&output))).unwrap();
        let pod = children.deployment.spec.unwrap().template.spec.unwrap();
        let reserved: Vec<_> = pod
            .volumes
            .iter()
            .flatten()
            .filter(|v| v.name == KONNECT_CERTIFICATE_VOLUME)
            .collect();
        assert_eq!(reserved, vec![&mine]);
    }

    #[test]
    fn template_without_proxy_container_is_invalid() {
        let spec = with_template(
            vec![Container {
                name: "sidecar".into(),
                ..Default::default()
            }],
            None,
        );
        assert!(matches!(
            synthesize("edge", &base(), &spec, &input(None)),
            Err(Error::InvalidDataPlaneSpec(_))
        ));
    }

    #[test]
    fn autoscaling_and_budget_are_synthesized_when_declared() {
        let spec = DataPlaneSpec {
            deployment: DataPlaneDeploymentOptions {
                replicas: Some(3),
                scaling: Some(Scaling {
                    horizontal_scaling: Some(HorizontalScaling {
                        min_replicas: Some(2),
                        max_replicas: 10,
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
            resources: DataPlaneResources {
                pod_disruption_budget: Some(PodDisruptionBudgetOptions {
                    spec: PodDisruptionBudgetOptionsSpec {
                        min_available: Some(IntOrString::Int(1)),
                        ..Default::default()
                    },
                }),
            },
            ..Default::default()
        };
        let children = synthesize("edge", &base(), &spec, &input(None)).unwrap();

        assert_eq!(children.deployment.spec.as_ref().unwrap().replicas, None);
        assert_json_include!(
            actual: serde_json::to_value(children.horizontal_pod_autoscaler.as_ref().unwrap()).unwrap(),
            expected: json!({
                "metadata": {"name": "dataplane-edge"},
                "spec": {
                    "minReplicas": 2,
                    "maxReplicas": 10,
                    "scaleTargetRef": {"kind": "Deployment", "name": "dataplane-edge"},
                },
            })
        );
        assert_json_include!(
            actual: serde_json::to_value(children.pod_disruption_budget.as_ref().unwrap()).unwrap(),
            expected: json!({"spec": {"minAvailable": 1}})
        );
    }

    #[test]
    fn ingress_service_can_be_renamed_or_disabled() {
        let mut spec = DataPlaneSpec {
            network: DataPlaneNetworkOptions {
                services: Some(DataPlaneServices {
                    ingress: Some(DataPlaneServiceOptions {
                        name: Some("public-edge".into()),
                        r#type: Some("NodePort".into()),
                        ports: Some(vec![DataPlaneServicePort {
                            port: 8080,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                }),
            },
            ..Default::default()
        };
        let children = synthesize("edge", &base(), &spec, &input(None)).unwrap();
        assert_json_include!(
            actual: serde_json::to_value(&children.services[0]).unwrap(),
            expected: json!({
                "metadata": {"name": "public-edge"},
                "spec": {
                    "type": "NodePort",
                    "ports": [{"name": "port-8080", "port": 8080, "targetPort": 8080}],
                },
            })
        );

        if let Some(ingress) = spec
            .network
            .services
            .as_mut()
            .and_then(|s| s.ingress.as_mut())
        {
            ingress.disabled = true;
        }
        let children = synthesize("edge", &base(), &spec, &input(None)).unwrap();
        assert_eq!(children.services.len(), 1);
        assert_eq!(
            children.services[0].metadata.name.as_deref(),
            Some("dataplane-admin-edge")
        );
    }

    #[test]
    fn synthesis_is_deterministic_and_tracks_certificates() {
        let spec = DataPlaneSpec::default();
        let first = synthesize("edge", &base(), &spec, &input(None)).unwrap();
        assert_eq!(first, synthesize("edge", &base(), &spec, &input(None)).unwrap());

        let hash = |children: &DataPlaneChildren| {
            children.deployment.spec.as_ref().unwrap().template.metadata.as_ref().unwrap()
                .annotations.as_ref().unwrap()[CERTIFICATE_HASH_ANNOTATION]
                .clone()
        };
        let mut rotated = input(None);
        rotated.cluster_certificate = "-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n";
        let second = synthesize("edge", &base(), &spec, &rotated).unwrap();
        assert_ne!(hash(&first), hash(&second));
    }
}
