use kube::CustomResourceExt;

use gateway_operator::resources::{
    dataplanes::DataPlane,
    kongcertificates::{KongCertificate, KongSNI},
    kongconsumers::{KongConsumer, KongConsumerGroup},
    kongplugins::{KongPlugin, KongPluginBinding},
    kongroutes::KongRoute,
    kongservices::KongService,
    kongupstreams::{KongTarget, KongUpstream},
    kongvaults::KongVault,
    konnectapiauthconfigurations::KonnectAPIAuthConfiguration,
    konnectextensions::KonnectExtension,
    konnectgatewaycontrolplanes::KonnectGatewayControlPlane,
};

fn main() {
    let crds = [
        DataPlane::crd(),
        KonnectAPIAuthConfiguration::crd(),
        KonnectGatewayControlPlane::crd(),
        KonnectExtension::crd(),
        KongService::crd(),
        KongRoute::crd(),
        KongConsumer::crd(),
        KongConsumerGroup::crd(),
        KongUpstream::crd(),
        KongTarget::crd(),
        KongCertificate::crd(),
        KongSNI::crd(),
        KongPlugin::crd(),
        KongPluginBinding::crd(),
        KongVault::crd(),
    ];
    let documents: Vec<String> = crds
        .iter()
        .map(|crd| serde_yaml::to_string(crd).unwrap())
        .collect();
    print!("{}", documents.join("---\n"))
}
