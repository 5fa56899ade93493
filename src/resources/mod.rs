pub mod common;
pub mod dataplanes;
pub mod kongcertificates;
pub mod kongconsumers;
pub mod kongplugins;
pub mod kongroutes;
pub mod kongservices;
pub mod kongupstreams;
pub mod kongvaults;
pub mod konnectapiauthconfigurations;
pub mod konnectextensions;
pub mod konnectgatewaycontrolplanes;
