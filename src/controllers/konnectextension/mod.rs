//! KonnectExtensions attach DataPlanes to a Konnect control plane and own their client certificate.

mod certificate;
pub mod controller;

pub(crate) use controller::run;
