//! DataPlanes are reconciled into a Deployment, Services and optional scaling objects.
pub mod controller;
mod reconcilers;

pub use controller::run;
