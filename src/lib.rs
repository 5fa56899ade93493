use std::time::Duration;

use thiserror::Error;

use konnect::KonnectError;
use pki::PkiError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Not yet Ready: {message}")]
    NotReady {
        message: String,
        reason: String,
        requeue_after: Option<Duration>,
    },

    #[error("Invalid DataPlane configuration: {0}")]
    InvalidDataPlaneSpec(String),

    #[error("Invalid configuration: {message}")]
    InvalidEntity { reason: String, message: String },

    #[error(transparent)]
    KonnectApi(#[from] KonnectError),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error("Deletion is blocked by dependent objects: {}", dependents.join(", "))]
    DeletionBlocked { dependents: Vec<String> },

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),

    #[error("The Secret key {0} in {1} does not exist")]
    SecretKeyNotFound(String, String),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::NotReady { .. } => "NotReady",
            Error::InvalidDataPlaneSpec(_) => "InvalidDataPlaneSpec",
            Error::InvalidEntity { .. } => "InvalidEntity",
            Error::KonnectApi(_) => "KonnectApi",
            Error::Pki(_) => "Pki",
            Error::DeletionBlocked { .. } => "DeletionBlocked",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::SecretKeyNotFound(_, _) => "SecretKeyNotFound",
            Error::InvalidUrl(_) => "InvalidUrl",
        }
    }

    /// The API server refused a write because the object changed since it was read.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.inner(),
            Error::KubeError(kube::Error::Api(kube::error::ErrorResponse { code: 409, .. }))
        )
    }

    /// The reconciler error behind a finalizer error, if there is one.
    pub fn inner(&self) -> &Error {
        use kube::runtime::finalizer::Error as FinalizerError;

        match self {
            Error::FinalizerError(err) => match err.as_ref() {
                FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => {
                    inner.inner()
                }
                _ => self,
            },
            _ => self,
        }
    }
}

/// Condition model shared by all reconciled resources
pub mod conditions;

/// Drift detection between desired and observed objects
pub mod diff;

/// Requeue timing
pub mod backoff;

/// Client certificate generation
pub mod pki;

/// Konnect API contract and transport
pub mod konnect;

pub mod controllers;

pub use controllers::{run, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Custom resources
pub mod resources;
