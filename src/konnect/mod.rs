//! The contract with the Konnect configuration API.
//!
//! Reconcilers only depend on [`KonnectApi`]: create/get/update/delete by ID within a collection
//! path, list by tag or name for adoption, and a typed error surface. The reqwest transport lives
//! in [`http`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use url::Url;

pub mod entity;
pub mod http;
#[cfg(test)]
pub mod testing;

pub use entity::{
    AuthSource, DependencyKind, DependencyResolvable, EntityReference, Identifiable,
    KonnectEntity, Parents, RefTarget,
};

#[derive(Error, Debug)]
pub enum KonnectError {
    #[error("Konnect object not found: {0}")]
    NotFound(String),

    #[error("Konnect object already exists: {0}")]
    Conflict(String),

    #[error("Konnect rejected the request ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Konnect rejected the credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Konnect rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Konnect server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Konnect request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Konnect request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Konnect returned an unexpected response: {0}")]
    InvalidResponse(String),
}

impl KonnectError {
    /// Network failures, timeouts, 5xx and 429 are worth retrying quickly; everything else needs
    /// the object (or Konnect) to change before it can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KonnectError::RateLimited { .. }
                | KonnectError::Server { .. }
                | KonnectError::Transport(_)
                | KonnectError::Timeout(_)
                | KonnectError::InvalidResponse(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KonnectError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, KonnectError::Conflict(_))
    }

    /// Classify a non-success HTTP status with its response body.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            404 => KonnectError::NotFound(message),
            409 => KonnectError::Conflict(message),
            401 | 403 => KonnectError::Unauthorized { status, message },
            429 => KonnectError::RateLimited { retry_after },
            500..=599 => KonnectError::Server { status, message },
            _ => KonnectError::Validation { status, message },
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            KonnectError::NotFound(_) => "NotFound",
            KonnectError::Conflict(_) => "Conflict",
            KonnectError::Validation { .. } => "Validation",
            KonnectError::Unauthorized { .. } => "Unauthorized",
            KonnectError::RateLimited { .. } => "RateLimited",
            KonnectError::Server { .. } => "Server",
            KonnectError::Transport(_) => "Transport",
            KonnectError::Timeout(_) => "Timeout",
            KonnectError::InvalidResponse(_) => "InvalidResponse",
        }
    }
}

/// An object as returned by Konnect.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteObject {
    pub id: String,
    pub fields: Value,
}

impl RemoteObject {
    pub fn from_value(fields: Value) -> Result<Self, KonnectError> {
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| KonnectError::InvalidResponse("object without an id".into()))?
            .to_owned();
        Ok(Self { id, fields })
    }

    /// Whether this object carries the ownership marker of the Kubernetes object with this uid,
    /// either as a `k8s-uid:<uid>` tag or as a `k8s-uid` label.
    pub fn is_owned_by(&self, uid: &str) -> bool {
        let tag = entity::uid_tag(uid);
        let tagged = self
            .fields
            .get("tags")
            .and_then(Value::as_array)
            .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(tag.as_str())));
        let labelled = self
            .fields
            .get("labels")
            .and_then(|l| l.get(entity::UID_KEY))
            .and_then(Value::as_str)
            == Some(uid);
        tagged || labelled
    }
}

/// How to look up existing remote objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListFilter {
    /// Objects carrying all of these tags
    Tags(Vec<String>),
    /// Objects with exactly this name
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

/// Where and as whom to call Konnect.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub server_url: Url,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server_url", &self.server_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Typed operations against one Konnect organization.
///
/// `collection` is a path relative to the server URL such as
/// `v2/control-planes/<id>/core-entities/services`.
pub trait KonnectApi: Send + Sync {
    fn create(
        &self,
        collection: &str,
        body: &Value,
    ) -> impl Future<Output = Result<RemoteObject, KonnectError>> + Send;

    fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<RemoteObject, KonnectError>> + Send;

    fn update(
        &self,
        collection: &str,
        id: &str,
        body: &Value,
    ) -> impl Future<Output = Result<RemoteObject, KonnectError>> + Send;

    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<(), KonnectError>> + Send;

    fn list(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> impl Future<Output = Result<Vec<RemoteObject>, KonnectError>> + Send;

    fn current_organization(
        &self,
    ) -> impl Future<Output = Result<Organization, KonnectError>> + Send;
}

/// Builds API clients for a given set of credentials; injected into each reconciler's context.
pub trait KonnectApiFactory: Send + Sync + 'static {
    type Api: KonnectApi + 'static;

    fn api_for(&self, credentials: &Credentials) -> Self::Api;
}
