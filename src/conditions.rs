use std::fmt;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Overall readiness of a DataPlane or KonnectExtension.
pub const READY: &str = "Ready";
/// A Konnect entity has been created or updated remotely and matches its spec.
pub const PROGRAMMED: &str = "Programmed";
/// A mirror control plane has been read from Konnect.
pub const MIRRORED: &str = "Mirrored";
/// The token of a KonnectAPIAuthConfiguration was accepted by Konnect.
pub const API_AUTH_VALID: &str = "APIAuthValid";
/// The control plane referenced by a KonnectExtension exists and is programmed.
pub const CONTROL_PLANE_REF_VALID: &str = "ControlPlaneRefValid";
/// The client certificate of a KonnectExtension exists and is registered.
pub const DATA_PLANE_CERTIFICATE_PROVISIONED: &str = "DataPlaneCertificateProvisioned";

/// Condition reasons shared by the reconcilers.
pub mod reasons {
    pub const READY: &str = "Ready";
    pub const PROGRAMMED: &str = "Programmed";
    pub const MIRRORED: &str = "Mirrored";
    pub const VALID: &str = "Valid";
    pub const PROVISIONED: &str = "Provisioned";
    pub const PENDING: &str = "Pending";
    pub const WAITING_TO_BECOME_READY: &str = "WaitingToBecomeReady";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const FAILED_RECONCILE: &str = "FailedReconcile";
    pub const KONNECT_API_OP_FAILED: &str = "KonnectAPIOpFailed";
    pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";
    pub const CONTROL_PLANE_IS_MIRROR: &str = "ControlPlaneIsMirror";
    pub const CONTROL_PLANE_REF_NOT_FOUND: &str = "ControlPlaneRefNotFound";
    pub const CONTROL_PLANE_REF_NOT_PROGRAMMED: &str = "ControlPlaneRefNotProgrammed";
    pub const AUTH_REF_NOT_READY: &str = "APIAuthRefNotReady";
    pub const INVALID_TOKEN: &str = "InvalidToken";
    pub const INVALID_CREDENTIALS: &str = "InvalidCredentials";
    pub const CERTIFICATE_SECRET_INVALID: &str = "CertificateSecretInvalid";
    pub const CERTIFICATE_SECRET_NOT_FOUND: &str = "CertificateSecretNotFound";
    pub const DELETION_BLOCKED: &str = "DeletionBlocked";
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        })
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition, e.g. `Ready` or `Programmed`.
    pub r#type: String,

    /// Status is the status of the condition. Can be True, False, Unknown.
    pub status: ConditionStatus,

    /// Unique, one-word, CamelCase reason for the condition's last transition.
    pub reason: String,

    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,

    /// The metadata.generation of the object that this condition was computed against.
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,
}

/// Access to the conditions of a reconciled resource and the generation they are stamped against.
pub trait Conditioned {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn generation(&self) -> Option<i64>;
}

/// Replace the condition of the given type, stamping it with the resource's current generation.
///
/// The transition time is only moved when the status value changes.
pub fn set_condition<R: Conditioned + ?Sized>(
    resource: &mut R,
    r#type: &str,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
) {
    let observed_generation = resource.generation();
    let conditions = resource.conditions_mut();

    let last_transition_time = conditions
        .iter()
        .find(|c| c.r#type == r#type && c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| Time(Utc::now()));

    let condition = Condition {
        r#type: r#type.into(),
        status,
        reason: reason.into(),
        message: message.into(),
        observed_generation,
        last_transition_time: Some(last_transition_time),
    };

    match conditions.iter_mut().find(|c| c.r#type == r#type) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

pub fn get_condition<'a, R: Conditioned + ?Sized>(
    resource: &'a R,
    r#type: &str,
) -> Option<&'a Condition> {
    resource.conditions().iter().find(|c| c.r#type == r#type)
}

/// True iff a condition of this type is True *and* was computed against the current generation.
pub fn is_condition_current_and_true<R: Conditioned + ?Sized>(resource: &R, r#type: &str) -> bool {
    get_condition(resource, r#type).is_some_and(|c| {
        c.status == ConditionStatus::True && c.observed_generation == resource.generation()
    })
}

/// True iff a condition of this type is True, whatever generation it was computed against.
pub fn is_condition_true<R: Conditioned + ?Sized>(resource: &R, r#type: &str) -> bool {
    get_condition(resource, r#type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// A stale Ready=True (older generation) is not ready.
pub fn is_ready<R: Conditioned + ?Sized>(resource: &R) -> bool {
    is_condition_current_and_true(resource, READY)
}
