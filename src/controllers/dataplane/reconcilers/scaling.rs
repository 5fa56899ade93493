use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::resources::dataplanes::{
    DataPlaneSpec, HorizontalScaling, PodDisruptionBudgetOptionsSpec, PodDisruptionBudgetSummary,
};
use crate::{Error, Result};

use super::{deployment_name, label_selector, object_meta};

pub fn horizontal_scaling(spec: &DataPlaneSpec) -> Option<&HorizontalScaling> {
    spec.deployment
        .scaling
        .as_ref()
        .and_then(|s| s.horizontal_scaling.as_ref())
}

/// The replica count the Deployment is pinned to, or None when an autoscaler owns it.
pub fn fixed_replicas(spec: &DataPlaneSpec) -> Option<i32> {
    match horizontal_scaling(spec) {
        Some(_) => None,
        None => Some(spec.deployment.replicas.unwrap_or(1)),
    }
}

pub fn horizontal_pod_autoscaler(
    base_metadata: &ObjectMeta,
    dataplane: &str,
    scaling: &HorizontalScaling,
) -> Result<HorizontalPodAutoscaler> {
    let max_replicas = scaling.max_replicas;
    let min_replicas = scaling.min_replicas.unwrap_or(1);
    if max_replicas < 1 {
        return Err(Error::InvalidDataPlaneSpec(format!(
            "horizontalScaling.maxReplicas must be at least 1, got {max_replicas}"
        )));
    }
    if min_replicas < 1 || min_replicas > max_replicas {
        return Err(Error::InvalidDataPlaneSpec(format!(
            "horizontalScaling.minReplicas {min_replicas} must be between 1 and maxReplicas {max_replicas}"
        )));
    }

    Ok(HorizontalPodAutoscaler {
        metadata: object_meta(base_metadata, deployment_name(dataplane)),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".into()),
                kind: "Deployment".into(),
                name: deployment_name(dataplane),
            },
            min_replicas: Some(min_replicas),
            max_replicas,
            metrics: scaling.metrics.clone(),
            behavior: scaling.behavior.clone(),
        }),
        status: None,
    })
}

pub fn pod_disruption_budget(
    base_metadata: &ObjectMeta,
    dataplane: &str,
    options: &PodDisruptionBudgetOptionsSpec,
) -> Result<PodDisruptionBudget> {
    match (&options.min_available, &options.max_unavailable) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidDataPlaneSpec(
                "podDisruptionBudget may set only one of minAvailable and maxUnavailable".into(),
            ))
        }
        (None, None) => {
            return Err(Error::InvalidDataPlaneSpec(
                "podDisruptionBudget must set minAvailable or maxUnavailable".into(),
            ))
        }
        (Some(value), None) | (None, Some(value)) => {
            scaled_value(value, 0).map_err(Error::InvalidDataPlaneSpec)?;
        }
    }

    Ok(PodDisruptionBudget {
        metadata: object_meta(base_metadata, deployment_name(dataplane)),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: options.min_available.clone(),
            max_unavailable: options.max_unavailable.clone(),
            selector: Some(label_selector(dataplane)),
            unhealthy_pod_eviction_policy: options.unhealthy_pod_eviction_policy.clone(),
        }),
        status: None,
    })
}

/// Resolve an absolute or percentage value against `total`. Percentages round up, the way the
/// disruption controller rounds them.
pub fn scaled_value(value: &IntOrString, total: i32) -> Result<i32, String> {
    match value {
        IntOrString::Int(v) if *v < 0 => Err(format!("{v} must not be negative")),
        IntOrString::Int(v) => Ok(*v),
        IntOrString::String(s) => {
            let percent = s
                .strip_suffix('%')
                .and_then(|p| p.parse::<i64>().ok())
                .filter(|p| *p >= 0)
                .ok_or_else(|| format!("{s} is neither a count nor a percentage"))?;
            Ok(((percent * i64::from(total.max(0)) + 99) / 100) as i32)
        }
    }
}

/// The budget's expected/healthy/allowed bookkeeping for the live ready replica count.
pub fn disruption_summary(
    options: &PodDisruptionBudgetOptionsSpec,
    ready_replicas: i32,
) -> Result<PodDisruptionBudgetSummary, String> {
    let expected = ready_replicas.max(0);
    let desired = match (&options.min_available, &options.max_unavailable) {
        (Some(min), _) => scaled_value(min, expected)?,
        (None, Some(max)) => expected - scaled_value(max, expected)?,
        (None, None) => expected,
    }
    .max(0);

    Ok(PodDisruptionBudgetSummary {
        expected_pods: expected,
        current_healthy: expected,
        desired_healthy: desired,
        disruptions_allowed: (expected - desired).max(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::dataplanes::{DataPlaneDeploymentOptions, Scaling};

    fn min_available(value: IntOrString) -> PodDisruptionBudgetOptionsSpec {
        PodDisruptionBudgetOptionsSpec {
            min_available: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn autoscaler_takes_over_the_replica_count() {
        let mut spec = DataPlaneSpec {
            deployment: DataPlaneDeploymentOptions {
                replicas: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(fixed_replicas(&spec), Some(3));
        assert_eq!(fixed_replicas(&DataPlaneSpec::default()), Some(1));

        spec.deployment.scaling = Some(Scaling {
            horizontal_scaling: Some(HorizontalScaling {
                max_replicas: 5,
                ..Default::default()
            }),
        });
        assert_eq!(fixed_replicas(&spec), None);
    }

    #[test]
    fn autoscaler_bounds_are_validated() {
        let base = ObjectMeta {
            name: Some("edge".into()),
            ..Default::default()
        };
        let hpa = horizontal_pod_autoscaler(
            &base,
            "edge",
            &HorizontalScaling {
                min_replicas: Some(2),
                max_replicas: 5,
                ..Default::default()
            },
        )
        .unwrap();
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.scale_target_ref.name, "dataplane-edge");
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 5);

        let inverted = HorizontalScaling {
            min_replicas: Some(6),
            max_replicas: 5,
            ..Default::default()
        };
        assert!(matches!(
            horizontal_pod_autoscaler(&base, "edge", &inverted),
            Err(Error::InvalidDataPlaneSpec(_))
        ));
    }

    #[test]
    fn budget_needs_exactly_one_threshold() {
        let base = ObjectMeta::default();
        let both = PodDisruptionBudgetOptionsSpec {
            min_available: Some(IntOrString::Int(1)),
            max_unavailable: Some(IntOrString::Int(1)),
            ..Default::default()
        };
        assert!(pod_disruption_budget(&base, "edge", &both).is_err());
        assert!(pod_disruption_budget(&base, "edge", &Default::default()).is_err());
        assert!(pod_disruption_budget(
            &base,
            "edge",
            &min_available(IntOrString::String("half".into()))
        )
        .is_err());

        let pdb =
            pod_disruption_budget(&base, "edge", &min_available(IntOrString::Int(1))).unwrap();
        let selector = pdb.spec.unwrap().selector.unwrap();
        assert_eq!(selector, label_selector("edge"));
    }

    #[test]
    fn disruptions_allowed_follows_min_available() {
        for (min, allowed) in [(0, 2), (1, 1), (2, 0), (3, 0)] {
            let summary = disruption_summary(&min_available(IntOrString::Int(min)), 2).unwrap();
            assert_eq!(summary.expected_pods, 2);
            assert_eq!(summary.disruptions_allowed, allowed, "minAvailable={min}");
        }
    }

    #[test]
    fn percentages_round_up() {
        let summary =
            disruption_summary(&min_available(IntOrString::String("50%".into())), 3).unwrap();
        assert_eq!(summary.desired_healthy, 2);
        assert_eq!(summary.disruptions_allowed, 1);

        let max_unavailable = PodDisruptionBudgetOptionsSpec {
            max_unavailable: Some(IntOrString::String("10%".into())),
            ..Default::default()
        };
        let summary = disruption_summary(&max_unavailable, 4).unwrap();
        assert_eq!(summary.desired_healthy, 3);
        assert_eq!(summary.disruptions_allowed, 1);
    }

    #[test]
    fn no_ready_replicas_means_nothing_to_disrupt() {
        let summary = disruption_summary(&min_available(IntOrString::Int(1)), 0).unwrap();
        assert_eq!(
            summary,
            PodDisruptionBudgetSummary {
                expected_pods: 0,
                current_healthy: 0,
                desired_healthy: 1,
                disruptions_allowed: 0,
            }
        );
    }
}
