//! Readiness of scale-target workloads, dispatched by kind.
use serde_json::Value;

use super::crd::{Mode, ScaleTargetKind};

/// Replica count and readiness read from a workload's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub replicas: i64,
    pub ready: bool,
}

fn status_i64(object: &Value, field: &str) -> i64 {
    object
        .get("status")
        .and_then(|s| s.get(field))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

pub fn workload_status(kind: ScaleTargetKind, object: &Value) -> WorkloadStatus {
    match kind {
        ScaleTargetKind::Deployment => {
            let available = object
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .is_some_and(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(Value::as_str) == Some("Available")
                            && c.get("status").and_then(Value::as_str) == Some("True")
                    })
                });
            WorkloadStatus {
                replicas: status_i64(object, "replicas"),
                ready: available || status_i64(object, "readyReplicas") > 0,
            }
        }
        ScaleTargetKind::Rollout => WorkloadStatus {
            replicas: status_i64(object, "readyReplicas"),
            ready: object.pointer("/status/phase").and_then(Value::as_str) == Some("Healthy"),
        },
    }
}

/// Mode implied by a workload status; `None` keeps the current mode.
pub fn compute_mode(status: WorkloadStatus) -> Option<Mode> {
    if status.replicas == 0 {
        Some(Mode::Proxy)
    } else if status.ready {
        Some(Mode::Serve)
    } else {
        None
    }
}

/// Desired replica count from `spec.replicas`; absent reads as 1, like the
/// API server's default.
pub fn spec_replicas(object: &Value) -> i64 {
    object
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_deployment_modes() {
        let scaled_down = json!({"status": {"replicas": 0}});
        assert_eq!(
            compute_mode(workload_status(ScaleTargetKind::Deployment, &scaled_down)),
            Some(Mode::Proxy)
        );

        let no_status = json!({"spec": {"replicas": 1}});
        assert_eq!(
            compute_mode(workload_status(ScaleTargetKind::Deployment, &no_status)),
            Some(Mode::Proxy)
        );

        let starting = json!({"status": {"replicas": 1, "readyReplicas": 0}});
        assert_eq!(
            compute_mode(workload_status(ScaleTargetKind::Deployment, &starting)),
            None
        );

        let available = json!({"status": {
            "replicas": 1,
            "conditions": [{"type": "Available", "status": "True"}]
        }});
        assert_eq!(
            compute_mode(workload_status(ScaleTargetKind::Deployment, &available)),
            Some(Mode::Serve)
        );
    }

    #[test]
    fn test_rollout_modes() {
        let degraded = json!({"status": {"readyReplicas": 2, "phase": "Degraded"}});
        assert_eq!(
            compute_mode(workload_status(ScaleTargetKind::Rollout, &degraded)),
            None
        );
        let healthy = json!({"status": {"readyReplicas": 2, "phase": "Healthy"}});
        assert_eq!(
            compute_mode(workload_status(ScaleTargetKind::Rollout, &healthy)),
            Some(Mode::Serve)
        );
        let empty = json!({"status": {"phase": "Healthy"}});
        assert_eq!(
            compute_mode(workload_status(ScaleTargetKind::Rollout, &empty)),
            Some(Mode::Proxy)
        );
    }

    #[test]
    fn test_spec_replicas_default() {
        assert_eq!(spec_replicas(&json!({"spec": {}})), 1);
        assert_eq!(spec_replicas(&json!({"spec": {"replicas": 0}})), 0);
    }
}
