// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Condition type evaluated by kind-aware stability checks instead of the
/// object's own condition list.
pub const CONDITION_TYPE_APP_READY: &str = "optimize.golem.cloud/app-ready";

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("target is not a valid {kind}: {message}")]
    InvalidTarget { kind: String, message: String },
}

/// Evaluates the condition types against a fetched object. Returns the
/// first unready condition's message, or ok. Objects without a kind are
/// never checked.
pub fn check_conditions(
    object: &JsonValue,
    condition_types: &[String],
) -> Result<(String, bool), ReadinessError> {
    for condition_type in condition_types {
        let (message, ok) = if condition_type == CONDITION_TYPE_APP_READY {
            check_app_ready(object)?
        } else {
            check_object_condition(object, condition_type)
        };
        if !ok {
            return Ok((message, false));
        }
    }
    Ok((String::new(), true))
}

/// Looks the condition up in `status.conditions`; an absent condition is
/// unready, not an error.
fn check_object_condition(object: &JsonValue, condition_type: &str) -> (String, bool) {
    let conditions = object
        .pointer("/status/conditions")
        .and_then(|c| c.as_array());
    let Some(conditions) = conditions else {
        return (format!("waiting for condition {condition_type}"), false);
    };

    match conditions
        .iter()
        .find(|c| c["type"].as_str() == Some(condition_type))
    {
        Some(condition) if condition["status"].as_str() == Some("True") => (String::new(), true),
        Some(condition) => {
            let message = condition["message"].as_str().unwrap_or_default();
            (
                format!("condition {condition_type} is not true: {message}"),
                false,
            )
        }
        None => (format!("waiting for condition {condition_type}"), false),
    }
}

/// Kind-aware stability: rollouts finished, every replica ready.
fn check_app_ready(object: &JsonValue) -> Result<(String, bool), ReadinessError> {
    let kind = object["kind"].as_str().unwrap_or_default();
    match kind {
        "Deployment" => {
            let deployment: Deployment = typed(object, kind)?;
            Ok(check_deployment(&deployment))
        }
        "DaemonSet" => {
            let daemon_set: DaemonSet = typed(object, kind)?;
            Ok(check_daemon_set(&daemon_set))
        }
        "StatefulSet" => {
            let stateful_set: StatefulSet = typed(object, kind)?;
            Ok(check_stateful_set(&stateful_set))
        }
        // other kinds have no notion of stability here
        _ => Ok((String::new(), true)),
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    object: &JsonValue,
    kind: &str,
) -> Result<T, ReadinessError> {
    serde_json::from_value(object.clone()).map_err(|err| ReadinessError::InvalidTarget {
        kind: kind.to_string(),
        message: err.to_string(),
    })
}

pub fn check_deployment(deployment: &Deployment) -> (String, bool) {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);

    if status.observed_generation.unwrap_or(0) < deployment.metadata.generation.unwrap_or(0) {
        return ("deployment rollout not observed yet".to_string(), false);
    }
    if updated < desired {
        return (
            format!("deployment has {updated}/{desired} updated replicas"),
            false,
        );
    }
    if ready < desired {
        return (
            format!("deployment has {ready}/{desired} ready replicas"),
            false,
        );
    }
    (String::new(), true)
}

pub fn check_daemon_set(daemon_set: &DaemonSet) -> (String, bool) {
    let status = daemon_set.status.clone().unwrap_or_default();
    let desired = status.desired_number_scheduled;
    let ready = status.number_ready;

    if status.observed_generation.unwrap_or(0) < daemon_set.metadata.generation.unwrap_or(0) {
        return ("daemon set rollout not observed yet".to_string(), false);
    }
    if ready < desired {
        return (
            format!("daemon set has {ready}/{desired} ready pods"),
            false,
        );
    }
    (String::new(), true)
}

pub fn check_stateful_set(stateful_set: &StatefulSet) -> (String, bool) {
    let desired = stateful_set
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = stateful_set.status.clone().unwrap_or_default();
    let ready = status.ready_replicas.unwrap_or(0);

    if status.observed_generation.unwrap_or(0) < stateful_set.metadata.generation.unwrap_or(0) {
        return ("stateful set rollout not observed yet".to_string(), false);
    }
    if ready < desired {
        return (
            format!("stateful set has {ready}/{desired} ready replicas"),
            false,
        );
    }
    (String::new(), true)
}

/// Every pod running (or finished) and none terminating.
pub fn check_pods(pods: &[Pod]) -> (String, bool) {
    for pod in pods {
        let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
        if pod.metadata.deletion_timestamp.is_some() {
            return (format!("pod {name} is terminating"), false);
        }
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        match phase {
            "Running" | "Succeeded" => {}
            other => return (format!("pod {name} is {other}"), false),
        }
    }
    (String::new(), true)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    fn deployment(desired: i32, updated: i32, ready: i32) -> Deployment {
        Deployment {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(1),
                updated_replicas: Some(updated),
                ready_replicas: Some(ready),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn deployment_with_all_replicas_ready_passes() {
        let (_, ok) = check_deployment(&deployment(2, 2, 2));
        assert!(ok);
    }

    #[test]
    fn deployment_mid_rollout_is_not_ready() {
        let (message, ok) = check_deployment(&deployment(2, 1, 2));
        assert!(!ok);
        assert!(message.contains("updated"));

        let (message, ok) = check_deployment(&deployment(2, 2, 1));
        assert!(!ok);
        assert!(message.contains("ready"));
    }

    #[test]
    fn stale_observed_generation_is_not_ready() {
        let mut d = deployment(1, 1, 1);
        d.metadata.generation = Some(2);
        let (_, ok) = check_deployment(&d);
        assert!(!ok);
    }

    #[test]
    fn generic_condition_is_read_from_status() {
        let object = serde_json::json!({
            "kind": "Deployment",
            "status": {"conditions": [
                {"type": "AppReady", "status": "True"}
            ]}
        });
        let (_, ok) = check_conditions(&object, &["AppReady".to_string()]).unwrap();
        assert!(ok);

        let (message, ok) =
            check_conditions(&object, &["SomethingElse".to_string()]).unwrap();
        assert!(!ok);
        assert!(message.contains("SomethingElse"));
    }

    #[test]
    fn app_ready_dispatches_on_kind() {
        let object = serde_json::to_value(deployment(1, 1, 1)).map(|mut v| {
            v["kind"] = "Deployment".into();
            v
        })
        .unwrap();
        let (_, ok) =
            check_conditions(&object, &[CONDITION_TYPE_APP_READY.to_string()]).unwrap();
        assert!(ok);

        let object = serde_json::to_value(deployment(3, 1, 1)).map(|mut v| {
            v["kind"] = "Deployment".into();
            v
        })
        .unwrap();
        let (_, ok) =
            check_conditions(&object, &[CONDITION_TYPE_APP_READY.to_string()]).unwrap();
        assert!(!ok);
    }

    #[test]
    fn unknown_kinds_are_trivially_stable() {
        let object = serde_json::json!({"kind": "ConfigMap"});
        let (_, ok) =
            check_conditions(&object, &[CONDITION_TYPE_APP_READY.to_string()]).unwrap();
        assert!(ok);
    }

    #[test]
    fn terminating_pod_is_not_ready() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p-1", "deletionTimestamp": "2026-01-01T00:00:00Z"},
            "status": {"phase": "Running"}
        }))
        .unwrap();
        let (message, ok) = check_pods(&[pod]);
        assert!(!ok);
        assert!(message.contains("terminating"));
    }
}
