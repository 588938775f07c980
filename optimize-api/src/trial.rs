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

use crate::condition::{check_condition, ConditionStatus, TrialCondition, TrialConditionType};
use crate::{
    ANNOTATION_INITIALIZER, ANNOTATION_SUGGESTION_SOURCE, LABEL_EXPERIMENT,
    SUGGESTION_SOURCE_BASELINE,
};
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One concrete point of an experiment's search space.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "optimize.golem.cloud",
    version = "v1beta1",
    kind = "Trial",
    namespaced,
    status = "TrialStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Assignments","type":"string","jsonPath":".status.assignments"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrialSpec {
    /// Explicit link back to the experiment; required when the trial runs in
    /// a different namespace than its experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_ref: Option<ExperimentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_tasks: Vec<SetupTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_service_account_name: Option<String>,
    /// Template of the trial-run job. A defaulted job is constructed when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_template: Option<JobTemplateSpec>,
    /// Delay between readiness and job creation, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    /// Seconds subtracted from the observed container start when deriving
    /// the trial start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_offset: Option<i64>,
    /// Expected runtime of the trial-run job, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_runtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_failure: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_gates: Vec<ReadinessGate>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatus {
    #[serde(default)]
    pub phase: String,
    /// Human readable summary of the assignments.
    #[serde(default)]
    pub assignments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TrialCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch_operations: Vec<PatchOperation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_checks: Vec<ReadinessCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub name: String,
    pub value: i64,
}

/// Container run before the trial (and torn down after it) to prepare the
/// target environment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetupTask {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Skip this task during the teardown pass.
    #[serde(default)]
    pub skip_delete: bool,
    /// Skip this task during the pre-trial pass.
    #[serde(default)]
    pub skip_create: bool,
}

/// Reference to an object a patch or readiness check applies to. An empty
/// name means selector based lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl TargetRef {
    /// Exact match on (name, kind, apiVersion); namespaces are deliberately
    /// not compared.
    pub fn matches(&self, other: &TargetRef) -> bool {
        self.name == other.name && self.kind == other.kind && self.api_version == other.api_version
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    #[default]
    #[serde(rename = "strategic")]
    StrategicMerge,
    Merge,
    Json,
}

/// A rendered patch waiting to be (or already) applied to the cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub target_ref: TargetRef,
    #[serde(default)]
    pub patch_type: PatchType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub attempts_remaining: i32,
    /// Whether a readiness check should be attached to the patched target.
    #[serde(default)]
    pub wait: bool,
}

/// Declarative wish for a readiness check, carried on trials and patch
/// templates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessGate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

/// A concrete, scheduled readiness check over a patched target.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessCheck {
    pub target_ref: TargetRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition_types: Vec<String>,
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default)]
    pub period_seconds: i32,
    #[serde(default)]
    pub attempts_remaining: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<Time>,
}

/// An observed metric value. The value is kept as its shortest round-trip
/// decimal rendering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Value {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts_remaining: i32,
}

impl Trial {
    pub fn is_finished(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            check_condition(status, TrialConditionType::Complete, ConditionStatus::True)
                || check_condition(status, TrialConditionType::Failed, ConditionStatus::True)
        })
    }

    /// A finished trial stays active while a pending teardown condition
    /// exists; without setup tasks it goes inactive as soon as it finishes.
    pub fn is_active(&self) -> bool {
        match self.status.as_ref() {
            Some(status) if self.is_finished() => {
                crate::condition::get_condition(status, TrialConditionType::SetupDeleted)
                    .is_some_and(|c| c.status != ConditionStatus::True)
            }
            _ => true,
        }
    }

    /// Deleted before producing a result; the server-side trial is released
    /// instead of reported.
    pub fn is_abandoned(&self) -> bool {
        self.meta().deletion_timestamp.is_some() && !self.is_finished()
    }

    pub fn is_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn is_baseline(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_SUGGESTION_SOURCE)
            .is_some_and(|source| source == SUGGESTION_SOURCE_BASELINE)
    }

    /// A trial with any initializer token is excluded from the
    /// patch/ready/job pipeline.
    pub fn is_initializing(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_INITIALIZER)
            .is_some_and(|tokens| tokens.split(',').any(|token| !token.trim().is_empty()))
    }

    pub fn has_initializer(&self, token: &str) -> bool {
        self.annotations()
            .get(ANNOTATION_INITIALIZER)
            .is_some_and(|tokens| tokens.split(',').any(|t| t.trim() == token))
    }

    /// Appends the token unless it is already present. Returns whether the
    /// annotation changed.
    pub fn add_initializer(&mut self, token: &str) -> bool {
        if self.has_initializer(token) {
            return false;
        }
        let annotations = self.annotations_mut();
        let value = match annotations.get(ANNOTATION_INITIALIZER) {
            Some(existing) if !existing.is_empty() => format!("{existing},{token}"),
            _ => token.to_string(),
        };
        annotations.insert(ANNOTATION_INITIALIZER.to_string(), value);
        true
    }

    /// Removes the first occurrence of the token. Returns whether the
    /// annotation changed.
    pub fn remove_initializer(&mut self, token: &str) -> bool {
        let annotations = self.annotations_mut();
        let Some(existing) = annotations.get(ANNOTATION_INITIALIZER) else {
            return false;
        };
        let mut tokens: Vec<&str> = existing.split(',').filter(|t| !t.trim().is_empty()).collect();
        let Some(index) = tokens.iter().position(|t| t.trim() == token) else {
            return false;
        };
        tokens.remove(index);
        let value = tokens.join(",");
        annotations.insert(ANNOTATION_INITIALIZER.to_string(), value);
        true
    }

    /// Name and namespace of the owning experiment: the explicit reference
    /// wins, then the experiment label with the trial's own namespace.
    pub fn experiment_ref(&self) -> Option<ExperimentRef> {
        if let Some(experiment_ref) = &self.spec.experiment_ref {
            return Some(ExperimentRef {
                name: experiment_ref.name.clone(),
                namespace: experiment_ref.namespace.clone().or_else(|| self.namespace()),
            });
        }
        self.labels().get(LABEL_EXPERIMENT).map(|name| ExperimentRef {
            name: name.clone(),
            namespace: self.namespace(),
        })
    }

    /// Duration the default trial-run container sleeps for, in seconds.
    pub fn default_run_seconds(&self) -> i64 {
        let runtime = self.spec.approximate_runtime.unwrap_or(120);
        runtime + self.spec.start_time_offset.unwrap_or(0)
    }
}

/// Ordered scan of the conditions producing the human phase label. `Failed`
/// and `Complete` short-circuit.
pub fn summarize_phase(trial: &Trial) -> &'static str {
    let Some(status) = trial.status.as_ref() else {
        return "Created";
    };

    if check_condition(status, TrialConditionType::Failed, ConditionStatus::True) {
        return "Failed";
    }
    if check_condition(status, TrialConditionType::Complete, ConditionStatus::True) {
        return "Completed";
    }

    let mut phase = "Created";
    for condition in &status.conditions {
        phase = match (condition.condition_type, condition.status) {
            (TrialConditionType::SetupCreated, ConditionStatus::True) => "Setup Created",
            (TrialConditionType::SetupCreated, _) => "Setting up",
            (TrialConditionType::Patched, ConditionStatus::True) => "Patched",
            (TrialConditionType::Patched, ConditionStatus::False) => "Patching",
            (TrialConditionType::Ready, ConditionStatus::True) => {
                if status.start_time.is_some() {
                    "Running"
                } else {
                    "Stabilized"
                }
            }
            (TrialConditionType::Ready, ConditionStatus::False) => "Waiting",
            (TrialConditionType::Observed, ConditionStatus::True) => "Captured",
            (TrialConditionType::Observed, ConditionStatus::False) => "Capturing",
            _ => phase,
        };
    }
    phase
}

/// Human readable `name=value, …` rendering stored in the status.
pub fn summarize_assignments(trial: &Trial) -> String {
    trial
        .spec
        .assignments
        .iter()
        .map(|a| format!("{}={}", a.name, a.value))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::condition::apply_condition;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn trial_with(conditions: Vec<(TrialConditionType, ConditionStatus)>) -> Trial {
        let mut trial = Trial::new("t-1", TrialSpec::default());
        let mut status = TrialStatus::default();
        for (i, (condition_type, condition_status)) in conditions.into_iter().enumerate() {
            apply_condition(
                &mut status,
                condition_type,
                condition_status,
                "",
                "",
                at(i as i64),
            );
        }
        trial.status = Some(status);
        trial
    }

    #[test]
    fn add_then_remove_initializer_is_identity() {
        let mut trial = Trial::new("t-1", TrialSpec::default());
        assert!(trial.add_initializer("setup"));
        assert!(trial.remove_initializer("setup"));
        assert!(!trial.is_initializing());
        assert!(!trial.remove_initializer("setup"));
    }

    #[test]
    fn add_initializer_is_idempotent() {
        let mut trial = Trial::new("t-1", TrialSpec::default());
        assert!(trial.add_initializer("setup"));
        assert!(!trial.add_initializer("setup"));
        assert_eq!(
            trial.annotations().get(crate::ANNOTATION_INITIALIZER),
            Some(&"setup".to_string())
        );
    }

    #[test]
    fn multiple_initializers_are_comma_separated() {
        let mut trial = Trial::new("t-1", TrialSpec::default());
        trial.add_initializer("setup");
        trial.add_initializer("paused");
        assert!(trial.has_initializer("setup"));
        assert!(trial.has_initializer("paused"));
        trial.remove_initializer("setup");
        assert!(!trial.has_initializer("setup"));
        assert!(trial.has_initializer("paused"));
    }

    #[test]
    fn fresh_trial_is_active_and_unfinished() {
        let trial = trial_with(vec![]);
        assert!(!trial.is_finished());
        assert!(trial.is_active());
        assert_eq!(summarize_phase(&trial), "Created");
    }

    #[test]
    fn completed_trial_with_pending_teardown_stays_active() {
        let trial = trial_with(vec![
            (TrialConditionType::Complete, ConditionStatus::True),
            (TrialConditionType::SetupDeleted, ConditionStatus::False),
        ]);
        assert!(trial.is_finished());
        assert!(trial.is_active());
    }

    #[test]
    fn completed_trial_with_finished_teardown_is_inactive() {
        let trial = trial_with(vec![
            (TrialConditionType::Complete, ConditionStatus::True),
            (TrialConditionType::SetupDeleted, ConditionStatus::True),
        ]);
        assert!(!trial.is_active());
    }

    #[test]
    fn completed_trial_without_setup_tasks_is_inactive() {
        let trial = trial_with(vec![(TrialConditionType::Complete, ConditionStatus::True)]);
        assert!(trial.is_finished());
        assert!(!trial.is_active());
    }

    #[test]
    fn failed_never_also_reads_completed() {
        let trial = trial_with(vec![
            (TrialConditionType::Failed, ConditionStatus::True),
            (TrialConditionType::Complete, ConditionStatus::False),
        ]);
        assert_eq!(summarize_phase(&trial), "Failed");
    }

    #[test]
    fn phase_follows_the_pipeline() {
        let trial = trial_with(vec![
            (TrialConditionType::SetupCreated, ConditionStatus::True),
            (TrialConditionType::Patched, ConditionStatus::False),
        ]);
        assert_eq!(summarize_phase(&trial), "Patching");

        let trial = trial_with(vec![
            (TrialConditionType::Patched, ConditionStatus::True),
            (TrialConditionType::Ready, ConditionStatus::False),
        ]);
        assert_eq!(summarize_phase(&trial), "Waiting");
    }

    #[test]
    fn ready_reads_running_only_with_a_start_time() {
        let mut trial = trial_with(vec![(TrialConditionType::Ready, ConditionStatus::True)]);
        assert_eq!(summarize_phase(&trial), "Stabilized");

        trial.status.as_mut().unwrap().start_time = Some(at(100));
        assert_eq!(summarize_phase(&trial), "Running");
    }

    #[test]
    fn target_ref_matching_ignores_namespace() {
        let a = TargetRef {
            api_version: Some("apps/v1".into()),
            kind: Some("Deployment".into()),
            name: "nginx".into(),
            namespace: Some("engineering".into()),
        };
        let b = TargetRef {
            namespace: None,
            ..a.clone()
        };
        assert!(a.matches(&b));
    }
}
