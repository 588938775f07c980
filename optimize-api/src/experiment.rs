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

use crate::trial::{ReadinessGate, TargetRef, TrialSpec};
use crate::{ANNOTATION_EXPERIMENT_URL, ANNOTATION_NEXT_TRIAL_URL};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declarative spec of a parameter search: the space, the outcome metrics,
/// the patches that mutate the targets, and the template trials are stamped
/// from.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "optimize.golem.cloud",
    version = "v1beta1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Active","type":"integer","jsonPath":".status.activeTrials"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_template: Option<TrialTemplate>,
    /// Parallel trial budget. Zero pauses the experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Total number of trials the server should suggest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<i32>,
    /// Trials ignored by the optimizer at the start of the experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_in: Option<i32>,
    /// Name/value settings forwarded verbatim to the server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimization: Vec<OptimizationSetting>,
    /// Selector for namespaces eligible to host trials; the trial template's
    /// own namespace wins when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_namespace_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub active_trials: i32,
}

/// A named integer range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    pub min: i64,
    pub max: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<i64>,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Local,
    Prometheus,
    #[serde(rename = "jsonpath")]
    JsonPath,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: String,
    /// Smaller is better.
    #[serde(default)]
    pub minimize: bool,
    #[serde(default, rename = "type")]
    pub metric_type: MetricType,
    /// Query template; rendered against the trial before capture.
    #[serde(default)]
    pub query: String,
    /// Optional query producing the standard deviation of the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Port and path of the metrics endpoint on the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Capture target; defaults to the trial itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// When false the server records the value without optimizing for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
}

/// A patch template together with the object it applies to and the readiness
/// gates to wait on afterwards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
    /// Template rendered against the trial; the result must be a patch body.
    #[serde(default)]
    pub patch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<crate::trial::PatchType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_gates: Option<Vec<ReadinessGate>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSetting {
    pub name: String,
    pub value: String,
}

/// Template stamped out for every trial of the experiment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrialTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<TrialSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<std::collections::BTreeMap<String, String>>,
}

impl Experiment {
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1).max(0)
    }

    pub fn experiment_url(&self) -> Option<&String> {
        self.annotations().get(ANNOTATION_EXPERIMENT_URL)
    }

    pub fn next_trial_url(&self) -> Option<&String> {
        self.annotations().get(ANNOTATION_NEXT_TRIAL_URL)
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn replicas_default_to_one_and_never_go_negative() {
        let mut experiment = Experiment::new("exp-1", ExperimentSpec::default());
        assert_eq!(experiment.replicas(), 1);

        experiment.spec.replicas = Some(0);
        assert_eq!(experiment.replicas(), 0);

        experiment.spec.replicas = Some(-3);
        assert_eq!(experiment.replicas(), 0);
    }

    #[test]
    fn server_urls_come_from_annotations() {
        let mut experiment = Experiment::new("exp-1", ExperimentSpec::default());
        assert!(experiment.experiment_url().is_none());

        experiment.annotations_mut().insert(
            crate::ANNOTATION_EXPERIMENT_URL.to_string(),
            "https://api.example.invalid/experiments/exp-1".to_string(),
        );
        assert!(experiment.experiment_url().is_some());
        assert!(experiment.next_trial_url().is_none());
    }

    #[test]
    fn metric_type_serializes_lowercase() {
        let metric = Metric {
            name: "p95".into(),
            minimize: true,
            metric_type: MetricType::Prometheus,
            ..Metric::default()
        };
        let json = serde_json::to_value(&metric).unwrap();
        assert_eq!(json["type"], "prometheus");
        assert_eq!(json["minimize"], true);
    }
}
