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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-side rendering of an experiment. Sent on registration; the
/// response echoes it back enriched with URLs and the server's effective
/// settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerExperiment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ServerParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<ServerMetric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimization: Vec<ServerOptimizationSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<i32>,
    /// Server-effective parallel trial count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
    /// Response-only links.
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_trial: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerParameter {
    pub name: String,
    pub bounds: ServerBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerBounds {
    pub min: i64,
    pub max: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetric {
    pub name: String,
    #[serde(default)]
    pub minimize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptimizationSetting {
    pub name: String,
    pub value: String,
}

/// Suggested parameter assignments for one trial, plus the URL the outcome
/// must be reported to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialAssignments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<ServerAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_trial: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<ServerOptimizationSetting>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAssignment {
    pub parameter_name: String,
    pub value: i64,
}

/// Reported outcome of a finished trial.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialValues {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ServerValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerValue {
    pub metric_name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
}

/// One entry of the activity feed. `tags` distinguishes scan requests from
/// run requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// URL of the scenario this activity refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ActivityItem {
    pub const TAG_SCAN: &'static str = "scan";
    pub const TAG_RUN: &'static str = "run";

    pub fn is_scan(&self) -> bool {
        self.tags.iter().any(|t| t == Self::TAG_SCAN)
    }

    pub fn is_run(&self) -> bool {
        self.tags.iter().any(|t| t == Self::TAG_RUN)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFeed {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ActivityItem>,
}

/// A scenario as served by the activity feed: which application to scan and
/// where the generated template lives.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of the cluster `Application` this scenario refers to.
    pub application: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub template_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_url: Option<String>,
}
