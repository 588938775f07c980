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

use crate::trial::TrialStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The gates of the trial lifecycle. Reconcilers communicate exclusively by
/// flipping these; there are no cross-reconciler calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum TrialConditionType {
    SetupCreated,
    SetupDeleted,
    Patched,
    Ready,
    Observed,
    Complete,
    Failed,
}

impl Display for TrialConditionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialConditionType::SetupCreated => write!(f, "SetupCreated"),
            TrialConditionType::SetupDeleted => write!(f, "SetupDeleted"),
            TrialConditionType::Patched => write!(f, "Patched"),
            TrialConditionType::Ready => write!(f, "Ready"),
            TrialConditionType::Observed => write!(f, "Observed"),
            TrialConditionType::Complete => write!(f, "Complete"),
            TrialConditionType::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionStatus {
    #[default]
    Unknown,
    False,
    True,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrialCondition {
    #[serde(rename = "type")]
    pub condition_type: TrialConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_probe_time: Time,
    pub last_transition_time: Time,
}

/// Applies a condition to the status, preserving the transition time when
/// only the probe changed.
///
/// When the condition exists with a different status the status, reason and
/// message are overwritten and the transition time moves to `probe_time`.
/// When the status is unchanged only the probe time advances; reason and
/// message are overwritten only if the reason differs. An absent condition is
/// appended with both times set to `probe_time`.
pub fn apply_condition(
    status: &mut TrialStatus,
    condition_type: TrialConditionType,
    new_status: ConditionStatus,
    reason: &str,
    message: &str,
    probe_time: Time,
) {
    for condition in status.conditions.iter_mut() {
        if condition.condition_type != condition_type {
            continue;
        }
        if condition.status != new_status {
            condition.status = new_status;
            condition.reason = Some(reason.to_string());
            condition.message = Some(message.to_string());
            condition.last_transition_time = probe_time.clone();
        } else if condition.reason.as_deref() != Some(reason) {
            condition.reason = Some(reason.to_string());
            condition.message = Some(message.to_string());
        }
        condition.last_probe_time = probe_time;
        return;
    }

    status.conditions.push(TrialCondition {
        condition_type,
        status: new_status,
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_probe_time: probe_time.clone(),
        last_transition_time: probe_time,
    });
}

/// Returns true when the condition has the wanted status. An absent
/// condition matches only `Unknown`.
pub fn check_condition(
    status: &TrialStatus,
    condition_type: TrialConditionType,
    want: ConditionStatus,
) -> bool {
    match status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
    {
        Some(condition) => condition.status == want,
        None => want == ConditionStatus::Unknown,
    }
}

pub fn get_condition(
    status: &TrialStatus,
    condition_type: TrialConditionType,
) -> Option<&TrialCondition> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn absent_condition_is_appended_with_both_times() {
        let mut status = TrialStatus::default();
        apply_condition(
            &mut status,
            TrialConditionType::Patched,
            ConditionStatus::False,
            "PatchPending",
            "",
            at(10),
        );

        assert_eq!(status.conditions.len(), 1);
        let c = &status.conditions[0];
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.last_probe_time, at(10));
        assert_eq!(c.last_transition_time, at(10));
    }

    #[test]
    fn unchanged_status_only_moves_the_probe_time() {
        let mut status = TrialStatus::default();
        apply_condition(
            &mut status,
            TrialConditionType::Patched,
            ConditionStatus::False,
            "PatchPending",
            "",
            at(10),
        );
        apply_condition(
            &mut status,
            TrialConditionType::Patched,
            ConditionStatus::False,
            "PatchPending",
            "ignored because the reason is unchanged",
            at(20),
        );

        let c = &status.conditions[0];
        assert_eq!(c.last_probe_time, at(20));
        assert_eq!(c.last_transition_time, at(10));
        assert_eq!(c.message.as_deref(), Some(""));
    }

    #[test]
    fn changed_reason_overwrites_message_without_transition() {
        let mut status = TrialStatus::default();
        apply_condition(
            &mut status,
            TrialConditionType::Ready,
            ConditionStatus::False,
            "Waiting",
            "",
            at(10),
        );
        apply_condition(
            &mut status,
            TrialConditionType::Ready,
            ConditionStatus::False,
            "StillWaiting",
            "deployment not available",
            at(20),
        );

        let c = &status.conditions[0];
        assert_eq!(c.reason.as_deref(), Some("StillWaiting"));
        assert_eq!(c.message.as_deref(), Some("deployment not available"));
        assert_eq!(c.last_transition_time, at(10));
    }

    #[test]
    fn changed_status_moves_the_transition_time() {
        let mut status = TrialStatus::default();
        apply_condition(
            &mut status,
            TrialConditionType::Patched,
            ConditionStatus::False,
            "PatchPending",
            "",
            at(10),
        );
        apply_condition(
            &mut status,
            TrialConditionType::Patched,
            ConditionStatus::True,
            "Patched",
            "",
            at(30),
        );

        let c = &status.conditions[0];
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.last_transition_time, at(30));
        assert_eq!(c.last_probe_time, at(30));
    }

    #[test]
    fn apply_condition_is_idempotent_on_unchanged_input() {
        let mut status = TrialStatus::default();
        for _ in 0..2 {
            apply_condition(
                &mut status,
                TrialConditionType::Observed,
                ConditionStatus::True,
                "Observed",
                "",
                at(10),
            );
        }
        let again = status.clone();
        apply_condition(
            &mut status,
            TrialConditionType::Observed,
            ConditionStatus::True,
            "Observed",
            "",
            at(10),
        );
        assert_eq!(status, again);
    }

    #[test]
    fn absent_condition_matches_only_unknown() {
        let status = TrialStatus::default();
        assert!(check_condition(
            &status,
            TrialConditionType::Failed,
            ConditionStatus::Unknown
        ));
        assert!(!check_condition(
            &status,
            TrialConditionType::Failed,
            ConditionStatus::False
        ));
        assert!(!check_condition(
            &status,
            TrialConditionType::Failed,
            ConditionStatus::True
        ));
    }
}
