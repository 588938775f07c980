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

use kube::ResourceExt;
use optimize_api::experiment::PatchTemplate;
use optimize_api::trial::{PatchOperation, PatchType, TargetRef, Trial};
use serde_json::Value as JsonValue;

pub const DEFAULT_PATCH_ATTEMPTS: i32 = 3;

/// Packages a rendered patch into a typed operation with its retry budget.
pub trait PatchAssembler: Send + Sync {
    /// `None` when the rendered patch has nothing to apply.
    fn create_patch_operation(
        &self,
        trial: &Trial,
        template: &PatchTemplate,
        target_ref: &TargetRef,
        data: &JsonValue,
    ) -> Option<PatchOperation>;
}

pub struct PatchAssemblerDefault;

impl PatchAssembler for PatchAssemblerDefault {
    fn create_patch_operation(
        &self,
        trial: &Trial,
        template: &PatchTemplate,
        target_ref: &TargetRef,
        data: &JsonValue,
    ) -> Option<PatchOperation> {
        let empty = match data {
            JsonValue::Null => true,
            JsonValue::Object(map) => map.is_empty(),
            _ => false,
        };

        let trial_job = is_trial_job_ref(trial, target_ref);

        Some(PatchOperation {
            target_ref: target_ref.clone(),
            patch_type: template.patch_type.unwrap_or_default(),
            data: data.clone(),
            // pre-zero empty renders so the apply loop skips them
            attempts_remaining: if empty { 0 } else { DEFAULT_PATCH_ATTEMPTS },
            // the trial-run job is patched at construction time instead of
            // through the cluster, and never waits on readiness
            wait: !empty && !trial_job,
        })
    }
}

/// Whether the reference points at this trial's own run job.
pub fn is_trial_job_ref(trial: &Trial, target_ref: &TargetRef) -> bool {
    target_ref.kind.as_deref() == Some("Job")
        && target_ref.api_version.as_deref() == Some("batch/v1")
        && target_ref.name == trial.name_any()
}

/// Config kinds are applied before workloads so a workload restart already
/// sees the tuned configuration.
pub fn sort_config_first(operations: &mut [PatchOperation]) {
    operations.sort_by_key(|op| {
        !matches!(
            op.target_ref.kind.as_deref(),
            Some("ConfigMap") | Some("Secret")
        )
    });
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use optimize_api::trial::TrialSpec;

    fn trial() -> Trial {
        Trial::new("t-1", TrialSpec::default())
    }

    fn target(kind: &str, name: &str) -> TargetRef {
        TargetRef {
            api_version: Some(if kind == "Job" { "batch/v1" } else { "apps/v1" }.into()),
            kind: Some(kind.into()),
            name: name.into(),
            namespace: None,
        }
    }

    #[test]
    fn rendered_patch_gets_the_default_budget() {
        let op = PatchAssemblerDefault
            .create_patch_operation(
                &trial(),
                &PatchTemplate::default(),
                &target("Deployment", "nginx"),
                &serde_json::json!({"spec": {"replicas": 2}}),
            )
            .unwrap();
        assert_eq!(op.attempts_remaining, DEFAULT_PATCH_ATTEMPTS);
        assert!(op.wait);
        assert_eq!(op.patch_type, PatchType::StrategicMerge);
    }

    #[test]
    fn null_and_empty_patches_are_pre_zeroed() {
        for data in [serde_json::Value::Null, serde_json::json!({})] {
            let op = PatchAssemblerDefault
                .create_patch_operation(
                    &trial(),
                    &PatchTemplate::default(),
                    &target("Deployment", "nginx"),
                    &data,
                )
                .unwrap();
            assert_eq!(op.attempts_remaining, 0);
            assert!(!op.wait);
        }
    }

    #[test]
    fn trial_job_patches_do_not_wait() {
        let op = PatchAssemblerDefault
            .create_patch_operation(
                &trial(),
                &PatchTemplate::default(),
                &target("Job", "t-1"),
                &serde_json::json!({"spec": {"activeDeadlineSeconds": 60}}),
            )
            .unwrap();
        assert!(!op.wait);
    }

    #[test]
    fn explicit_patch_type_is_kept() {
        let template = PatchTemplate {
            patch_type: Some(PatchType::Merge),
            ..PatchTemplate::default()
        };
        let op = PatchAssemblerDefault
            .create_patch_operation(
                &trial(),
                &template,
                &target("Deployment", "nginx"),
                &serde_json::json!({"spec": {}}),
            )
            .unwrap();
        assert_eq!(op.patch_type, PatchType::Merge);
    }

    #[test]
    fn config_kinds_sort_first() {
        let mut ops = vec![
            PatchOperation {
                target_ref: target("Deployment", "nginx"),
                ..PatchOperation::default()
            },
            PatchOperation {
                target_ref: target("ConfigMap", "tuning"),
                ..PatchOperation::default()
            },
            PatchOperation {
                target_ref: target("StatefulSet", "db"),
                ..PatchOperation::default()
            },
            PatchOperation {
                target_ref: target("Secret", "creds"),
                ..PatchOperation::default()
            },
        ];
        sort_config_first(&mut ops);

        let kinds: Vec<_> = ops
            .iter()
            .map(|op| op.target_ref.kind.clone().unwrap())
            .collect();
        assert_eq!(kinds, vec!["ConfigMap", "Secret", "Deployment", "StatefulSet"]);
    }
}
