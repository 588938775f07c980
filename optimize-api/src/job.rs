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

use crate::trial::{PatchType, TargetRef, Trial};
use crate::{LABEL_EXPERIMENT, LABEL_TRIAL, LABEL_TRIAL_ROLE, TRIAL_ROLE_RUN};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to serialize the trial job: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Builds the trial-run job from the trial's template, stamping labels and
/// defaults, injecting assignments as environment variables, and finally
/// overlaying any strategic-merge patch operation targeting the job itself.
pub fn new_job(trial: &Trial) -> Result<Job, JobError> {
    let mut job = Job::default();

    if let Some(template) = &trial.spec.job_template {
        if let Some(metadata) = &template.metadata {
            job.metadata = metadata.clone();
        }
        job.spec = template.spec.clone();
    }

    let labels = trial_run_labels(trial);
    extend_labels(&mut job.metadata, &labels);
    if job.metadata.namespace.is_none() {
        job.metadata.namespace = trial.namespace();
    }
    if job.metadata.name.is_none() && job.metadata.generate_name.is_none() {
        job.metadata.name = Some(trial.name_any());
    }

    let spec = job.spec.get_or_insert_with(JobSpec::default);
    if spec.backoff_limit.is_none() {
        spec.backoff_limit = Some(0);
    }

    let template: &mut PodTemplateSpec = &mut spec.template;
    let pod_meta = template.metadata.get_or_insert_with(ObjectMeta::default);
    extend_labels(pod_meta, &labels);

    let pod_spec = template
        .spec
        .get_or_insert_with(k8s_openapi::api::core::v1::PodSpec::default);
    if pod_spec.restart_policy.is_none() {
        pod_spec.restart_policy = Some("Never".to_string());
    }

    let env = assignment_env(trial);
    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(default_run_container(trial, &env));
    } else {
        for container in pod_spec.containers.iter_mut() {
            container
                .env
                .get_or_insert_with(Vec::new)
                .extend(env.iter().cloned());
        }
    }

    apply_self_patches(trial, job)
}

fn trial_run_labels(trial: &Trial) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(experiment_ref) = trial.experiment_ref() {
        labels.insert(LABEL_EXPERIMENT.to_string(), experiment_ref.name);
    }
    labels.insert(LABEL_TRIAL.to_string(), trial.name_any());
    labels.insert(LABEL_TRIAL_ROLE.to_string(), TRIAL_ROLE_RUN.to_string());
    labels
}

fn extend_labels(metadata: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Assignments as environment variables: `nginx_cpu=200` becomes
/// `NGINX_CPU=200`.
fn assignment_env(trial: &Trial) -> Vec<EnvVar> {
    trial
        .spec
        .assignments
        .iter()
        .map(|assignment| EnvVar {
            name: env_name(&assignment.name),
            value: Some(assignment.value.to_string()),
            value_from: None,
        })
        .collect()
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Placeholder workload driving the trial for its approximate runtime when
/// the template carries no containers of its own.
fn default_run_container(trial: &Trial, env: &[EnvVar]) -> Container {
    Container {
        name: "default-trial-run".to_string(),
        image: Some("busybox".to_string()),
        command: Some(vec!["sleep".to_string()]),
        args: Some(vec![trial.default_run_seconds().to_string()]),
        env: Some(env.to_vec()),
        ..Container::default()
    }
}

/// Overlays every strategic-merge patch operation whose target is this
/// trial's job over the constructed job.
fn apply_self_patches(trial: &Trial, job: Job) -> Result<Job, JobError> {
    let Some(status) = trial.status.as_ref() else {
        return Ok(job);
    };

    let job_ref = TargetRef {
        api_version: Some("batch/v1".to_string()),
        kind: Some("Job".to_string()),
        name: job.metadata.name.clone().unwrap_or_else(|| trial.name_any()),
        namespace: job.metadata.namespace.clone(),
    };

    let mut merged = serde_json::to_value(&job)?;
    let mut patched = false;
    for op in &status.patch_operations {
        if op.patch_type != PatchType::StrategicMerge || !op.target_ref.matches(&job_ref) {
            continue;
        }
        merge_json(&mut merged, &op.data);
        patched = true;
    }

    if patched {
        Ok(serde_json::from_value(merged)?)
    } else {
        Ok(job)
    }
}

/// RFC 7386 style merge: objects merge recursively, null removes, everything
/// else replaces.
fn merge_json(target: &mut JsonValue, patch: &JsonValue) {
    let JsonValue::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = JsonValue::Object(serde_json::Map::new());
    }
    if let JsonValue::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_json(
                    target_map.entry(key.clone()).or_insert(JsonValue::Null),
                    value,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::trial::{Assignment, PatchOperation, TrialSpec, TrialStatus};
    use kube::ResourceExt;

    fn trial() -> Trial {
        let mut trial = Trial::new(
            "t-1",
            TrialSpec {
                assignments: vec![
                    Assignment {
                        name: "nginx_cpu".into(),
                        value: 200,
                    },
                    Assignment {
                        name: "replicas".into(),
                        value: 2,
                    },
                ],
                ..TrialSpec::default()
            },
        );
        trial.metadata.namespace = Some("engineering".into());
        trial
            .labels_mut()
            .insert(LABEL_EXPERIMENT.to_string(), "exp-1".to_string());
        trial
    }

    #[test]
    fn job_and_pod_template_carry_the_trial_labels() {
        let job = new_job(&trial()).unwrap();

        for labels in [
            job.metadata.labels.as_ref().unwrap(),
            job.spec
                .as_ref()
                .unwrap()
                .template
                .metadata
                .as_ref()
                .unwrap()
                .labels
                .as_ref()
                .unwrap(),
        ] {
            assert_eq!(labels.get(LABEL_EXPERIMENT).unwrap(), "exp-1");
            assert_eq!(labels.get(LABEL_TRIAL).unwrap(), "t-1");
            assert_eq!(labels.get(LABEL_TRIAL_ROLE).unwrap(), TRIAL_ROLE_RUN);
        }
    }

    #[test]
    fn defaults_are_applied() {
        let job = new_job(&trial()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("t-1"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("engineering"));

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod_spec = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn empty_template_gets_a_sleep_container_with_default_runtime() {
        let job = new_job(&trial()).unwrap();
        let containers = &job.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].command.as_ref().unwrap()[0], "sleep");
        // 2 minute default runtime, no start time offset
        assert_eq!(containers[0].args.as_ref().unwrap()[0], "120");
    }

    #[test]
    fn sleep_duration_includes_the_start_time_offset() {
        let mut t = trial();
        t.spec.approximate_runtime = Some(300);
        t.spec.start_time_offset = Some(15);
        let job = new_job(&t).unwrap();
        let containers = &job.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers[0].args.as_ref().unwrap()[0], "315");
    }

    #[test]
    fn assignments_become_env_vars_on_existing_containers() {
        let mut t = trial();
        t.spec.job_template = Some(k8s_openapi::api::batch::v1::JobTemplateSpec {
            metadata: None,
            spec: Some(k8s_openapi::api::batch::v1::JobSpec {
                template: k8s_openapi::api::core::v1::PodTemplateSpec {
                    metadata: None,
                    spec: Some(k8s_openapi::api::core::v1::PodSpec {
                        containers: vec![Container {
                            name: "load".into(),
                            image: Some("load-driver".into()),
                            ..Container::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
        });

        let job = new_job(&t).unwrap();
        let containers = &job.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers.len(), 1);
        let env = containers[0].env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "NGINX_CPU" && e.value.as_deref() == Some("200")));
        assert!(env
            .iter()
            .any(|e| e.name == "REPLICAS" && e.value.as_deref() == Some("2")));
    }

    #[test]
    fn strategic_merge_self_patch_overlays_the_job() {
        let mut t = trial();
        t.status = Some(TrialStatus {
            patch_operations: vec![PatchOperation {
                target_ref: TargetRef {
                    api_version: Some("batch/v1".into()),
                    kind: Some("Job".into()),
                    name: "t-1".into(),
                    namespace: None,
                },
                patch_type: PatchType::StrategicMerge,
                data: serde_json::json!({"spec": {"activeDeadlineSeconds": 600}}),
                attempts_remaining: 0,
                wait: false,
            }],
            ..TrialStatus::default()
        });

        let job = new_job(&t).unwrap();
        assert_eq!(job.spec.unwrap().active_deadline_seconds, Some(600));
    }

    #[test]
    fn non_job_patches_are_ignored_by_the_builder() {
        let mut t = trial();
        t.status = Some(TrialStatus {
            patch_operations: vec![PatchOperation {
                target_ref: TargetRef {
                    api_version: Some("apps/v1".into()),
                    kind: Some("Deployment".into()),
                    name: "nginx".into(),
                    namespace: None,
                },
                patch_type: PatchType::StrategicMerge,
                data: serde_json::json!({"spec": {"replicas": 3}}),
                attempts_remaining: 0,
                wait: true,
            }],
            ..TrialStatus::default()
        });

        let job = new_job(&t).unwrap();
        assert!(job.spec.unwrap().active_deadline_seconds.is_none());
    }
}
