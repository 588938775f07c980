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

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use optimize_api::condition::{ConditionStatus, TrialConditionType};
use optimize_api::trial::Trial;
use optimize_api::{
    LABEL_EXPERIMENT, LABEL_TRIAL, LABEL_TRIAL_ROLE, TRIAL_ROLE_SETUP,
};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Label distinguishing the pre-trial job from the teardown job.
pub const LABEL_SETUP_MODE: &str = "optimize.golem.cloud/setup-mode";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupMode {
    Create,
    Delete,
}

impl Display for SetupMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupMode::Create => write!(f, "create"),
            SetupMode::Delete => write!(f, "delete"),
        }
    }
}

/// Builds the setup job for one mode, or `None` when every task opts out of
/// that mode.
pub fn new_setup_job(trial: &Trial, mode: SetupMode) -> Option<Job> {
    let tasks: Vec<_> = trial
        .spec
        .setup_tasks
        .iter()
        .filter(|task| match mode {
            SetupMode::Create => !task.skip_create,
            SetupMode::Delete => !task.skip_delete,
        })
        .collect();
    if tasks.is_empty() {
        return None;
    }

    let mut labels = BTreeMap::new();
    if let Some(experiment_ref) = trial.experiment_ref() {
        labels.insert(LABEL_EXPERIMENT.to_string(), experiment_ref.name);
    }
    labels.insert(LABEL_TRIAL.to_string(), trial.name_any());
    labels.insert(LABEL_TRIAL_ROLE.to_string(), TRIAL_ROLE_SETUP.to_string());
    labels.insert(LABEL_SETUP_MODE.to_string(), mode.to_string());

    let env: Vec<EnvVar> = std::iter::once(EnvVar {
        name: "OPTIMIZE_SETUP_MODE".to_string(),
        value: Some(mode.to_string()),
        value_from: None,
    })
    .chain(trial.spec.assignments.iter().map(|assignment| EnvVar {
        name: assignment.name.to_ascii_uppercase().replace('-', "_"),
        value: Some(assignment.value.to_string()),
        value_from: None,
    }))
    .collect();

    let containers = tasks
        .iter()
        .map(|task| Container {
            name: task.name.clone(),
            image: Some(task.image.clone()),
            command: (!task.command.is_empty()).then(|| task.command.clone()),
            args: (!task.args.is_empty()).then(|| task.args.clone()),
            env: Some(env.clone()),
            ..Container::default()
        })
        .collect();

    Some(Job {
        metadata: ObjectMeta {
            name: Some(format!("{}-setup-{mode}", trial.name_any())),
            namespace: trial.namespace(),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    restart_policy: Some("Never".to_string()),
                    service_account_name: trial.spec.setup_service_account_name.clone(),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    })
}

/// Which trial condition a setup job reports into, read back off its mode
/// label.
pub fn trial_condition_type(job: &Job) -> Option<TrialConditionType> {
    match job.labels().get(LABEL_SETUP_MODE).map(String::as_str) {
        Some("create") => Some(TrialConditionType::SetupCreated),
        Some("delete") => Some(TrialConditionType::SetupDeleted),
        _ => None,
    }
}

/// `True` once the job succeeded, `False` while it exists and runs.
pub fn condition_status(job: &Job) -> ConditionStatus {
    let succeeded = job
        .status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or(0);
    if succeeded > 0 {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    }
}

/// First non-zero container exit across the job's pods, as
/// `(container, exit code, message)`.
pub fn container_failure(pods: &[Pod]) -> Option<(String, i32, String)> {
    for pod in pods {
        let Some(statuses) = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
        else {
            continue;
        };
        for status in statuses {
            let Some(terminated) = status.state.as_ref().and_then(|s| s.terminated.as_ref())
            else {
                continue;
            };
            if terminated.exit_code != 0 {
                let message = terminated
                    .message
                    .clone()
                    .or_else(|| terminated.reason.clone())
                    .unwrap_or_else(|| format!("exit code {}", terminated.exit_code));
                return Some((status.name.clone(), terminated.exit_code, message));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use optimize_api::trial::{SetupTask, TrialSpec};

    fn trial_with_tasks(tasks: Vec<SetupTask>) -> Trial {
        let mut trial = Trial::new(
            "t-1",
            TrialSpec {
                setup_tasks: tasks,
                ..TrialSpec::default()
            },
        );
        trial.metadata.namespace = Some("engineering".into());
        trial
    }

    fn task(name: &str) -> SetupTask {
        SetupTask {
            name: name.into(),
            image: "setup-tools:latest".into(),
            ..SetupTask::default()
        }
    }

    #[test]
    fn create_job_carries_the_setup_role_and_mode() {
        let trial = trial_with_tasks(vec![task("monitoring")]);
        let job = new_setup_job(&trial, SetupMode::Create).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("t-1-setup-create"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_TRIAL_ROLE).unwrap(), TRIAL_ROLE_SETUP);
        assert_eq!(labels.get(LABEL_SETUP_MODE).unwrap(), "create");
        assert_eq!(trial_condition_type(&job), Some(TrialConditionType::SetupCreated));
    }

    #[test]
    fn delete_job_maps_to_setup_deleted() {
        let trial = trial_with_tasks(vec![task("monitoring")]);
        let job = new_setup_job(&trial, SetupMode::Delete).unwrap();
        assert_eq!(trial_condition_type(&job), Some(TrialConditionType::SetupDeleted));
    }

    #[test]
    fn tasks_opting_out_of_a_mode_are_skipped() {
        let mut skipping = task("monitoring");
        skipping.skip_delete = true;
        let trial = trial_with_tasks(vec![skipping]);

        assert!(new_setup_job(&trial, SetupMode::Create).is_some());
        assert!(new_setup_job(&trial, SetupMode::Delete).is_none());
    }

    #[test]
    fn no_tasks_means_no_job() {
        let trial = trial_with_tasks(vec![]);
        assert!(new_setup_job(&trial, SetupMode::Create).is_none());
    }

    #[test]
    fn succeeded_job_reports_true() {
        let trial = trial_with_tasks(vec![task("monitoring")]);
        let mut job = new_setup_job(&trial, SetupMode::Create).unwrap();
        assert_eq!(condition_status(&job), ConditionStatus::False);

        job.status = Some(k8s_openapi::api::batch::v1::JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(condition_status(&job), ConditionStatus::True);
    }

    #[test]
    fn non_zero_exit_code_is_surfaced() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p-1"},
            "status": {"containerStatuses": [{
                "name": "monitoring",
                "image": "setup-tools:latest",
                "imageID": "",
                "ready": false,
                "restartCount": 0,
                "state": {"terminated": {"exitCode": 2, "reason": "Error"}}
            }]}
        }))
        .unwrap();

        let (container, exit_code, message) = container_failure(&[pod]).unwrap();
        assert_eq!(container, "monitoring");
        assert_eq!(exit_code, 2);
        assert_eq!(message, "Error");
    }

    #[test]
    fn zero_exit_codes_are_fine() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p-1"},
            "status": {"containerStatuses": [{
                "name": "monitoring",
                "image": "setup-tools:latest",
                "imageID": "",
                "ready": true,
                "restartCount": 0,
                "state": {"terminated": {"exitCode": 0}}
            }]}
        }))
        .unwrap();
        assert!(container_failure(&[pod]).is_none());
    }
}
