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

use super::{
    fail_trial, is_already_exists, list_trial_jobs, now, update_trial_status, Error, Result,
    WriteOutcome, ERROR_REQUEUE,
};
use crate::metrics;
use crate::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use optimize_api::condition::{
    check_condition, get_condition, ConditionStatus, TrialConditionType,
};
use optimize_api::trial::Trial;
use optimize_api::TRIAL_ROLE_SETUP;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const CONTROLLER: &str = "trial-job";

const REASON_UNSCHEDULABLE: &str = "Unschedulable";

pub async fn run(ctx: Arc<Context>) {
    let trials: Api<Trial> = Api::all(ctx.client.clone());
    let jobs: Api<Job> = Api::all(ctx.client.clone());
    Controller::new(trials, watcher::Config::default().any_semantic())
        .owns(jobs, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                debug!(controller = CONTROLLER, %err, "reconcile error");
            }
        })
        .await;
}

fn error_policy(_trial: Arc<Trial>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(controller = CONTROLLER, %error, "reconcile failed");
    metrics::record_error(CONTROLLER);
    Action::requeue(ERROR_REQUEUE)
}

fn ignore_trial(trial: &Trial) -> bool {
    if trial.is_deleted() || trial.is_initializing() {
        return true;
    }
    let Some(status) = trial.status.as_ref() else {
        return true;
    };
    if check_condition(status, TrialConditionType::Failed, ConditionStatus::True) {
        return true;
    }
    if !check_condition(status, TrialConditionType::Ready, ConditionStatus::True) {
        return true;
    }
    status.start_time.is_some() && status.completion_time.is_some()
}

#[instrument(skip(trial, ctx), fields(trial = %trial.name_any()))]
async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action> {
    if ignore_trial(&trial) {
        return Ok(Action::await_change());
    }

    let mut trial = (*trial).clone();
    let probe_time = now();

    let jobs = list_trial_jobs(&ctx.client, &trial, None).await?;
    let job = jobs.iter().find(|job| {
        job.labels().get(optimize_api::LABEL_TRIAL_ROLE).map(String::as_str)
            != Some(TRIAL_ROLE_SETUP)
    });

    let Some(job) = job else {
        return create_job(&ctx, &trial, probe_time.0).await;
    };

    let pods = job_pods(&ctx, job).await?;

    if let Some(failure) = detect_failure(job, &pods) {
        let unschedulable = matches!(failure, JobFailure::Unschedulable { .. });
        let (reason, message) = failure.into_parts();
        fail_trial(&mut trial, &reason, &message, probe_time);
        if unschedulable {
            suspend_job(&ctx, job).await?;
        }
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::await_change()),
        };
    }

    let (start_time, completion_time) = derive_times(&trial, job, &pods);
    let previous = trial
        .status
        .as_ref()
        .map(|s| (s.start_time.clone(), s.completion_time.clone()))
        .unwrap_or_default();
    let changed = previous != (start_time.clone(), completion_time.clone());

    if let Some(status) = trial.status.as_mut() {
        status.start_time = start_time;
        status.completion_time = completion_time.clone();
    }

    if changed {
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::requeue(Duration::ZERO)),
        };
    }

    // the job says it finished but the pods have not converged yet
    let job_complete = job
        .status
        .as_ref()
        .and_then(|s| s.completion_time.as_ref())
        .is_some();
    if job_complete && completion_time.is_none() {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    Ok(Action::requeue(Duration::from_secs(5)))
}

/// Honors the post-readiness initial delay, then creates the trial-run job
/// owned by the trial.
async fn create_job(ctx: &Context, trial: &Trial, now: DateTime<Utc>) -> Result<Action> {
    let ready_at = trial
        .status
        .as_ref()
        .and_then(|s| get_condition(s, TrialConditionType::Ready))
        .map(|c| c.last_transition_time.0)
        .unwrap_or(now);
    let delay = chrono::Duration::seconds(trial.spec.initial_delay_seconds.unwrap_or(0) as i64);
    let start_at = ready_at + delay;
    if now < start_at {
        let wait = (start_at - now).to_std().unwrap_or_default();
        debug!(trial = %trial.name_any(), ?wait, "waiting before creating the trial job");
        return Ok(Action::requeue(wait));
    }

    let mut job = optimize_api::job::new_job(trial)?;
    job.metadata.owner_references = Some(vec![owner_reference(trial)]);

    let Some(namespace) = job.metadata.namespace.clone() else {
        return Ok(Action::await_change());
    };
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    match api.create(&PostParams::default(), &job).await {
        Ok(_) => {
            info!(trial = %trial.name_any(), job = ?job.metadata.name, "trial job created");
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(err) if is_already_exists(&err) => Ok(Action::requeue(Duration::from_secs(1))),
        Err(err) => Err(err.into()),
    }
}

fn owner_reference(trial: &Trial) -> OwnerReference {
    OwnerReference {
        api_version: optimize_api::API_VERSION.to_string(),
        kind: Trial::kind(&()).to_string(),
        name: trial.name_any(),
        uid: trial.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

async fn job_pods(ctx: &Context, job: &Job) -> Result<Vec<Pod>> {
    let Some(namespace) = job.namespace() else {
        return Ok(Vec::new());
    };
    let Some(name) = job.metadata.name.clone() else {
        return Ok(Vec::new());
    };
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    Ok(api
        .list(&ListParams::default().labels(&format!("job-name={name}")))
        .await?
        .items)
}

async fn suspend_job(ctx: &Context, job: &Job) -> Result<()> {
    let Some(namespace) = job.namespace() else {
        return Ok(());
    };
    let Some(name) = job.metadata.name.clone() else {
        return Ok(());
    };
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    // terminate running pods but keep the job history
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({"spec": {"parallelism": 0}})),
    )
    .await?;
    info!(job = name, "suspended unschedulable trial job");
    Ok(())
}

pub(crate) enum JobFailure {
    Job { reason: String, message: String },
    Pod { reason: String, message: String },
    Unschedulable { message: String },
}

impl JobFailure {
    pub(crate) fn into_parts(self) -> (String, String) {
        match self {
            JobFailure::Job { reason, message } | JobFailure::Pod { reason, message } => {
                (reason, message)
            }
            JobFailure::Unschedulable { message } => {
                (REASON_UNSCHEDULABLE.to_string(), message)
            }
        }
    }
}

/// Job failure condition, failed pods and unschedulable pods, in that
/// order of specificity.
pub(crate) fn detect_failure(job: &Job, pods: &[Pod]) -> Option<JobFailure> {
    for pod in pods {
        let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_ref());
        if let Some(conditions) = conditions {
            for condition in conditions {
                if condition.type_ == "PodScheduled"
                    && condition.status == "False"
                    && condition.reason.as_deref() == Some(REASON_UNSCHEDULABLE)
                {
                    return Some(JobFailure::Unschedulable {
                        message: condition.message.clone().unwrap_or_default(),
                    });
                }
            }
        }
        if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed") {
            return Some(JobFailure::Pod {
                reason: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.reason.clone())
                    .unwrap_or_else(|| "PodFailed".to_string()),
                message: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.message.clone())
                    .unwrap_or_default(),
            });
        }
    }

    let conditions = job.status.as_ref().and_then(|s| s.conditions.as_ref())?;
    conditions
        .iter()
        .find(|c| c.type_ == "Failed" && c.status == "True")
        .map(|c| JobFailure::Job {
            reason: c.reason.clone().unwrap_or_else(|| "JobFailed".to_string()),
            message: c.message.clone().unwrap_or_default(),
        })
}

/// Start and completion times: existing values are kept; otherwise the
/// earliest pod start (offset applied) and the earliest observed container
/// termination, with job-level times as fallback.
pub(crate) fn derive_times(
    trial: &Trial,
    job: &Job,
    pods: &[Pod],
) -> (Option<Time>, Option<Time>) {
    let offset = chrono::Duration::seconds(trial.spec.start_time_offset.unwrap_or(0));

    let existing_start = trial.status.as_ref().and_then(|s| s.start_time.clone());
    let start_time = existing_start.or_else(|| {
        pods.iter()
            .filter_map(|pod| pod.status.as_ref().and_then(|s| s.start_time.as_ref()))
            .map(|t| t.0)
            .min()
            .or_else(|| job.status.as_ref().and_then(|s| s.start_time.as_ref()).map(|t| t.0))
            .map(|t| Time(t + offset))
    });

    let existing_completion = trial
        .status
        .as_ref()
        .and_then(|s| s.completion_time.clone());
    let completion_time = existing_completion.or_else(|| {
        pods.iter()
            .flat_map(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_ref())
                    .into_iter()
                    .flatten()
            })
            .filter_map(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .and_then(|t| t.finished_at.as_ref())
            })
            .map(|t| t.0)
            .min()
            .or_else(|| {
                job.status
                    .as_ref()
                    .and_then(|s| s.completion_time.as_ref())
                    .map(|t| t.0)
            })
            .map(Time)
    });

    (start_time, completion_time)
}
