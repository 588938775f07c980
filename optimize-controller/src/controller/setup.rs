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
    is_already_exists, is_forbidden, list_trial_jobs, now, update_trial, update_trial_status,
    Error, Result, WriteOutcome, ERROR_REQUEUE,
};
use crate::metrics;
use crate::setup_jobs::{
    condition_status, container_failure, new_setup_job, trial_condition_type, SetupMode,
};
use crate::Context;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use optimize_api::condition::{
    apply_condition, check_condition, get_condition, ConditionStatus, TrialConditionType,
};
use optimize_api::trial::Trial;
use optimize_api::{FINALIZER_SETUP, INITIALIZER_SETUP, TRIAL_ROLE_SETUP};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const CONTROLLER: &str = "setup";

const REASON_SETUP_JOB_CREATED: &str = "SetupJobCreated";
const REASON_SETUP_JOB_COMPLETE: &str = "SetupJobComplete";
const REASON_SETUP_JOB_FAILED: &str = "SetupJobFailed";
const REASON_MISSING_JOB: &str = "MissingJob";
const REASON_FORBIDDEN: &str = "Forbidden";
const REASON_NO_TASKS: &str = "NoTasksForMode";

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

#[instrument(skip(trial, ctx), fields(trial = %trial.name_any()))]
async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action> {
    if trial.spec.setup_tasks.is_empty() {
        return Ok(Action::await_change());
    }

    let mut trial = (*trial).clone();
    let probe_time = now();
    let mut metadata_changed = false;
    let mut status_changed = false;

    let jobs = list_trial_jobs(&ctx.client, &trial, Some(TRIAL_ROLE_SETUP)).await?;

    if jobs.is_empty() {
        if trial.is_deleted() {
            // the namespace is probably going away with everything in it
            let status = trial.status.get_or_insert_default();
            if check_condition(
                status,
                TrialConditionType::SetupDeleted,
                ConditionStatus::False,
            ) {
                apply_condition(
                    status,
                    TrialConditionType::SetupDeleted,
                    ConditionStatus::True,
                    REASON_MISSING_JOB,
                    "setup teardown job disappeared",
                    probe_time.clone(),
                );
                status_changed = true;
            }
        } else if let Some(status) = trial.status.as_mut() {
            for condition_type in [
                TrialConditionType::SetupCreated,
                TrialConditionType::SetupDeleted,
            ] {
                let present = get_condition(status, condition_type)
                    .map(|c| c.status != ConditionStatus::Unknown)
                    .unwrap_or(false);
                if present {
                    apply_condition(
                        status,
                        condition_type,
                        ConditionStatus::Unknown,
                        REASON_MISSING_JOB,
                        "setup job disappeared",
                        probe_time.clone(),
                    );
                    status_changed = true;
                }
            }
        }
    }

    for job in &jobs {
        let Some(condition_type) = trial_condition_type(job) else {
            continue;
        };
        let job_status = condition_status(job);
        let reason = match job_status {
            ConditionStatus::True => REASON_SETUP_JOB_COMPLETE,
            _ => REASON_SETUP_JOB_CREATED,
        };
        let status = trial.status.get_or_insert_default();
        apply_condition(
            status,
            condition_type,
            job_status,
            reason,
            "",
            probe_time.clone(),
        );
        status_changed = true;

        let pods = setup_job_pods(&ctx, job).await?;
        if let Some((container, exit_code, message)) = container_failure(&pods) {
            if !trial.is_finished() {
                super::fail_trial(
                    &mut trial,
                    REASON_SETUP_JOB_FAILED,
                    &format!("setup container {container} exited with code {exit_code}: {message}"),
                    probe_time.clone(),
                );
                status_changed = true;
            }
        }
    }

    // pre-trial job
    let setup_created_unknown = trial
        .status
        .as_ref()
        .map(|s| {
            check_condition(
                s,
                TrialConditionType::SetupCreated,
                ConditionStatus::Unknown,
            )
        })
        .unwrap_or(true);
    if setup_created_unknown && !trial.is_deleted() {
        let added_initializer = trial.add_initializer(INITIALIZER_SETUP);
        let added_finalizer = add_finalizer(&mut trial);
        if added_initializer || added_finalizer {
            // persist the gate before creating anything
            return match update_trial(&ctx.client, &trial, CONTROLLER).await? {
                WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
                WriteOutcome::Applied => Ok(Action::requeue(Duration::ZERO)),
            };
        }

        match new_setup_job(&trial, SetupMode::Create) {
            Some(job) => {
                try_create_setup_job(&ctx, &trial, job).await?;
                let status = trial.status.get_or_insert_default();
                apply_condition(
                    status,
                    TrialConditionType::SetupCreated,
                    ConditionStatus::False,
                    REASON_SETUP_JOB_CREATED,
                    "",
                    probe_time.clone(),
                );
            }
            None => {
                let status = trial.status.get_or_insert_default();
                apply_condition(
                    status,
                    TrialConditionType::SetupCreated,
                    ConditionStatus::True,
                    REASON_NO_TASKS,
                    "every setup task skips creation",
                    probe_time.clone(),
                );
            }
        }
        status_changed = true;
    }

    // teardown job
    let setup_deleted_unknown = trial
        .status
        .as_ref()
        .map(|s| {
            check_condition(
                s,
                TrialConditionType::SetupDeleted,
                ConditionStatus::Unknown,
            )
        })
        .unwrap_or(true);
    if setup_deleted_unknown && (trial.is_finished() || trial.is_deleted()) {
        match new_setup_job(&trial, SetupMode::Delete) {
            Some(job) => match try_create_setup_job(&ctx, &trial, job).await {
                Ok(()) => {
                    let status = trial.status.get_or_insert_default();
                    apply_condition(
                        status,
                        TrialConditionType::SetupDeleted,
                        ConditionStatus::False,
                        REASON_SETUP_JOB_CREATED,
                        "",
                        probe_time.clone(),
                    );
                }
                Err(Error::Kube(err))
                    if is_forbidden(&err) && ctx.config.setup.allow_forbidden_delete =>
                {
                    info!(trial = %trial.name_any(), "teardown job creation forbidden, treating as done");
                    let status = trial.status.get_or_insert_default();
                    apply_condition(
                        status,
                        TrialConditionType::SetupDeleted,
                        ConditionStatus::True,
                        REASON_FORBIDDEN,
                        "",
                        probe_time.clone(),
                    );
                }
                Err(err) => return Err(err),
            },
            None => {
                let status = trial.status.get_or_insert_default();
                apply_condition(
                    status,
                    TrialConditionType::SetupDeleted,
                    ConditionStatus::True,
                    REASON_NO_TASKS,
                    "every setup task skips teardown",
                    probe_time.clone(),
                );
            }
        }
        status_changed = true;
    }

    // finish phase: release the gates the setup pipeline holds
    let status_snapshot = trial.status.clone().unwrap_or_default();
    if check_condition(
        &status_snapshot,
        TrialConditionType::SetupCreated,
        ConditionStatus::True,
    ) && trial.has_initializer(INITIALIZER_SETUP)
    {
        trial.remove_initializer(INITIALIZER_SETUP);
        metadata_changed = true;
    }
    if check_condition(
        &status_snapshot,
        TrialConditionType::SetupDeleted,
        ConditionStatus::True,
    ) && has_finalizer(&trial)
    {
        remove_finalizer(&mut trial);
        metadata_changed = true;
    }
    // both jobs stuck before running on a deleted trial: assume the setup
    // configuration never worked and let the trial go
    if trial.is_deleted()
        && check_condition(
            &status_snapshot,
            TrialConditionType::SetupCreated,
            ConditionStatus::False,
        )
        && check_condition(
            &status_snapshot,
            TrialConditionType::SetupDeleted,
            ConditionStatus::False,
        )
        && has_finalizer(&trial)
    {
        remove_finalizer(&mut trial);
        metadata_changed = true;
    }

    if status_changed {
        if let WriteOutcome::Conflict =
            update_trial_status(&ctx.client, &mut trial, CONTROLLER).await?
        {
            return Ok(Action::requeue(Duration::ZERO));
        }
    }
    if metadata_changed {
        if let WriteOutcome::Conflict = update_trial(&ctx.client, &trial, CONTROLLER).await? {
            return Ok(Action::requeue(Duration::ZERO));
        }
    }

    // keep polling while a setup job is still running
    let any_running = jobs.iter().any(|job| {
        condition_status(job) != ConditionStatus::True
    });
    if any_running {
        Ok(Action::requeue(Duration::from_secs(5)))
    } else {
        Ok(Action::await_change())
    }
}

fn add_finalizer(trial: &mut Trial) -> bool {
    if has_finalizer(trial) {
        return false;
    }
    trial
        .finalizers_mut()
        .push(FINALIZER_SETUP.to_string());
    true
}

fn has_finalizer(trial: &Trial) -> bool {
    trial.finalizers().iter().any(|f| f == FINALIZER_SETUP)
}

fn remove_finalizer(trial: &mut Trial) {
    trial.finalizers_mut().retain(|f| f != FINALIZER_SETUP);
}

async fn try_create_setup_job(ctx: &Context, trial: &Trial, mut job: Job) -> Result<()> {
    job.metadata.owner_references = Some(vec![OwnerReference {
        api_version: optimize_api::API_VERSION.to_string(),
        kind: Trial::kind(&()).to_string(),
        name: trial.name_any(),
        uid: trial.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);

    let Some(namespace) = job.metadata.namespace.clone() else {
        return Ok(());
    };
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    match api.create(&PostParams::default(), &job).await {
        Ok(_) => {
            info!(job = ?job.metadata.name, "setup job created");
            Ok(())
        }
        Err(err) if is_already_exists(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn setup_job_pods(ctx: &Context, job: &Job) -> Result<Vec<Pod>> {
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
