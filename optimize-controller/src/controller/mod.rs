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

pub mod experiment;
pub mod metric;
pub mod patch;
pub mod ready;
pub mod setup;
pub mod trial_job;

use crate::capture::CaptureError;
use crate::metrics;
use crate::template::TemplateError;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use optimize_api::condition::{apply_condition, ConditionStatus, TrialConditionType};
use optimize_api::experiment::Experiment;
use optimize_api::job::JobError;
use optimize_api::trial::{summarize_assignments, summarize_phase, TargetRef, Trial};
use optimize_api::validation::ValidationError;
use optimize_api::{LABEL_TRIAL, LABEL_TRIAL_ROLE};
use optimize_server_client::client::SuggestionApiError;
use optimize_server_client::conversion::DefinitionError;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Requeue used by `error_policy` on every surfaced error.
pub(crate) const ERROR_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Server(#[from] SuggestionApiError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("target reference is incomplete: {0}")]
    IncompleteTarget(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn now() -> Time {
    Time(Utc::now())
}

pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

pub(crate) fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists")
}

pub(crate) fn is_forbidden(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 403)
}

/// Outcome of an optimistic-concurrency write. Conflicts requeue without
/// backoff instead of erroring.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Applied,
    Conflict,
}

/// Full-object update carrying the resource version; used for metadata
/// changes (annotations, finalizers).
pub(crate) async fn update_trial(
    client: &Client,
    trial: &Trial,
    controller: &'static str,
) -> Result<WriteOutcome> {
    let Some(namespace) = trial.namespace() else {
        return Ok(WriteOutcome::Applied);
    };
    let api: Api<Trial> = Api::namespaced(client.clone(), &namespace);
    match api
        .replace(&trial.name_any(), &PostParams::default(), trial)
        .await
    {
        Ok(_) => Ok(WriteOutcome::Applied),
        Err(err) if is_conflict(&err) => {
            metrics::record_conflict(controller);
            Ok(WriteOutcome::Conflict)
        }
        Err(err) if is_not_found(&err) => Ok(WriteOutcome::Applied),
        Err(err) => Err(err.into()),
    }
}

/// Status update; refreshes the phase and assignment summaries before
/// writing.
pub(crate) async fn update_trial_status(
    client: &Client,
    trial: &mut Trial,
    controller: &'static str,
) -> Result<WriteOutcome> {
    if trial.status.is_some() {
        let assignments = summarize_assignments(trial);
        let phase = summarize_phase(trial).to_string();
        if let Some(status) = trial.status.as_mut() {
            status.assignments = assignments;
            status.phase = phase;
        }
    }

    let Some(namespace) = trial.namespace() else {
        return Ok(WriteOutcome::Applied);
    };
    let api: Api<Trial> = Api::namespaced(client.clone(), &namespace);
    let data = serde_json::to_vec(trial)?;
    match api
        .replace_status(&trial.name_any(), &PostParams::default(), data)
        .await
    {
        Ok(_) => Ok(WriteOutcome::Applied),
        Err(err) if is_conflict(&err) => {
            metrics::record_conflict(controller);
            Ok(WriteOutcome::Conflict)
        }
        Err(err) if is_not_found(&err) => Ok(WriteOutcome::Applied),
        Err(err) => Err(err.into()),
    }
}

/// Marks the trial failed with a stable reason code.
pub(crate) fn fail_trial(trial: &mut Trial, reason: &str, message: &str, probe_time: Time) {
    let status = trial.status.get_or_insert_default();
    apply_condition(
        status,
        TrialConditionType::Failed,
        ConditionStatus::True,
        reason,
        message,
        probe_time,
    );
    warn!(
        trial = %trial.name_any(),
        reason,
        message,
        "trial failed"
    );
}

/// Fetches the experiment a trial belongs to, `None` when the link or the
/// experiment itself is gone.
pub(crate) async fn get_experiment(
    client: &Client,
    trial: &Trial,
) -> Result<Option<Experiment>> {
    let Some(experiment_ref) = trial.experiment_ref() else {
        return Ok(None);
    };
    let Some(namespace) = experiment_ref.namespace else {
        return Ok(None);
    };
    let api: Api<Experiment> = Api::namespaced(client.clone(), &namespace);
    Ok(api.get_opt(&experiment_ref.name).await?)
}

/// Dynamically typed API for an arbitrary patch/readiness target.
pub(crate) fn dynamic_api(
    client: &Client,
    target_ref: &TargetRef,
) -> Result<Api<DynamicObject>> {
    let kind = target_ref
        .kind
        .clone()
        .ok_or_else(|| Error::IncompleteTarget(format!("{target_ref:?} has no kind")))?;
    let api_version = target_ref.api_version.clone().unwrap_or_else(|| "v1".to_string());
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version),
    };
    let resource = ApiResource::from_gvk(&GroupVersionKind {
        group,
        version,
        kind,
    });

    Ok(match &target_ref.namespace {
        Some(namespace) => Api::namespaced_with(client.clone(), namespace, &resource),
        None => Api::default_namespaced_with(client.clone(), &resource),
    })
}

/// Jobs labeled for the trial, optionally filtered to one role.
pub(crate) async fn list_trial_jobs(
    client: &Client,
    trial: &Trial,
    role: Option<&str>,
) -> Result<Vec<k8s_openapi::api::batch::v1::Job>> {
    let Some(namespace) = trial.namespace() else {
        return Ok(Vec::new());
    };
    let api: Api<k8s_openapi::api::batch::v1::Job> = Api::namespaced(client.clone(), &namespace);
    let mut selector = format!("{}={}", LABEL_TRIAL, trial.name_any());
    if let Some(role) = role {
        selector.push_str(&format!(",{}={}", LABEL_TRIAL_ROLE, role));
    }
    let jobs = api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;
    Ok(jobs)
}
