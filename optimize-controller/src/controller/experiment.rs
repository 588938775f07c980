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

use super::{is_conflict, Error, Result, ERROR_REQUEUE};
use crate::metrics;
use crate::Context;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use optimize_api::experiment::Experiment;
use optimize_api::trial::{ExperimentRef, Trial};
use optimize_api::{
    ANNOTATION_EXPERIMENT_URL, ANNOTATION_NEXT_TRIAL_URL, ANNOTATION_REPORT_TRIAL_URL,
    ANNOTATION_SUGGESTION_SOURCE, FINALIZER_SERVER, LABEL_EXPERIMENT,
    SUGGESTION_SOURCE_BASELINE,
};
use optimize_server_client::client::SuggestionApiError;
use optimize_server_client::conversion::{
    baseline_assignments, check_definition, to_cluster_assignments, to_server_experiment,
    to_server_values,
};
use optimize_server_client::model::TrialAssignments;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const CONTROLLER: &str = "experiment";

/// Trials created from suggestions are garbage collected two days after
/// they finish unless the template says otherwise.
pub const DEFAULT_TRIAL_TTL_SECONDS: i32 = 48 * 3600;

const RETRY_CLAMP_MIN: Duration = Duration::from_secs(5);
const RETRY_CLAMP_MAX: Duration = Duration::from_secs(120);

const PHASE_PAUSED: &str = "Paused";
const PHASE_RUNNING: &str = "Running";
const PHASE_FAILED: &str = "Failed";

pub async fn run(ctx: Arc<Context>) {
    let experiments: Api<Experiment> = Api::all(ctx.client.clone());
    let trials: Api<Trial> = Api::all(ctx.client.clone());
    Controller::new(experiments, watcher::Config::default().any_semantic())
        .owns(trials, watcher::Config::default())
        // let freshly created experiments settle before the first pass
        .with_config(kube::runtime::controller::Config::default().debounce(Duration::from_secs(1)))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                debug!(controller = CONTROLLER, %err, "reconcile error");
            }
        })
        .await;
}

fn error_policy(_experiment: Arc<Experiment>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(controller = CONTROLLER, %error, "reconcile failed");
    metrics::record_error(CONTROLLER);
    Action::requeue(ERROR_REQUEUE)
}

#[instrument(skip(experiment, ctx), fields(experiment = %experiment.name_any()))]
async fn reconcile(experiment: Arc<Experiment>, ctx: Arc<Context>) -> Result<Action> {
    let mut experiment = (*experiment).clone();

    // 1. registration
    if !experiment.is_deleted()
        && experiment.replicas() > 0
        && experiment.experiment_url().is_none()
    {
        return register(&ctx, &mut experiment).await;
    }

    // 2. trial inspection: report or abandon finished work
    let trials = list_experiment_trials(&ctx, &experiment).await?;
    let active = trials.iter().filter(|t| t.is_active()).count() as i32;

    for trial in &trials {
        let linked = trial.finalizers().iter().any(|f| f == FINALIZER_SERVER);
        if linked {
            if trial.is_finished() {
                report_trial(&ctx, trial).await?;
            } else if trial.is_abandoned() {
                abandon_trial(&ctx, trial).await?;
            }
        } else if trial.is_finished()
            && !trial.is_active()
            && ttl_expired(trial, chrono::Utc::now())
        {
            delete_trial(&ctx, trial).await?;
        }
    }

    update_status(&ctx, &experiment, active).await?;

    // 4. unlink a deleted experiment once nothing is left to report; the
    // server-side experiment is deliberately retained
    if experiment.is_deleted() {
        let still_linked = trials
            .iter()
            .any(|t| t.finalizers().iter().any(|f| f == FINALIZER_SERVER));
        if !still_linked {
            unlink(&ctx, &mut experiment).await?;
            return Ok(Action::await_change());
        }
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    // 3. next trial, under the per-experiment creation budget and rate limit
    if let Some(next_trial_url) = experiment.next_trial_url().cloned() {
        if active < experiment.replicas() {
            return next_trial(&ctx, &mut experiment, &next_trial_url, &trials).await;
        }
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

async fn register(ctx: &Context, experiment: &mut Experiment) -> Result<Action> {
    let name = experiment.name_any();
    let server_experiment = to_server_experiment(experiment);

    let created = match ctx.server.create_experiment(&name, &server_experiment).await {
        Ok(created) => {
            metrics::record_server_request("create-experiment", "ok");
            created
        }
        Err(err) => {
            metrics::record_server_request("create-experiment", "error");
            if is_permanent_create_failure(&err) {
                warn!(experiment = name, %err, "server rejected the experiment");
                experiment.spec.replicas = Some(0);
                write_experiment(ctx, experiment).await?;
                set_phase(ctx, experiment, PHASE_FAILED).await?;
                // ServerCreateFailed: no further server traffic for this experiment
                return Ok(Action::await_change());
            }
            return Err(err.into());
        }
    };

    // the server's echo must agree with the cluster definition
    if let Err(err) = check_definition(experiment, &created) {
        warn!(experiment = name, %err, "server definition does not match, stopping experiment");
        experiment.spec.replicas = Some(0);
        experiment
            .annotations_mut()
            .remove(ANNOTATION_NEXT_TRIAL_URL);
        write_experiment(ctx, experiment).await?;
        set_phase(ctx, experiment, PHASE_FAILED).await?;
        return Err(err.into());
    }

    if let Some(url) = &created.self_url {
        experiment
            .annotations_mut()
            .insert(ANNOTATION_EXPERIMENT_URL.to_string(), url.clone());
    }
    if let Some(url) = &created.next_trial {
        experiment
            .annotations_mut()
            .insert(ANNOTATION_NEXT_TRIAL_URL.to_string(), url.clone());
    }
    if let Some(parallelism) = created.parallelism {
        experiment.spec.replicas = Some(parallelism.max(0));
    }
    if !experiment.finalizers().iter().any(|f| f == FINALIZER_SERVER) {
        experiment
            .finalizers_mut()
            .push(FINALIZER_SERVER.to_string());
    }
    write_experiment(ctx, experiment).await?;
    info!(experiment = name, "experiment registered with the server");

    // best effort: seed the baseline suggestion
    if let (Some(trials_url), Some(baseline)) =
        (&created.trials, baseline_assignments(experiment))
    {
        match ctx.server.create_trial(trials_url, &baseline).await {
            Ok(()) => metrics::record_server_request("create-trial", "ok"),
            Err(err) => {
                metrics::record_server_request("create-trial", "error");
                debug!(experiment = name, %err, "baseline suggestion rejected");
            }
        }
    }

    Ok(Action::requeue(Duration::ZERO))
}

async fn next_trial(
    ctx: &Context,
    experiment: &mut Experiment,
    next_trial_url: &str,
    trials: &[Trial],
) -> Result<Action> {
    let key = experiment.uid().unwrap_or_else(|| experiment.name_any());
    let wait = ctx.trial_limiter.reserve(&key);
    if wait > Duration::ZERO {
        return Ok(Action::requeue(wait));
    }

    let Some(namespace) = pick_namespace(ctx, experiment, trials).await? else {
        debug!(experiment = %experiment.name_any(), "no namespace available for a new trial");
        return Ok(Action::requeue(Duration::from_secs(10)));
    };

    match ctx.server.next_trial(next_trial_url).await {
        Ok(suggestion) => {
            metrics::record_server_request("next-trial", "ok");
            let trial = new_trial(experiment, &suggestion, &namespace);
            let api: Api<Trial> = Api::namespaced(ctx.client.clone(), &namespace);
            api.create(&PostParams::default(), &trial).await?;
            metrics::TRIALS_CREATED_TOTAL.inc();
            info!(
                experiment = %experiment.name_any(),
                namespace,
                "created trial from server suggestion"
            );
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(SuggestionApiError::TrialUnavailable { retry_after }) => {
            metrics::record_server_request("next-trial", "unavailable");
            Ok(Action::requeue(clamp_retry(retry_after)))
        }
        Err(SuggestionApiError::ExperimentStopped) => {
            metrics::record_server_request("next-trial", "stopped");
            info!(experiment = %experiment.name_any(), "server stopped the experiment");
            experiment.spec.replicas = Some(0);
            experiment
                .annotations_mut()
                .remove(ANNOTATION_NEXT_TRIAL_URL);
            write_experiment(ctx, experiment).await?;
            Ok(Action::await_change())
        }
        Err(err) => {
            metrics::record_server_request("next-trial", "error");
            Err(err.into())
        }
    }
}

async fn report_trial(ctx: &Context, trial: &Trial) -> Result<()> {
    if let Some(url) = trial.annotations().get(ANNOTATION_REPORT_TRIAL_URL) {
        let values = to_server_values(trial);
        match ctx.server.report_trial(url, &values).await {
            Ok(()) => metrics::record_server_request("report-trial", "ok"),
            Err(err) => {
                metrics::record_server_request("report-trial", "error");
                return Err(err.into());
            }
        }
    }
    remove_server_finalizer(ctx, trial).await
}

async fn abandon_trial(ctx: &Context, trial: &Trial) -> Result<()> {
    if let Some(url) = trial.annotations().get(ANNOTATION_REPORT_TRIAL_URL) {
        match ctx.server.abandon_running_trial(url).await {
            Ok(()) => metrics::record_server_request("abandon-trial", "ok"),
            Err(err) => {
                // best effort by contract
                metrics::record_server_request("abandon-trial", "error");
                debug!(trial = %trial.name_any(), %err, "failed to abandon trial");
            }
        }
    }
    remove_server_finalizer(ctx, trial).await
}

async fn remove_server_finalizer(ctx: &Context, trial: &Trial) -> Result<()> {
    let mut trial = trial.clone();
    trial.finalizers_mut().retain(|f| f != FINALIZER_SERVER);
    let Some(namespace) = trial.namespace() else {
        return Ok(());
    };
    let api: Api<Trial> = Api::namespaced(ctx.client.clone(), &namespace);
    match api
        .replace(&trial.name_any(), &PostParams::default(), &trial)
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if is_conflict(&err) => {
            metrics::record_conflict(CONTROLLER);
            Ok(())
        }
        Err(err) if super::is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn unlink(ctx: &Context, experiment: &mut Experiment) -> Result<()> {
    ctx.trial_limiter
        .forget(&experiment.uid().unwrap_or_else(|| experiment.name_any()));
    experiment
        .annotations_mut()
        .remove(ANNOTATION_EXPERIMENT_URL);
    experiment
        .annotations_mut()
        .remove(ANNOTATION_NEXT_TRIAL_URL);
    experiment.spec.replicas = Some(0);
    experiment
        .finalizers_mut()
        .retain(|f| f != FINALIZER_SERVER);
    write_experiment(ctx, experiment).await
}

async fn write_experiment(ctx: &Context, experiment: &Experiment) -> Result<()> {
    let Some(namespace) = experiment.namespace() else {
        return Ok(());
    };
    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
    match api
        .replace(&experiment.name_any(), &PostParams::default(), experiment)
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if is_conflict(&err) => {
            metrics::record_conflict(CONTROLLER);
            Ok(())
        }
        Err(err) if super::is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn update_status(ctx: &Context, experiment: &Experiment, active: i32) -> Result<()> {
    let phase = if experiment.replicas() == 0 {
        PHASE_PAUSED
    } else {
        PHASE_RUNNING
    };
    let current = experiment.status.clone().unwrap_or_default();
    if current.phase == phase && current.active_trials == active {
        return Ok(());
    }

    let mut experiment = experiment.clone();
    experiment.status = Some(optimize_api::experiment::ExperimentStatus {
        phase: phase.to_string(),
        active_trials: active,
    });
    set_status(ctx, &experiment).await
}

async fn set_phase(ctx: &Context, experiment: &Experiment, phase: &str) -> Result<()> {
    let mut experiment = experiment.clone();
    let status = experiment.status.get_or_insert_default();
    status.phase = phase.to_string();
    set_status(ctx, &experiment).await
}

async fn set_status(ctx: &Context, experiment: &Experiment) -> Result<()> {
    let Some(namespace) = experiment.namespace() else {
        return Ok(());
    };
    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
    let data = serde_json::to_vec(experiment)?;
    match api
        .replace_status(&experiment.name_any(), &PostParams::default(), data)
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if is_conflict(&err) => {
            metrics::record_conflict(CONTROLLER);
            Ok(())
        }
        Err(err) if super::is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Trials belonging to this experiment, across namespaces.
async fn list_experiment_trials(
    ctx: &Context,
    experiment: &Experiment,
) -> Result<Vec<Trial>> {
    let api: Api<Trial> = Api::all(ctx.client.clone());
    let selector = format!("{}={}", LABEL_EXPERIMENT, experiment.name_any());
    let trials = api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    let name = experiment.name_any();
    let namespace = experiment.namespace();
    Ok(trials
        .into_iter()
        .filter(|trial| {
            trial
                .experiment_ref()
                .is_some_and(|r| r.name == name && r.namespace == namespace)
        })
        .collect())
}

/// The trial template's namespace wins; otherwise a namespace matched by
/// the selector that is not already hosting an active trial of this
/// experiment; otherwise the experiment's own namespace.
async fn pick_namespace(
    ctx: &Context,
    experiment: &Experiment,
    trials: &[Trial],
) -> Result<Option<String>> {
    if let Some(namespace) = experiment
        .spec
        .trial_template
        .as_ref()
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.namespace.clone())
    {
        return Ok(Some(namespace));
    }

    if let Some(selector) = &experiment.spec.trial_namespace_selector {
        let labels = selector
            .match_labels
            .as_ref()
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let api: Api<Namespace> = Api::all(ctx.client.clone());
        let namespaces = api.list(&ListParams::default().labels(&labels)).await?;
        let occupied: Vec<Option<String>> = trials
            .iter()
            .filter(|t| t.is_active())
            .map(|t| t.namespace())
            .collect();
        for namespace in namespaces.items {
            let name = namespace.metadata.name.clone().unwrap_or_default();
            if !occupied.contains(&Some(name.clone())) {
                return Ok(Some(name));
            }
        }
        return Ok(None);
    }

    Ok(experiment.namespace())
}

pub(crate) fn clamp_retry(retry_after: Duration) -> Duration {
    retry_after.clamp(RETRY_CLAMP_MIN, RETRY_CLAMP_MAX)
}

/// Client-side (4xx) rejections will not improve with retries.
fn is_permanent_create_failure(err: &SuggestionApiError) -> bool {
    matches!(
        err,
        SuggestionApiError::Unexpected { status, .. } if *status < 500
    ) || matches!(err, SuggestionApiError::InvalidUrl(_))
}

/// Whether a finished, torn-down trial has outlived its TTL. Failures use
/// the failure TTL when one is set.
pub(crate) fn ttl_expired(trial: &Trial, now: chrono::DateTime<chrono::Utc>) -> bool {
    let Some(status) = trial.status.as_ref() else {
        return false;
    };
    let failed = optimize_api::condition::check_condition(
        status,
        optimize_api::condition::TrialConditionType::Failed,
        optimize_api::condition::ConditionStatus::True,
    );
    let ttl = if failed {
        trial
            .spec
            .ttl_seconds_after_failure
            .or(trial.spec.ttl_seconds_after_finished)
    } else {
        trial.spec.ttl_seconds_after_finished
    };
    let Some(ttl) = ttl else {
        return false;
    };

    let finished_at = status
        .completion_time
        .as_ref()
        .map(|t| t.0)
        .or_else(|| {
            optimize_api::condition::get_condition(
                status,
                optimize_api::condition::TrialConditionType::Failed,
            )
            .map(|c| c.last_transition_time.0)
        });
    match finished_at {
        Some(finished_at) => now >= finished_at + chrono::Duration::seconds(ttl as i64),
        None => false,
    }
}

async fn delete_trial(ctx: &Context, trial: &Trial) -> Result<()> {
    let Some(namespace) = trial.namespace() else {
        return Ok(());
    };
    let api: Api<Trial> = Api::namespaced(ctx.client.clone(), &namespace);
    match api
        .delete(&trial.name_any(), &kube::api::DeleteParams::default())
        .await
    {
        Ok(_) => {
            info!(trial = %trial.name_any(), "deleted expired trial");
            Ok(())
        }
        Err(err) if super::is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Builds the cluster trial for a server suggestion: template applied,
/// assignments filled in, server linkage carried in annotations and the
/// finalizer, ownership when namespaces line up.
pub(crate) fn new_trial(
    experiment: &Experiment,
    suggestion: &TrialAssignments,
    namespace: &str,
) -> Trial {
    let template = experiment.spec.trial_template.clone().unwrap_or_default();

    let mut spec = template.spec.unwrap_or_default();
    spec.assignments = to_cluster_assignments(suggestion);
    spec.experiment_ref = Some(ExperimentRef {
        name: experiment.name_any(),
        namespace: experiment.namespace(),
    });
    if spec.ttl_seconds_after_finished.is_none() {
        spec.ttl_seconds_after_finished = Some(DEFAULT_TRIAL_TTL_SECONDS);
    }

    let mut trial = Trial::new("", spec);
    trial.metadata.name = None;
    trial.metadata.generate_name = Some(format!("{}-", experiment.name_any()));
    trial.metadata.namespace = Some(namespace.to_string());

    let labels = trial.labels_mut();
    if let Some(template_labels) = template.metadata.as_ref().and_then(|m| m.labels.clone()) {
        labels.extend(template_labels);
    }
    labels.insert(LABEL_EXPERIMENT.to_string(), experiment.name_any());

    let annotations = trial.annotations_mut();
    if let Some(template_annotations) = template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
    {
        annotations.extend(template_annotations);
    }
    if let Some(report_url) = &suggestion.report_trial {
        annotations.insert(ANNOTATION_REPORT_TRIAL_URL.to_string(), report_url.clone());
    }
    let baseline = suggestion
        .labels
        .iter()
        .any(|l| l.name == "baseline" && l.value == "true");
    annotations.insert(
        ANNOTATION_SUGGESTION_SOURCE.to_string(),
        if baseline {
            SUGGESTION_SOURCE_BASELINE.to_string()
        } else {
            "server".to_string()
        },
    );

    trial.finalizers_mut().push(FINALIZER_SERVER.to_string());

    if experiment.namespace().as_deref() == Some(namespace) {
        trial.metadata.owner_references = Some(vec![OwnerReference {
            api_version: optimize_api::API_VERSION.to_string(),
            kind: Experiment::kind(&()).to_string(),
            name: experiment.name_any(),
            uid: experiment.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
    }

    trial
}
