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
    dynamic_api, fail_trial, get_experiment, is_conflict, now, update_trial_status, Error,
    Result, WriteOutcome, ERROR_REQUEUE,
};
use crate::metrics;
use crate::patchops::sort_config_first;
use crate::readiness::CONDITION_TYPE_APP_READY;
use crate::Context;
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use optimize_api::condition::{
    apply_condition, check_condition, ConditionStatus, TrialConditionType,
};
use optimize_api::trial::{
    PatchOperation, PatchType, ReadinessCheck, ReadinessGate, Trial,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const CONTROLLER: &str = "patch";

pub const DEFAULT_READINESS_DELAY_SECONDS: i32 = 1;
pub const DEFAULT_READINESS_PERIOD_SECONDS: i32 = 5;
pub const DEFAULT_READINESS_ATTEMPTS: i32 = 36;

const REASON_PATCH_PENDING: &str = "PatchPending";
const REASON_PATCHED: &str = "Patched";
const REASON_PATCH_FAILED: &str = "PatchFailed";

pub async fn run(ctx: Arc<Context>) {
    let trials: Api<Trial> = Api::all(ctx.client.clone());
    Controller::new(trials, watcher::Config::default().any_semantic())
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
    let default_status = optimize_api::trial::TrialStatus::default();
    let status = trial.status.as_ref().unwrap_or(&default_status);
    if check_condition(status, TrialConditionType::Failed, ConditionStatus::True) {
        return true;
    }
    if !trial.spec.setup_tasks.is_empty()
        && !check_condition(status, TrialConditionType::SetupCreated, ConditionStatus::True)
    {
        return true;
    }
    check_condition(status, TrialConditionType::Patched, ConditionStatus::True)
}

#[instrument(skip(trial, ctx), fields(trial = %trial.name_any()))]
async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action> {
    if ignore_trial(&trial) {
        return Ok(Action::await_change());
    }

    let mut trial = (*trial).clone();
    let probe_time = now();

    let patched_unknown = trial
        .status
        .as_ref()
        .map(|s| check_condition(s, TrialConditionType::Patched, ConditionStatus::Unknown))
        .unwrap_or(true);

    if patched_unknown {
        evaluate_patches(&ctx, &mut trial, probe_time.clone()).await?;
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::requeue(Duration::ZERO)),
        };
    }

    // Patched=False: apply one pending operation per pass
    let Some(index) = trial
        .status
        .as_ref()
        .and_then(|s| next_pending(&s.patch_operations))
    else {
        if let Some(status) = trial.status.as_mut() {
            apply_condition(
                status,
                TrialConditionType::Patched,
                ConditionStatus::True,
                REASON_PATCHED,
                "",
                probe_time,
            );
        }
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::await_change()),
        };
    };

    let op = trial
        .status
        .as_ref()
        .map(|s| s.patch_operations[index].clone())
        .unwrap_or_default();

    match apply_patch(&ctx, &op).await {
        Ok(()) => {
            if let Some(status) = trial.status.as_mut() {
                status.patch_operations[index].attempts_remaining = 0;
            }
            info!(
                target = %op.target_ref.name,
                kind = op.target_ref.kind.as_deref().unwrap_or_default(),
                "patch applied"
            );
        }
        Err(Error::Kube(err)) if is_conflict(&err) => {
            metrics::record_conflict(CONTROLLER);
            return Ok(Action::requeue(Duration::ZERO));
        }
        Err(err) => {
            let mut failed = false;
            if let Some(status) = trial.status.as_mut() {
                let op = &mut status.patch_operations[index];
                op.attempts_remaining -= 1;
                failed = op.attempts_remaining <= 0;
            }
            if failed {
                fail_trial(&mut trial, REASON_PATCH_FAILED, &err.to_string(), probe_time);
            } else {
                warn!(target = %op.target_ref.name, %err, "patch attempt failed, will retry");
            }
        }
    }

    match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
        WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
        WriteOutcome::Applied => Ok(Action::requeue(Duration::ZERO)),
    }
}

/// Renders every patch template, assembles the operation list and attaches
/// automatic readiness checks; leaves the trial in `Patched=False`.
async fn evaluate_patches(
    ctx: &Context,
    trial: &mut Trial,
    probe_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time,
) -> Result<()> {
    let Some(experiment) = get_experiment(&ctx.client, trial).await? else {
        fail_trial(
            trial,
            REASON_PATCH_FAILED,
            "experiment for this trial does not exist",
            probe_time,
        );
        return Ok(());
    };

    if let Err(err) = optimize_api::validation::check_assignments(trial, &experiment) {
        fail_trial(trial, REASON_PATCH_FAILED, &err.to_string(), probe_time);
        return Ok(());
    }

    let mut operations = Vec::new();
    for template in &experiment.spec.patches {
        let (target_ref, data) = match ctx.templates.render_patch(template, trial) {
            Ok(rendered) => rendered,
            Err(err) => {
                fail_trial(trial, REASON_PATCH_FAILED, &err.to_string(), probe_time);
                return Ok(());
            }
        };
        if let Some(op) = ctx
            .assembler
            .create_patch_operation(trial, template, &target_ref, &data)
        {
            operations.push(op);
        }
    }
    sort_config_first(&mut operations);

    let checks = readiness_checks_for(&operations, &trial.spec.readiness_gates);

    let status = trial.status.get_or_insert_default();
    status.patch_operations = operations;
    for check in checks {
        let already_known = status
            .readiness_checks
            .iter()
            .any(|existing| existing.target_ref.matches(&check.target_ref));
        if !already_known {
            status.readiness_checks.push(check);
        }
    }
    apply_condition(
        status,
        TrialConditionType::Patched,
        ConditionStatus::False,
        REASON_PATCH_PENDING,
        "",
        probe_time,
    );
    Ok(())
}

/// First operation that still has budget.
pub(crate) fn next_pending(operations: &[PatchOperation]) -> Option<usize> {
    operations.iter().position(|op| op.attempts_remaining > 0)
}

/// A readiness check for every waiting operation whose target no explicit
/// trial-level gate already names. Exact (name, kind, apiVersion) matching;
/// selector-only gates never match a patch target.
pub fn readiness_checks_for(
    operations: &[PatchOperation],
    gates: &[ReadinessGate],
) -> Vec<ReadinessCheck> {
    operations
        .iter()
        .filter(|op| op.wait)
        .filter(|op| {
            !gates.iter().any(|gate| {
                gate.target_ref
                    .as_ref()
                    .is_some_and(|target| target.matches(&op.target_ref))
            })
        })
        .map(|op| ReadinessCheck {
            target_ref: op.target_ref.clone(),
            selector: None,
            condition_types: vec![CONDITION_TYPE_APP_READY.to_string()],
            initial_delay_seconds: DEFAULT_READINESS_DELAY_SECONDS,
            period_seconds: DEFAULT_READINESS_PERIOD_SECONDS,
            attempts_remaining: DEFAULT_READINESS_ATTEMPTS,
            last_check_time: None,
        })
        .collect()
}

async fn apply_patch(ctx: &Context, op: &PatchOperation) -> Result<()> {
    let api = dynamic_api(&ctx.client, &op.target_ref)?;
    let params = PatchParams::default();
    match op.patch_type {
        PatchType::StrategicMerge => {
            api.patch(&op.target_ref.name, &params, &Patch::Strategic(&op.data))
                .await?;
        }
        PatchType::Merge => {
            api.patch(&op.target_ref.name, &params, &Patch::Merge(&op.data))
                .await?;
        }
        PatchType::Json => {
            let patch: json_patch::Patch = serde_json::from_value(op.data.clone())?;
            api.patch(&op.target_ref.name, &params, &Patch::Json::<()>(patch))
                .await?;
        }
    }
    Ok(())
}
