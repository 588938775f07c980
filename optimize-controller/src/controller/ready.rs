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
    dynamic_api, fail_trial, now, update_trial_status, Error, Result, WriteOutcome,
    ERROR_REQUEUE,
};
use crate::metrics;
use crate::readiness::{check_conditions, ReadinessError};
use crate::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ListParams;
use kube::core::DynamicObject;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use optimize_api::condition::{
    apply_condition, check_condition, get_condition, ConditionStatus, TrialConditionType,
};
use optimize_api::trial::{ReadinessCheck, Trial};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const CONTROLLER: &str = "ready";

const REASON_WAITING: &str = "Waiting";
const REASON_READY: &str = "Ready";
const REASON_READINESS_THRESHOLD: &str = "ReadinessFailureThreshold";
const REASON_READINESS_CHECK_FAILED: &str = "ReadinessCheckFailed";

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
    let Some(status) = trial.status.as_ref() else {
        return true;
    };
    if check_condition(status, TrialConditionType::Failed, ConditionStatus::True) {
        return true;
    }
    if !check_condition(status, TrialConditionType::Patched, ConditionStatus::True) {
        return true;
    }
    check_condition(status, TrialConditionType::Ready, ConditionStatus::True)
}

/// Baseline for initial delays: when the trial was patched, or created if
/// the transition is somehow missing.
fn epoch(trial: &Trial) -> DateTime<Utc> {
    trial
        .status
        .as_ref()
        .and_then(|s| get_condition(s, TrialConditionType::Patched))
        .map(|c| c.last_transition_time.0)
        .or(trial.creation_timestamp().map(|t| t.0))
        .unwrap_or_else(Utc::now)
}

/// `None` when the check is due, otherwise the wait bounded by the period.
pub(crate) fn due_in(
    check: &ReadinessCheck,
    epoch: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let next = match &check.last_check_time {
        Some(last) => last.0 + chrono::Duration::seconds(check.period_seconds as i64),
        None => epoch + chrono::Duration::seconds(check.initial_delay_seconds as i64),
    };
    if now >= next {
        return None;
    }
    let wait = (next - now)
        .to_std()
        .unwrap_or_default()
        .min(Duration::from_secs(check.period_seconds.max(1) as u64));
    Some(wait)
}

/// Period at least a second, at least one attempt.
pub(crate) fn apply_check_defaults(check: &mut ReadinessCheck) {
    if check.period_seconds < 1 {
        check.period_seconds = 1;
    }
    if check.attempts_remaining < 1 {
        check.attempts_remaining = 1;
    }
}

#[instrument(skip(trial, ctx), fields(trial = %trial.name_any()))]
async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action> {
    if ignore_trial(&trial) {
        return Ok(Action::await_change());
    }

    let mut trial = (*trial).clone();
    let probe_time = now();

    let ready_unknown = trial
        .status
        .as_ref()
        .map(|s| check_condition(s, TrialConditionType::Ready, ConditionStatus::Unknown))
        .unwrap_or(true);

    if ready_unknown {
        seed_readiness_checks(&mut trial, probe_time);
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::requeue(Duration::ZERO)),
        };
    }

    let trial_epoch = epoch(&trial);
    let check_count = trial
        .status
        .as_ref()
        .map(|s| s.readiness_checks.len())
        .unwrap_or(0);

    let mut requeue_after: Option<Duration> = None;
    let mut failure: Option<(String, String)> = None;

    for index in 0..check_count {
        let check = trial
            .status
            .as_ref()
            .map(|s| s.readiness_checks[index].clone())
            .unwrap_or_default();
        if check.attempts_remaining <= 0 || check.target_ref.kind.is_none() {
            continue;
        }

        if let Some(wait) = due_in(&check, trial_epoch, probe_time.0) {
            requeue_after = Some(requeue_after.map_or(wait, |current| current.max(wait)));
            continue;
        }

        let outcome = evaluate_check(&ctx, &check).await?;
        if let Some(status) = trial.status.as_mut() {
            let check = &mut status.readiness_checks[index];
            check.last_check_time = Some(probe_time.clone());
            match &outcome {
                CheckOutcome::Passed => {
                    check.attempts_remaining = 0;
                }
                CheckOutcome::Unready(message) => {
                    check.attempts_remaining -= 1;
                    if check.attempts_remaining <= 0 {
                        failure =
                            Some((REASON_READINESS_THRESHOLD.to_string(), message.clone()));
                    } else {
                        let period = Duration::from_secs(check.period_seconds.max(1) as u64);
                        requeue_after =
                            Some(requeue_after.map_or(period, |current| current.max(period)));
                    }
                }
                CheckOutcome::Invalid(message) => {
                    check.attempts_remaining = 0;
                    failure =
                        Some((REASON_READINESS_CHECK_FAILED.to_string(), message.clone()));
                }
            }
        }
        if failure.is_some() {
            break;
        }
    }

    if let Some((reason, message)) = failure {
        fail_trial(&mut trial, &reason, &message, probe_time);
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::await_change()),
        };
    }

    let all_settled = trial
        .status
        .as_ref()
        .map(|s| {
            s.readiness_checks
                .iter()
                .all(|c| c.attempts_remaining <= 0 || c.target_ref.kind.is_none())
        })
        .unwrap_or(true);

    if all_settled {
        if let Some(status) = trial.status.as_mut() {
            apply_condition(
                status,
                TrialConditionType::Ready,
                ConditionStatus::True,
                REASON_READY,
                "",
                probe_time,
            );
        }
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::await_change()),
        };
    }

    match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
        WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
        WriteOutcome::Applied => Ok(Action::requeue(
            requeue_after.unwrap_or(Duration::from_secs(1)),
        )),
    }
}

/// Merges the trial-level readiness gates into the checks the patch
/// reconciler already produced and flips `Ready` to `False`.
fn seed_readiness_checks(trial: &mut Trial, probe_time: Time) {
    let gates = trial.spec.readiness_gates.clone();
    let status = trial.status.get_or_insert_default();

    for gate in gates {
        // selector-only gates are never deduplicated against each other
        let already_known = gate.target_ref.as_ref().is_some_and(|target| {
            status
                .readiness_checks
                .iter()
                .any(|existing| existing.target_ref.matches(target))
        });
        if already_known {
            continue;
        }
        status.readiness_checks.push(ReadinessCheck {
            target_ref: gate.target_ref.clone().unwrap_or_default(),
            selector: gate.selector.clone(),
            condition_types: gate.condition_types.clone(),
            initial_delay_seconds: gate.initial_delay_seconds.unwrap_or(0),
            period_seconds: gate.period_seconds.unwrap_or(10),
            attempts_remaining: gate.failure_threshold.unwrap_or(3),
            last_check_time: None,
        });
    }

    for check in status.readiness_checks.iter_mut() {
        apply_check_defaults(check);
    }

    apply_condition(
        status,
        TrialConditionType::Ready,
        ConditionStatus::False,
        REASON_WAITING,
        "",
        probe_time,
    );
}

enum CheckOutcome {
    Passed,
    Unready(String),
    Invalid(String),
}

/// Fetches the check's targets directly (uncached) and evaluates the
/// condition types, stopping at the first unready target.
async fn evaluate_check(ctx: &Context, check: &ReadinessCheck) -> Result<CheckOutcome> {
    let api = dynamic_api(&ctx.client, &check.target_ref)?;

    let targets: Vec<DynamicObject> = if !check.target_ref.name.is_empty() {
        match api.get_opt(&check.target_ref.name).await? {
            Some(object) => vec![object],
            None => Vec::new(),
        }
    } else if let Some(selector) = &check.selector {
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
        api.list(&ListParams::default().labels(&labels)).await?.items
    } else {
        Vec::new()
    };

    if targets.is_empty() {
        return Ok(CheckOutcome::Unready(format!(
            "no targets matched readiness check for {} {}",
            check.target_ref.kind.as_deref().unwrap_or_default(),
            check.target_ref.name
        )));
    }

    for target in &targets {
        let object = serde_json::to_value(target)?;
        match check_conditions(&object, &check.condition_types) {
            Ok((_, true)) => {}
            Ok((message, false)) => return Ok(CheckOutcome::Unready(message)),
            Err(ReadinessError::InvalidTarget { kind, message }) => {
                return Ok(CheckOutcome::Invalid(format!(
                    "readiness check against {kind} failed: {message}"
                )));
            }
        }
    }

    Ok(CheckOutcome::Passed)
}
