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
    fail_trial, get_experiment, now, update_trial_status, Error, Result, WriteOutcome,
    ERROR_REQUEUE,
};
use crate::capture::{CaptureError, CaptureTarget};
use crate::metrics;
use crate::Context;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use optimize_api::condition::{
    apply_condition, check_condition, ConditionStatus, TrialConditionType,
};
use optimize_api::experiment::{Metric, MetricType};
use optimize_api::trial::{Trial, Value};
use optimize_api::validation::check_metric_bounds;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use url::Url;

const CONTROLLER: &str = "metric";

const DEFAULT_VALUE_ATTEMPTS: i32 = 3;
const DEFAULT_PROMETHEUS_PORT: i32 = 9090;

const REASON_CAPTURING: &str = "Capturing";
const REASON_CAPTURED: &str = "Captured";
const REASON_METRIC_FAILED: &str = "MetricFailed";
const REASON_METRIC_BOUND: &str = "MetricBound";
const REASON_TRIAL_COMPLETED: &str = "TrialCompleted";

/// Legacy query placeholder resolved through a Service lookup.
const HOSTNAME_PLACEHOLDER: &str = "$hostname";

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
    if trial.is_deleted() {
        return true;
    }
    let Some(status) = trial.status.as_ref() else {
        return true;
    };
    if check_condition(status, TrialConditionType::Failed, ConditionStatus::True) {
        return true;
    }
    if status.start_time.is_none() || status.completion_time.is_none() {
        return true;
    }
    let has_pending = status.values.iter().any(|v| v.attempts_remaining > 0);
    let observed = check_condition(status, TrialConditionType::Observed, ConditionStatus::True);
    !(has_pending || !observed)
}

#[instrument(skip(trial, ctx), fields(trial = %trial.name_any()))]
async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action> {
    if ignore_trial(&trial) {
        return Ok(Action::await_change());
    }

    let mut trial = (*trial).clone();
    let probe_time = now();

    // one-time evaluation; manually seeded values inhibit it
    let needs_evaluation = trial
        .status
        .as_ref()
        .map(|s| s.values.is_empty())
        .unwrap_or(true);
    if needs_evaluation {
        let Some(experiment) = get_experiment(&ctx.client, &trial).await? else {
            fail_trial(
                &mut trial,
                REASON_METRIC_FAILED,
                "experiment for this trial does not exist",
                probe_time,
            );
            return finish_write(&ctx, &mut trial).await;
        };

        let status = trial.status.get_or_insert_default();
        status.values = experiment
            .spec
            .metrics
            .iter()
            .map(|metric| Value {
                name: metric.name.clone(),
                attempts_remaining: DEFAULT_VALUE_ATTEMPTS,
                ..Value::default()
            })
            .collect();
        apply_condition(
            status,
            TrialConditionType::Observed,
            ConditionStatus::Unknown,
            REASON_CAPTURING,
            "",
            probe_time,
        );
        return match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
            WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
            WriteOutcome::Applied => Ok(Action::requeue(Duration::ZERO)),
        };
    }

    let pending = trial
        .status
        .as_ref()
        .and_then(|s| s.values.iter().position(|v| v.attempts_remaining > 0));

    let Some(index) = pending else {
        return finalize_observation(&ctx, &mut trial, probe_time).await;
    };

    let value_name = trial
        .status
        .as_ref()
        .map(|s| s.values[index].name.clone())
        .unwrap_or_default();

    let Some(experiment) = get_experiment(&ctx.client, &trial).await? else {
        fail_trial(
            &mut trial,
            REASON_METRIC_FAILED,
            "experiment for this trial does not exist",
            probe_time,
        );
        return finish_write(&ctx, &mut trial).await;
    };
    let Some(metric) = experiment
        .spec
        .metrics
        .iter()
        .find(|m| m.name == value_name)
    else {
        fail_trial(
            &mut trial,
            REASON_METRIC_FAILED,
            &format!("metric {value_name} is not defined by the experiment"),
            probe_time,
        );
        return finish_write(&ctx, &mut trial).await;
    };

    // work on a defaulted copy, never the stored definition
    let mut metric = metric.clone();
    let target = resolve_target(&ctx, &trial, &mut metric).await?;

    let outcome = ctx.capture.capture(&trial, &metric, &target).await;
    let disposition = trial
        .status
        .as_mut()
        .map(|status| record_outcome(status, index, &outcome, probe_time.clone()))
        .unwrap_or(CaptureDisposition::Recorded);

    match disposition {
        CaptureDisposition::Recorded => finish_write(&ctx, &mut trial).await,
        CaptureDisposition::Retry(retry_after) => {
            match update_trial_status(&ctx.client, &mut trial, CONTROLLER).await? {
                WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
                WriteOutcome::Applied => Ok(Action::requeue(retry_after)),
            }
        }
        CaptureDisposition::Exhausted(message) => {
            // structured address/query context is logged only here
            error!(metric = value_name, message, "metric capture attempts exhausted");
            fail_trial(&mut trial, REASON_METRIC_FAILED, &message, probe_time);
            finish_write(&ctx, &mut trial).await
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum CaptureDisposition {
    Recorded,
    Retry(Duration),
    Exhausted(String),
}

/// Applies one capture outcome to the value list. Transient failures never
/// spend attempts; permanent ones decrement, and exhaustion fails the
/// trial. `Observed` drops to `False` on every attempt.
pub(crate) fn record_outcome(
    status: &mut optimize_api::trial::TrialStatus,
    index: usize,
    outcome: &std::result::Result<crate::capture::CapturedValue, CaptureError>,
    probe_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time,
) -> CaptureDisposition {
    apply_condition(
        status,
        TrialConditionType::Observed,
        ConditionStatus::False,
        REASON_CAPTURING,
        "",
        probe_time,
    );

    match outcome {
        Ok(captured) => {
            let value = &mut status.values[index];
            value.value = format_value(captured.value);
            value.error = captured.error.map(format_value);
            value.attempts_remaining = 0;
            CaptureDisposition::Recorded
        }
        Err(CaptureError::Retryable { retry_after }) => CaptureDisposition::Retry(*retry_after),
        Err(err @ CaptureError::Permanent { .. }) => {
            let value = &mut status.values[index];
            value.attempts_remaining -= 1;
            if value.attempts_remaining <= 0 {
                CaptureDisposition::Exhausted(err.to_string())
            } else {
                CaptureDisposition::Recorded
            }
        }
    }
}

async fn finish_write(ctx: &Context, trial: &mut Trial) -> Result<Action> {
    match update_trial_status(&ctx.client, trial, CONTROLLER).await? {
        WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
        WriteOutcome::Applied => Ok(Action::requeue(Duration::ZERO)),
    }
}

/// All values resolved: enforce bounds (baselines exempt) and flip
/// `Observed`.
async fn finalize_observation(
    ctx: &Context,
    trial: &mut Trial,
    probe_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time,
) -> Result<Action> {
    if !trial.is_baseline() {
        if let Some(experiment) = get_experiment(&ctx.client, trial).await? {
            let values = trial
                .status
                .as_ref()
                .map(|s| s.values.clone())
                .unwrap_or_default();
            for value in &values {
                let Some(metric) = experiment
                    .spec
                    .metrics
                    .iter()
                    .find(|m| m.name == value.name)
                else {
                    continue;
                };
                if let Err(err) = check_metric_bounds(metric, &value.value) {
                    fail_trial(trial, REASON_METRIC_BOUND, &err.to_string(), probe_time);
                    return finish_write(ctx, trial).await;
                }
            }
        }
    }

    if let Some(status) = trial.status.as_mut() {
        apply_condition(
            status,
            TrialConditionType::Observed,
            ConditionStatus::True,
            REASON_CAPTURED,
            "",
            probe_time.clone(),
        );
        // observation was the last stage of the pipeline
        apply_condition(
            status,
            TrialConditionType::Complete,
            ConditionStatus::True,
            REASON_TRIAL_COMPLETED,
            "",
            probe_time,
        );
    }
    match update_trial_status(&ctx.client, trial, CONTROLLER).await? {
        WriteOutcome::Conflict => Ok(Action::requeue(Duration::ZERO)),
        WriteOutcome::Applied => Ok(Action::await_change()),
    }
}

/// Applies the metric defaults and resolves the capture endpoints.
async fn resolve_target(
    ctx: &Context,
    trial: &Trial,
    metric: &mut Metric,
) -> Result<CaptureTarget> {
    let namespace = trial.namespace().unwrap_or_else(|| "default".to_string());

    if metric.query.contains(HOSTNAME_PLACEHOLDER) {
        let hostname = resolve_service_hostname(ctx, &namespace, metric).await?;
        metric.query = metric.query.replace(HOSTNAME_PLACEHOLDER, &hostname);
        if let Some(error_query) = metric.error_query.as_mut() {
            *error_query = error_query.replace(HOSTNAME_PLACEHOLDER, &hostname);
        }
    }

    match metric.metric_type {
        MetricType::Local => Ok(CaptureTarget::default()),
        MetricType::Prometheus => {
            let url = match service_for_metric(ctx, &namespace, metric).await? {
                Some(service) => service_url(&service, metric)?,
                None => default_prometheus_url(&namespace)?,
            };
            Ok(CaptureTarget { urls: vec![url] })
        }
        MetricType::JsonPath => {
            let services = jsonpath_services(ctx, &namespace, metric).await?;
            let urls = services
                .iter()
                .map(|service| service_url(service, metric))
                .collect::<Result<Vec<_>>>()?;
            Ok(CaptureTarget { urls })
        }
    }
}

async fn service_for_metric(
    ctx: &Context,
    namespace: &str,
    metric: &Metric,
) -> Result<Option<Service>> {
    if let Some(target) = &metric.target {
        if target.kind.as_deref() == Some("Service") && !target.name.is_empty() {
            let ns = target.namespace.as_deref().unwrap_or(namespace);
            let api: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
            return Ok(api.get_opt(&target.name).await?);
        }
    }
    if let Some(selector) = &metric.selector {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
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
        let services = api.list(&ListParams::default().labels(&labels)).await?;
        return Ok(services.items.into_iter().next());
    }
    Ok(None)
}

async fn jsonpath_services(
    ctx: &Context,
    namespace: &str,
    metric: &Metric,
) -> Result<Vec<Service>> {
    match service_for_metric(ctx, namespace, metric).await? {
        Some(service) => Ok(vec![service]),
        None => Ok(Vec::new()),
    }
}

async fn resolve_service_hostname(
    ctx: &Context,
    namespace: &str,
    metric: &Metric,
) -> Result<String> {
    match service_for_metric(ctx, namespace, metric).await? {
        Some(service) => Ok(service_hostname(&service, namespace)),
        None => Ok(format!("prometheus.{namespace}.svc")),
    }
}

/// Cluster DNS name; headless (`None` cluster IP) services resolve through
/// DNS as well, so the name form is used unconditionally.
fn service_hostname(service: &Service, fallback_namespace: &str) -> String {
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let namespace = service
        .metadata
        .namespace
        .as_deref()
        .unwrap_or(fallback_namespace);
    format!("{name}.{namespace}.svc")
}

fn service_url(service: &Service, metric: &Metric) -> Result<Url> {
    let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
    let host = service_hostname(service, namespace);
    let port = metric
        .port
        .or_else(|| {
            service
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|ports| ports.first())
                .map(|p| p.port)
        })
        .unwrap_or(DEFAULT_PROMETHEUS_PORT);
    let path = metric.path.as_deref().unwrap_or("/");
    Url::parse(&format!("http://{host}:{port}{path}"))
        .map_err(|err| Error::IncompleteTarget(err.to_string()))
}

fn default_prometheus_url(namespace: &str) -> Result<Url> {
    Url::parse(&format!(
        "http://prometheus.{namespace}.svc:{DEFAULT_PROMETHEUS_PORT}/"
    ))
    .map_err(|err| Error::IncompleteTarget(err.to_string()))
}

/// Shortest decimal rendering that round-trips back to the same float.
fn format_value(value: f64) -> String {
    format!("{value}")
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use optimize_api::trial::{TrialSpec, TrialStatus};

    #[test]
    fn format_value_is_shortest_round_trip() {
        assert_eq!(format_value(0.123), "0.123");
        assert_eq!(format_value(42.0), "42");
        let rendered = format_value(0.1 + 0.2);
        assert_eq!(rendered.parse::<f64>().unwrap(), 0.1 + 0.2);
    }

    #[test]
    fn default_prometheus_url_derives_from_the_namespace() {
        let url = default_prometheus_url("engineering").unwrap();
        assert_eq!(url.as_str(), "http://prometheus.engineering.svc:9090/");
    }

    #[test]
    fn service_url_prefers_the_metric_port() {
        let service: Service = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "app-metrics", "namespace": "engineering"},
            "spec": {"ports": [{"port": 8080}]}
        }))
        .unwrap();

        let metric = Metric {
            port: Some(9999),
            path: Some("/stats".into()),
            ..Metric::default()
        };
        let url = service_url(&service, &metric).unwrap();
        assert_eq!(url.as_str(), "http://app-metrics.engineering.svc:9999/stats");

        let metric = Metric::default();
        let url = service_url(&service, &metric).unwrap();
        assert_eq!(url.as_str(), "http://app-metrics.engineering.svc:8080/");
    }

    #[test]
    fn headless_services_get_dns_names_too() {
        let service: Service = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "db", "namespace": "engineering"},
            "spec": {"clusterIP": "None"}
        }))
        .unwrap();
        assert_eq!(service_hostname(&service, "other"), "db.engineering.svc");
    }

    fn trial_with_values(values: Vec<Value>, observed: Option<ConditionStatus>) -> Trial {
        let mut trial = Trial::new("t-1", TrialSpec::default());
        let mut status = TrialStatus {
            start_time: Some(now()),
            completion_time: Some(now()),
            values,
            ..TrialStatus::default()
        };
        if let Some(observed) = observed {
            apply_condition(
                &mut status,
                TrialConditionType::Observed,
                observed,
                "",
                "",
                now(),
            );
        }
        trial.status = Some(status);
        trial
    }

    #[test]
    fn unstarted_trials_are_ignored() {
        let mut trial = Trial::new("t-1", TrialSpec::default());
        trial.status = Some(TrialStatus::default());
        assert!(ignore_trial(&trial));
    }

    #[test]
    fn finished_trials_with_pending_values_are_processed() {
        let trial = trial_with_values(
            vec![Value {
                name: "p95".into(),
                attempts_remaining: 3,
                ..Value::default()
            }],
            Some(ConditionStatus::False),
        );
        assert!(!ignore_trial(&trial));
    }

    #[test]
    fn transient_capture_failures_do_not_spend_attempts() {
        use crate::capture::{CaptureError, CapturedValue};

        let mut status = TrialStatus {
            values: vec![Value {
                name: "p95".into(),
                attempts_remaining: 3,
                ..Value::default()
            }],
            ..TrialStatus::default()
        };

        for _ in 0..2 {
            let disposition = record_outcome(
                &mut status,
                0,
                &Err(CaptureError::Retryable {
                    retry_after: Duration::from_secs(10),
                }),
                now(),
            );
            assert_eq!(
                disposition,
                CaptureDisposition::Retry(Duration::from_secs(10))
            );
        }
        assert_eq!(status.values[0].attempts_remaining, 3);
        assert!(check_condition(
            &status,
            TrialConditionType::Observed,
            ConditionStatus::False
        ));

        let disposition = record_outcome(
            &mut status,
            0,
            &Ok(CapturedValue {
                value: 0.123,
                error: None,
            }),
            now(),
        );
        assert_eq!(disposition, CaptureDisposition::Recorded);
        assert_eq!(status.values[0].value, "0.123");
        assert_eq!(status.values[0].attempts_remaining, 0);
    }

    #[test]
    fn permanent_failures_spend_attempts_then_exhaust() {
        use crate::capture::CaptureError;

        let mut status = TrialStatus {
            values: vec![Value {
                name: "p95".into(),
                attempts_remaining: 2,
                ..Value::default()
            }],
            ..TrialStatus::default()
        };
        let failure = || {
            Err(CaptureError::Permanent {
                address: "http://prometheus.engineering.svc:9090/".into(),
                query: "scalar(up)".into(),
                message: "no such metric".into(),
            })
        };

        assert_eq!(
            record_outcome(&mut status, 0, &failure(), now()),
            CaptureDisposition::Recorded
        );
        assert_eq!(status.values[0].attempts_remaining, 1);

        match record_outcome(&mut status, 0, &failure(), now()) {
            CaptureDisposition::Exhausted(message) => {
                assert!(message.contains("scalar(up)"));
                assert!(message.contains("prometheus.engineering"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn observed_trials_without_pending_values_are_ignored() {
        let trial = trial_with_values(
            vec![Value {
                name: "p95".into(),
                value: "0.123".into(),
                attempts_remaining: 0,
                ..Value::default()
            }],
            Some(ConditionStatus::True),
        );
        assert!(ignore_trial(&trial));
    }
}
