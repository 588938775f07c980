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

use crate::model::{
    ServerAssignment, ServerBounds, ServerExperiment, ServerMetric, ServerOptimizationSetting,
    ServerParameter, ServerValue, TrialAssignments, TrialValues,
};
use optimize_api::condition::{check_condition, get_condition, ConditionStatus, TrialConditionType};
use optimize_api::experiment::Experiment;
use optimize_api::trial::{Assignment, Trial};
use thiserror::Error;

/// Cluster and server definitions drifting apart is fatal for the
/// experiment; these errors carry enough context to say which field moved.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parameter {0} exists only on one side")]
    ParameterMismatch(String),
    #[error("parameter {name} bounds differ: cluster [{cluster_min}, {cluster_max}], server [{server_min}, {server_max}]")]
    BoundsMismatch {
        name: String,
        cluster_min: i64,
        cluster_max: i64,
        server_min: i64,
        server_max: i64,
    },
    #[error("metric {0} exists only on one side")]
    MetricMismatch(String),
    #[error("metric {0} direction differs between cluster and server")]
    MinimizeMismatch(String),
}

/// Renders the cluster experiment in the server's form. Field-preserving for
/// parameter names/bounds and metric names/directions.
pub fn to_server_experiment(experiment: &Experiment) -> ServerExperiment {
    ServerExperiment {
        parameters: experiment
            .spec
            .parameters
            .iter()
            .map(|p| ServerParameter {
                name: p.name.clone(),
                bounds: ServerBounds { min: p.min, max: p.max },
                baseline: p.baseline,
            })
            .collect(),
        metrics: experiment
            .spec
            .metrics
            .iter()
            .map(|m| ServerMetric {
                name: m.name.clone(),
                minimize: m.minimize,
                optimize: m.optimize,
            })
            .collect(),
        optimization: experiment
            .spec
            .optimization
            .iter()
            .map(|s| ServerOptimizationSetting {
                name: s.name.clone(),
                value: s.value.clone(),
            })
            .collect(),
        budget: experiment.spec.budget,
        parallelism: experiment.spec.replicas,
        self_url: None,
        trials: None,
        next_trial: None,
    }
}

/// Cross-checks the server's echo of the experiment against the cluster
/// definition. Names, bounds and metric directions must agree exactly.
pub fn check_definition(
    cluster: &Experiment,
    server: &ServerExperiment,
) -> Result<(), DefinitionError> {
    if cluster.spec.parameters.len() != server.parameters.len() {
        let cluster_names: Vec<_> = cluster.spec.parameters.iter().map(|p| &p.name).collect();
        let name = server
            .parameters
            .iter()
            .map(|p| &p.name)
            .find(|name| !cluster_names.contains(name))
            .or_else(|| cluster_names.first().copied())
            .cloned()
            .unwrap_or_default();
        return Err(DefinitionError::ParameterMismatch(name));
    }

    for parameter in &cluster.spec.parameters {
        let server_parameter = server
            .parameters
            .iter()
            .find(|p| p.name == parameter.name)
            .ok_or_else(|| DefinitionError::ParameterMismatch(parameter.name.clone()))?;
        if server_parameter.bounds.min != parameter.min
            || server_parameter.bounds.max != parameter.max
        {
            return Err(DefinitionError::BoundsMismatch {
                name: parameter.name.clone(),
                cluster_min: parameter.min,
                cluster_max: parameter.max,
                server_min: server_parameter.bounds.min,
                server_max: server_parameter.bounds.max,
            });
        }
    }

    if cluster.spec.metrics.len() != server.metrics.len() {
        let cluster_names: Vec<_> = cluster.spec.metrics.iter().map(|m| &m.name).collect();
        let name = server
            .metrics
            .iter()
            .map(|m| &m.name)
            .find(|name| !cluster_names.contains(name))
            .or_else(|| cluster_names.first().copied())
            .cloned()
            .unwrap_or_default();
        return Err(DefinitionError::MetricMismatch(name));
    }

    for metric in &cluster.spec.metrics {
        let server_metric = server
            .metrics
            .iter()
            .find(|m| m.name == metric.name)
            .ok_or_else(|| DefinitionError::MetricMismatch(metric.name.clone()))?;
        if server_metric.minimize != metric.minimize {
            return Err(DefinitionError::MinimizeMismatch(metric.name.clone()));
        }
    }

    Ok(())
}

/// The baseline suggestion: one assignment per parameter from the declared
/// baselines. `None` when any parameter is missing one.
pub fn baseline_assignments(experiment: &Experiment) -> Option<TrialAssignments> {
    let assignments = experiment
        .spec
        .parameters
        .iter()
        .map(|p| {
            p.baseline.map(|value| ServerAssignment {
                parameter_name: p.name.clone(),
                value,
            })
        })
        .collect::<Option<Vec<_>>>()?;

    if assignments.is_empty() {
        return None;
    }

    Some(TrialAssignments {
        assignments,
        report_trial: None,
        labels: vec![ServerOptimizationSetting {
            name: "baseline".to_string(),
            value: "true".to_string(),
        }],
    })
}

/// A server template into a cluster experiment spec. Queries and patches
/// are not part of the server form; they stay empty for the operator of the
/// generated experiment to fill in.
pub fn to_cluster_experiment(template: &ServerExperiment) -> optimize_api::experiment::ExperimentSpec {
    optimize_api::experiment::ExperimentSpec {
        parameters: template
            .parameters
            .iter()
            .map(|p| optimize_api::experiment::Parameter {
                name: p.name.clone(),
                min: p.bounds.min,
                max: p.bounds.max,
                baseline: p.baseline,
            })
            .collect(),
        metrics: template
            .metrics
            .iter()
            .map(|m| optimize_api::experiment::Metric {
                name: m.name.clone(),
                minimize: m.minimize,
                optimize: m.optimize,
                ..optimize_api::experiment::Metric::default()
            })
            .collect(),
        optimization: template
            .optimization
            .iter()
            .map(|s| optimize_api::experiment::OptimizationSetting {
                name: s.name.clone(),
                value: s.value.clone(),
            })
            .collect(),
        budget: template.budget,
        replicas: template.parallelism,
        ..optimize_api::experiment::ExperimentSpec::default()
    }
}

/// Server suggestion into cluster assignments.
pub fn to_cluster_assignments(suggestion: &TrialAssignments) -> Vec<Assignment> {
    suggestion
        .assignments
        .iter()
        .map(|a| Assignment {
            name: a.parameter_name.clone(),
            value: a.value,
        })
        .collect()
}

/// Renders a finished trial's outcome for reporting. A failed trial reports
/// `failed=true` with the failure reason instead of values.
pub fn to_server_values(trial: &Trial) -> TrialValues {
    let Some(status) = trial.status.as_ref() else {
        return TrialValues {
            failed: true,
            ..TrialValues::default()
        };
    };

    let failed = check_condition(status, TrialConditionType::Failed, ConditionStatus::True);
    let values = if failed {
        Vec::new()
    } else {
        status
            .values
            .iter()
            .filter_map(|v| {
                v.value.parse::<f64>().ok().map(|value| ServerValue {
                    metric_name: v.name.clone(),
                    value,
                    error: v.error.as_deref().and_then(|e| e.parse().ok()),
                })
            })
            .collect()
    };

    TrialValues {
        values,
        failed,
        failure_reason: if failed {
            get_condition(status, TrialConditionType::Failed)
                .and_then(|c| c.reason.clone())
        } else {
            None
        },
        start_time: status.start_time.as_ref().map(|t| t.0),
        completion_time: status.completion_time.as_ref().map(|t| t.0),
    }
}
