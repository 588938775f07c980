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

use crate::experiment::{Experiment, Metric};
use crate::trial::Trial;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing assignment for parameter {0}")]
    MissingAssignment(String),
    #[error("assignment {name}={value} is out of range [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("assignment {0} does not match any experiment parameter")]
    UnknownAssignment(String),
    #[error("duplicate assignment for parameter {0}")]
    DuplicateAssignment(String),
    #[error("metric {name} value {value} violates bound {bound}")]
    MetricBound {
        name: String,
        value: f64,
        bound: String,
    },
    #[error("metric {0} produced an unparseable value: {1}")]
    UnparseableValue(String, String),
}

/// Checks that the trial carries exactly one in-range assignment per
/// experiment parameter.
pub fn check_assignments(trial: &Trial, experiment: &Experiment) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for assignment in &trial.spec.assignments {
        if !seen.insert(assignment.name.as_str()) {
            return Err(ValidationError::DuplicateAssignment(assignment.name.clone()));
        }
        let parameter = experiment
            .spec
            .parameters
            .iter()
            .find(|p| p.name == assignment.name)
            .ok_or_else(|| ValidationError::UnknownAssignment(assignment.name.clone()))?;
        if assignment.value < parameter.min || assignment.value > parameter.max {
            return Err(ValidationError::OutOfRange {
                name: assignment.name.clone(),
                value: assignment.value,
                min: parameter.min,
                max: parameter.max,
            });
        }
    }
    for parameter in &experiment.spec.parameters {
        if !seen.contains(parameter.name.as_str()) {
            return Err(ValidationError::MissingAssignment(parameter.name.clone()));
        }
    }
    Ok(())
}

/// Enforces the metric's min/max bounds on an observed value.
pub fn check_metric_bounds(metric: &Metric, value: &str) -> Result<(), ValidationError> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| ValidationError::UnparseableValue(metric.name.clone(), value.to_string()))?;

    if let Some(min) = metric.min {
        if parsed < min {
            return Err(ValidationError::MetricBound {
                name: metric.name.clone(),
                value: parsed,
                bound: format!("min={min}"),
            });
        }
    }
    if let Some(max) = metric.max {
        if parsed > max {
            return Err(ValidationError::MetricBound {
                name: metric.name.clone(),
                value: parsed,
                bound: format!("max={max}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::experiment::{ExperimentSpec, Parameter};
    use crate::trial::{Assignment, TrialSpec};

    fn experiment() -> Experiment {
        Experiment::new(
            "exp-1",
            ExperimentSpec {
                parameters: vec![
                    Parameter {
                        name: "nginx_cpu".into(),
                        min: 25,
                        max: 2000,
                        baseline: Some(50),
                    },
                    Parameter {
                        name: "replicas".into(),
                        min: 1,
                        max: 5,
                        baseline: Some(1),
                    },
                ],
                ..ExperimentSpec::default()
            },
        )
    }

    fn trial(assignments: Vec<(&str, i64)>) -> Trial {
        Trial::new(
            "t-1",
            TrialSpec {
                assignments: assignments
                    .into_iter()
                    .map(|(name, value)| Assignment {
                        name: name.into(),
                        value,
                    })
                    .collect(),
                ..TrialSpec::default()
            },
        )
    }

    #[test]
    fn complete_in_range_assignments_pass() {
        let result = check_assignments(&trial(vec![("nginx_cpu", 200), ("replicas", 2)]), &experiment());
        assert!(result.is_ok());
    }

    #[test]
    fn missing_assignment_is_rejected() {
        let result = check_assignments(&trial(vec![("nginx_cpu", 200)]), &experiment());
        assert!(matches!(result, Err(ValidationError::MissingAssignment(name)) if name == "replicas"));
    }

    #[test]
    fn out_of_range_assignment_is_rejected() {
        let result = check_assignments(&trial(vec![("nginx_cpu", 5000), ("replicas", 2)]), &experiment());
        assert!(matches!(result, Err(ValidationError::OutOfRange { .. })));
    }

    #[test]
    fn unknown_assignment_is_rejected() {
        let result = check_assignments(
            &trial(vec![("nginx_cpu", 200), ("replicas", 2), ("bogus", 1)]),
            &experiment(),
        );
        assert!(matches!(result, Err(ValidationError::UnknownAssignment(name)) if name == "bogus"));
    }

    #[test]
    fn value_above_max_violates_bounds() {
        let metric = Metric {
            name: "cost".into(),
            max: Some(100.0),
            ..Metric::default()
        };
        assert!(check_metric_bounds(&metric, "99.5").is_ok());
        assert!(matches!(
            check_metric_bounds(&metric, "150"),
            Err(ValidationError::MetricBound { .. })
        ));
    }

    #[test]
    fn unparseable_value_is_its_own_error() {
        let metric = Metric {
            name: "cost".into(),
            ..Metric::default()
        };
        assert!(matches!(
            check_metric_bounds(&metric, "NaN%"),
            Err(ValidationError::UnparseableValue(_, _))
        ));
    }
}
