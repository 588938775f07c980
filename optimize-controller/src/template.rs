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

use kube::ResourceExt;
use optimize_api::experiment::PatchTemplate;
use optimize_api::trial::{TargetRef, Trial};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template rendering failed: {0}")]
    Render(#[from] minijinja::Error),
    #[error("rendered patch is not valid YAML or JSON: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("patch template has no target reference")]
    MissingTarget,
}

/// Renders patch templates and metric queries against a trial.
pub trait TemplateEngine: Send + Sync {
    /// Renders a patch template. The returned target is the template's
    /// explicit reference, completed with the trial namespace when absent.
    fn render_patch(
        &self,
        template: &PatchTemplate,
        trial: &Trial,
    ) -> Result<(TargetRef, JsonValue), TemplateError>;

    /// Renders a metric query (or error query).
    fn render_query(&self, query: &str, trial: &Trial) -> Result<String, TemplateError>;
}

/// Jinja-flavored rendering. Assignments are exposed both as a map and as
/// individual variables, so `{{ nginx_cpu }}` and `{{ assignments.nginx_cpu }}`
/// are equivalent.
pub struct JinjaTemplateEngine {
    env: minijinja::Environment<'static>,
}

impl Default for JinjaTemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaTemplateEngine {
    pub fn new() -> Self {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        Self { env }
    }

    fn trial_context(trial: &Trial) -> JsonValue {
        let mut assignments = serde_json::Map::new();
        for assignment in &trial.spec.assignments {
            assignments.insert(assignment.name.clone(), JsonValue::from(assignment.value));
        }

        let status = trial.status.as_ref();
        let start_time = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);
        let completion_time = status.and_then(|s| s.completion_time.as_ref()).map(|t| t.0);
        let duration_seconds = match (start_time, completion_time) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        };

        let mut context = serde_json::Map::new();
        // individual variables first so the reserved names below win
        for (name, value) in &assignments {
            context.insert(name.clone(), value.clone());
        }
        context.insert("assignments".into(), JsonValue::Object(assignments));
        context.insert("trial".into(), serde_json::json!({
            "name": trial.name_any(),
            "namespace": trial.namespace(),
        }));
        context.insert(
            "start_time".into(),
            serde_json::to_value(start_time).unwrap_or(JsonValue::Null),
        );
        context.insert(
            "completion_time".into(),
            serde_json::to_value(completion_time).unwrap_or(JsonValue::Null),
        );
        context.insert(
            "duration_seconds".into(),
            serde_json::to_value(duration_seconds).unwrap_or(JsonValue::Null),
        );
        JsonValue::Object(context)
    }
}

impl TemplateEngine for JinjaTemplateEngine {
    fn render_patch(
        &self,
        template: &PatchTemplate,
        trial: &Trial,
    ) -> Result<(TargetRef, JsonValue), TemplateError> {
        let mut target = template
            .target_ref
            .clone()
            .ok_or(TemplateError::MissingTarget)?;
        if target.namespace.is_none() {
            target.namespace = trial.namespace();
        }

        let rendered = self
            .env
            .render_str(&template.patch, Self::trial_context(trial))?;
        if rendered.trim().is_empty() {
            return Ok((target, JsonValue::Null));
        }

        // YAML is a superset of JSON, so one parse covers both forms
        let data: JsonValue = serde_yaml::from_str(&rendered)?;
        Ok((target, data))
    }

    fn render_query(&self, query: &str, trial: &Trial) -> Result<String, TemplateError> {
        Ok(self.env.render_str(query, Self::trial_context(trial))?)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use optimize_api::trial::{Assignment, TrialSpec, TrialStatus};

    fn trial() -> Trial {
        let mut trial = Trial::new(
            "t-1",
            TrialSpec {
                assignments: vec![Assignment {
                    name: "nginx_cpu".into(),
                    value: 200,
                }],
                ..TrialSpec::default()
            },
        );
        trial.metadata.namespace = Some("engineering".into());
        trial
    }

    #[test]
    fn patch_template_renders_assignments() {
        let engine = JinjaTemplateEngine::new();
        let template = PatchTemplate {
            target_ref: Some(TargetRef {
                api_version: Some("apps/v1".into()),
                kind: Some("Deployment".into()),
                name: "nginx".into(),
                namespace: None,
            }),
            patch: r#"{"spec":{"template":{"spec":{"containers":[{"name":"nginx","resources":{"requests":{"cpu":"{{ nginx_cpu }}m"}}}]}}}}"#.into(),
            ..PatchTemplate::default()
        };

        let (target, data) = engine.render_patch(&template, &trial()).unwrap();
        assert_eq!(target.namespace.as_deref(), Some("engineering"));
        assert_eq!(
            data["spec"]["template"]["spec"]["containers"][0]["resources"]["requests"]["cpu"],
            "200m"
        );
    }

    #[test]
    fn yaml_patches_parse_too() {
        let engine = JinjaTemplateEngine::new();
        let template = PatchTemplate {
            target_ref: Some(TargetRef {
                kind: Some("ConfigMap".into()),
                name: "tuning".into(),
                ..TargetRef::default()
            }),
            patch: "data:\n  workers: \"{{ assignments.nginx_cpu }}\"\n".into(),
            ..PatchTemplate::default()
        };

        let (_, data) = engine.render_patch(&template, &trial()).unwrap();
        assert_eq!(data["data"]["workers"], "200");
    }

    #[test]
    fn empty_rendering_becomes_null() {
        let engine = JinjaTemplateEngine::new();
        let template = PatchTemplate {
            target_ref: Some(TargetRef {
                kind: Some("ConfigMap".into()),
                name: "tuning".into(),
                ..TargetRef::default()
            }),
            patch: "{% if false %}unreachable{% endif %}".into(),
            ..PatchTemplate::default()
        };

        let (_, data) = engine.render_patch(&template, &trial()).unwrap();
        assert!(data.is_null());
    }

    #[test]
    fn unknown_variables_are_rendering_errors() {
        let engine = JinjaTemplateEngine::new();
        let template = PatchTemplate {
            target_ref: Some(TargetRef {
                kind: Some("ConfigMap".into()),
                name: "tuning".into(),
                ..TargetRef::default()
            }),
            patch: "{{ not_a_parameter }}".into(),
            ..PatchTemplate::default()
        };

        assert!(matches!(
            engine.render_patch(&template, &trial()),
            Err(TemplateError::Render(_))
        ));
    }

    #[test]
    fn missing_target_is_rejected() {
        let engine = JinjaTemplateEngine::new();
        let template = PatchTemplate {
            patch: "{}".into(),
            ..PatchTemplate::default()
        };
        assert!(matches!(
            engine.render_patch(&template, &trial()),
            Err(TemplateError::MissingTarget)
        ));
    }

    #[test]
    fn queries_see_the_trial_runtime() {
        let engine = JinjaTemplateEngine::new();
        let mut t = trial();
        t.status = Some(TrialStatus {
            start_time: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now() - chrono::Duration::seconds(300),
            )),
            completion_time: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            )),
            ..TrialStatus::default()
        });

        let query = engine
            .render_query("scalar(avg_over_time(cpu[{{ duration_seconds }}s]))", &t)
            .unwrap();
        assert_eq!(query, "scalar(avg_over_time(cpu[300s]))");
    }
}
