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
    ActivityFeed, ActivityItem, Scenario, ServerExperiment, TrialAssignments, TrialValues,
};
use async_trait::async_trait;
use http::StatusCode;
use optimize_common::config::RetryConfig;
use optimize_common::retries::with_retries;
use optimize_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuggestionApiConfig {
    /// Base endpoint of the suggestion service.
    pub endpoint: Url,
    /// Bearer token; empty disables authentication.
    pub access_token: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retries: RetryConfig,
}

impl Default for SuggestionApiConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse("http://localhost:8000/v1/").expect("hardcoded URL is valid"),
            access_token: "".to_string(),
            timeout: Duration::from_secs(10),
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for SuggestionApiConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "endpoint: {}", self.endpoint);
        let _ = writeln!(&mut result, "access token: ****");
        let _ = writeln!(&mut result, "timeout: {:?}", self.timeout);
        result
    }
}

/// Error taxonomy of the suggestion service. Everything the server does not
/// name explicitly collapses into `Unexpected`.
#[derive(Debug, thiserror::Error)]
pub enum SuggestionApiError {
    #[error("experiment not found")]
    ExperimentNotFound,
    #[error("trial not found")]
    TrialNotFound,
    #[error("trial already reported")]
    TrialAlreadyReported,
    #[error("no trial available, retry after {retry_after:?}")]
    TrialUnavailable { retry_after: Duration },
    #[error("experiment stopped")]
    ExperimentStopped,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected server response: {status}: {message}")]
    Unexpected { status: u16, message: String },
}

impl SuggestionApiError {
    pub fn is_retriable(error: &SuggestionApiError) -> bool {
        match error {
            SuggestionApiError::Transport(_) => true,
            SuggestionApiError::Unexpected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl SafeDisplay for SuggestionApiError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Error code carried in the response body; the `type` field wins over the
/// HTTP status.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default, rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Maps an error response to the taxonomy. `not_found` supplies the variant
/// for a bare 404, which differs per operation.
pub(crate) fn error_from_response(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &[u8],
    not_found: fn() -> SuggestionApiError,
) -> SuggestionApiError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    match parsed.error_type.as_str() {
        "experiment-not-found" => SuggestionApiError::ExperimentNotFound,
        "trial-not-found" => SuggestionApiError::TrialNotFound,
        "trial-already-reported" => SuggestionApiError::TrialAlreadyReported,
        "trial-unavailable" => SuggestionApiError::TrialUnavailable {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        },
        "experiment-stopped" => SuggestionApiError::ExperimentStopped,
        _ => match status {
            StatusCode::GONE => SuggestionApiError::ExperimentStopped,
            StatusCode::SERVICE_UNAVAILABLE => SuggestionApiError::TrialUnavailable {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            StatusCode::NOT_FOUND => not_found(),
            _ => SuggestionApiError::Unexpected {
                status: status.as_u16(),
                message: if parsed.message.is_empty() {
                    String::from_utf8_lossy(body).into_owned()
                } else {
                    parsed.message
                },
            },
        },
    }
}

/// Remote suggestion service. Trials are fetched from and reported to URLs
/// the server itself hands out; only experiment registration and the
/// activity feed are addressed relative to the configured endpoint.
#[async_trait]
pub trait SuggestionApi: Send + Sync {
    async fn create_experiment(
        &self,
        name: &str,
        experiment: &ServerExperiment,
    ) -> Result<ServerExperiment, SuggestionApiError>;

    /// Idempotent; a missing experiment is not an error.
    async fn delete_experiment(&self, experiment_url: &str) -> Result<(), SuggestionApiError>;

    async fn next_trial(
        &self,
        next_trial_url: &str,
    ) -> Result<TrialAssignments, SuggestionApiError>;

    /// Posts a suggestion (the baseline) onto the experiment's trial queue.
    async fn create_trial(
        &self,
        trials_url: &str,
        assignments: &TrialAssignments,
    ) -> Result<(), SuggestionApiError>;

    /// An already reported trial is not an error.
    async fn report_trial(
        &self,
        report_trial_url: &str,
        values: &TrialValues,
    ) -> Result<(), SuggestionApiError>;

    /// Best effort; a missing trial is not an error.
    async fn abandon_running_trial(&self, report_trial_url: &str)
        -> Result<(), SuggestionApiError>;

    /// One poll of the activity feed.
    async fn subscribe_activity(&self) -> Result<Vec<ActivityItem>, SuggestionApiError>;

    async fn get_scenario(&self, scenario_url: &str) -> Result<Scenario, SuggestionApiError>;

    async fn get_template(&self, template_url: &str)
        -> Result<ServerExperiment, SuggestionApiError>;

    async fn put_template(
        &self,
        template_url: &str,
        template: &ServerExperiment,
    ) -> Result<(), SuggestionApiError>;

    async fn delete_activity(&self, item_url: &str) -> Result<(), SuggestionApiError>;

    /// Marks the activity item failed instead of consuming it.
    async fn fail_activity(
        &self,
        item_url: &str,
        failure_reason: &str,
    ) -> Result<(), SuggestionApiError>;
}

#[derive(Clone)]
pub struct SuggestionApiDefault {
    client: reqwest::Client,
    endpoint: Url,
    access_token: String,
    retries: RetryConfig,
}

impl SuggestionApiDefault {
    pub fn new(config: &SuggestionApiConfig) -> Result<Self, SuggestionApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            access_token: config.access_token.clone(),
            retries: config.retries.clone(),
        })
    }

    fn url(&self, raw: &str) -> Result<Url, SuggestionApiError> {
        Url::parse(raw).map_err(|err| SuggestionApiError::InvalidUrl(format!("{raw}: {err}")))
    }

    fn experiments_url(&self, name: &str) -> Result<Url, SuggestionApiError> {
        self.endpoint
            .join(&format!("experiments/{name}"))
            .map_err(|err| SuggestionApiError::InvalidUrl(err.to_string()))
    }

    fn activity_url(&self) -> Result<Url, SuggestionApiError> {
        self.endpoint
            .join("activity")
            .map_err(|err| SuggestionApiError::InvalidUrl(err.to_string()))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        if self.access_token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.access_token)
        }
    }

    async fn handle_error(
        response: reqwest::Response,
        not_found: fn() -> SuggestionApiError,
    ) -> SuggestionApiError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.bytes().await.unwrap_or_default();
        error_from_response(status, retry_after, &body, not_found)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<serde_json::Value>,
        not_found: fn() -> SuggestionApiError,
    ) -> Result<T, SuggestionApiError> {
        let mut request = self.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::handle_error(response, not_found).await)
        }
    }

    async fn send_unit(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<serde_json::Value>,
        not_found: fn() -> SuggestionApiError,
    ) -> Result<(), SuggestionApiError> {
        let mut request = self.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::handle_error(response, not_found).await)
        }
    }
}

#[async_trait]
impl SuggestionApi for SuggestionApiDefault {
    async fn create_experiment(
        &self,
        name: &str,
        experiment: &ServerExperiment,
    ) -> Result<ServerExperiment, SuggestionApiError> {
        let url = self.experiments_url(name)?;
        let body = serde_json::to_value(experiment)
            .map_err(|err| SuggestionApiError::InvalidUrl(err.to_string()))?;
        with_retries(
            "suggestion",
            "create-experiment",
            Some(name.to_string()),
            &self.retries,
            &(url, body),
            |(url, body)| {
                let this = self.clone();
                Box::pin(async move {
                    this.send_json(
                        reqwest::Method::PUT,
                        url.clone(),
                        Some(body.clone()),
                        || SuggestionApiError::ExperimentNotFound,
                    )
                    .await
                })
            },
            SuggestionApiError::is_retriable,
        )
        .await
    }

    async fn delete_experiment(&self, experiment_url: &str) -> Result<(), SuggestionApiError> {
        let url = self.url(experiment_url)?;
        let result = self
            .send_unit(reqwest::Method::DELETE, url, None, || {
                SuggestionApiError::ExperimentNotFound
            })
            .await;
        match result {
            Err(SuggestionApiError::ExperimentNotFound) => {
                debug!(experiment_url, "experiment already deleted");
                Ok(())
            }
            other => other,
        }
    }

    async fn next_trial(
        &self,
        next_trial_url: &str,
    ) -> Result<TrialAssignments, SuggestionApiError> {
        let url = self.url(next_trial_url)?;
        self.send_json(reqwest::Method::POST, url, None, || {
            SuggestionApiError::ExperimentNotFound
        })
        .await
    }

    async fn create_trial(
        &self,
        trials_url: &str,
        assignments: &TrialAssignments,
    ) -> Result<(), SuggestionApiError> {
        let url = self.url(trials_url)?;
        let body = serde_json::to_value(assignments)
            .map_err(|err| SuggestionApiError::InvalidUrl(err.to_string()))?;
        self.send_unit(reqwest::Method::POST, url, Some(body), || {
            SuggestionApiError::ExperimentNotFound
        })
        .await
    }

    async fn report_trial(
        &self,
        report_trial_url: &str,
        values: &TrialValues,
    ) -> Result<(), SuggestionApiError> {
        let url = self.url(report_trial_url)?;
        let body = serde_json::to_value(values)
            .map_err(|err| SuggestionApiError::InvalidUrl(err.to_string()))?;
        let result = with_retries(
            "suggestion",
            "report-trial",
            None,
            &self.retries,
            &(url, body),
            |(url, body)| {
                let this = self.clone();
                Box::pin(async move {
                    this.send_unit(
                        reqwest::Method::POST,
                        url.clone(),
                        Some(body.clone()),
                        || SuggestionApiError::TrialNotFound,
                    )
                    .await
                })
            },
            SuggestionApiError::is_retriable,
        )
        .await;
        match result {
            Err(SuggestionApiError::TrialAlreadyReported) => {
                debug!(report_trial_url, "trial already reported");
                Ok(())
            }
            other => other,
        }
    }

    async fn abandon_running_trial(
        &self,
        report_trial_url: &str,
    ) -> Result<(), SuggestionApiError> {
        let url = self.url(report_trial_url)?;
        let result = self
            .send_unit(reqwest::Method::DELETE, url, None, || {
                SuggestionApiError::TrialNotFound
            })
            .await;
        match result {
            Err(SuggestionApiError::TrialNotFound) => Ok(()),
            other => other,
        }
    }

    async fn subscribe_activity(&self) -> Result<Vec<ActivityItem>, SuggestionApiError> {
        let url = self.activity_url()?;
        let feed: ActivityFeed = self
            .send_json(reqwest::Method::GET, url, None, || {
                SuggestionApiError::ExperimentNotFound
            })
            .await?;
        Ok(feed.items)
    }

    async fn get_scenario(&self, scenario_url: &str) -> Result<Scenario, SuggestionApiError> {
        let url = self.url(scenario_url)?;
        self.send_json(reqwest::Method::GET, url, None, || {
            SuggestionApiError::ExperimentNotFound
        })
        .await
    }

    async fn get_template(
        &self,
        template_url: &str,
    ) -> Result<ServerExperiment, SuggestionApiError> {
        let url = self.url(template_url)?;
        self.send_json(reqwest::Method::GET, url, None, || {
            SuggestionApiError::ExperimentNotFound
        })
        .await
    }

    async fn put_template(
        &self,
        template_url: &str,
        template: &ServerExperiment,
    ) -> Result<(), SuggestionApiError> {
        let url = self.url(template_url)?;
        let body = serde_json::to_value(template)
            .map_err(|err| SuggestionApiError::InvalidUrl(err.to_string()))?;
        self.send_unit(reqwest::Method::PUT, url, Some(body), || {
            SuggestionApiError::ExperimentNotFound
        })
        .await
    }

    async fn delete_activity(&self, item_url: &str) -> Result<(), SuggestionApiError> {
        let url = self.url(item_url)?;
        let result = self
            .send_unit(reqwest::Method::DELETE, url, None, || {
                SuggestionApiError::TrialNotFound
            })
            .await;
        match result {
            Err(SuggestionApiError::TrialNotFound) => Ok(()),
            other => other,
        }
    }

    async fn fail_activity(
        &self,
        item_url: &str,
        failure_reason: &str,
    ) -> Result<(), SuggestionApiError> {
        let url = self.url(item_url)?;
        let body = serde_json::json!({ "failureReason": failure_reason });
        self.send_unit(reqwest::Method::PATCH, url, Some(body), || {
            SuggestionApiError::TrialNotFound
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn not_found() -> SuggestionApiError {
        SuggestionApiError::TrialNotFound
    }

    #[test]
    fn body_error_code_wins_over_the_status() {
        let err = error_from_response(
            StatusCode::BAD_REQUEST,
            None,
            br#"{"type": "experiment-stopped"}"#,
            not_found,
        );
        assert!(matches!(err, SuggestionApiError::ExperimentStopped));
    }

    #[test]
    fn gone_maps_to_experiment_stopped() {
        let err = error_from_response(StatusCode::GONE, None, b"", not_found);
        assert!(matches!(err, SuggestionApiError::ExperimentStopped));
    }

    #[test]
    fn service_unavailable_carries_the_retry_after() {
        let err = error_from_response(
            StatusCode::SERVICE_UNAVAILABLE,
            Some(Duration::from_secs(30)),
            b"",
            not_found,
        );
        match err {
            SuggestionApiError::TrialUnavailable { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected TrialUnavailable, got {other}"),
        }
    }

    #[test]
    fn missing_retry_after_gets_a_default() {
        let err = error_from_response(StatusCode::SERVICE_UNAVAILABLE, None, b"", not_found);
        assert!(
            matches!(err, SuggestionApiError::TrialUnavailable { retry_after } if retry_after > Duration::ZERO)
        );
    }

    #[test]
    fn bare_not_found_uses_the_operation_context() {
        let err = error_from_response(StatusCode::NOT_FOUND, None, b"", not_found);
        assert!(matches!(err, SuggestionApiError::TrialNotFound));
    }

    #[test]
    fn unknown_status_is_unexpected() {
        let err = error_from_response(StatusCode::IM_A_TEAPOT, None, b"oops", not_found);
        match err {
            SuggestionApiError::Unexpected { status, message } => {
                assert_eq!(status, 418);
                assert_eq!(message, "oops");
            }
            other => panic!("expected Unexpected, got {other}"),
        }
    }

    #[test]
    fn retriable_errors_are_transport_and_server_side() {
        assert!(SuggestionApiError::is_retriable(
            &SuggestionApiError::Unexpected {
                status: 502,
                message: "".into()
            }
        ));
        assert!(!SuggestionApiError::is_retriable(
            &SuggestionApiError::ExperimentStopped
        ));
        assert!(!SuggestionApiError::is_retriable(
            &SuggestionApiError::TrialUnavailable {
                retry_after: Duration::from_secs(5)
            }
        ));
    }
}
