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

use crate::template::TemplateEngine;
use async_trait::async_trait;
use optimize_api::experiment::{Metric, MetricType};
use optimize_api::trial::Trial;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

const SCRAPE_RETRY: Duration = Duration::from_secs(5);

/// Resolved capture target: the endpoints to query. Empty for local
/// metrics, the Prometheus base URL for prometheus metrics, one endpoint
/// per resolved object for jsonpath metrics.
#[derive(Clone, Debug, Default)]
pub struct CaptureTarget {
    pub urls: Vec<Url>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapturedValue {
    pub value: f64,
    pub error: Option<f64>,
}

/// Capture failures carry the address and query for the failure-threshold
/// log line; retryable failures carry the delay to requeue with instead.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("metric data not available yet, retry after {retry_after:?}")]
    Retryable { retry_after: Duration },
    #[error("metric capture failed (address={address}, query={query}): {message}")]
    Permanent {
        address: String,
        query: String,
        message: String,
    },
}

impl CaptureError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CaptureError::Retryable { retry_after } => Some(*retry_after),
            CaptureError::Permanent { .. } => None,
        }
    }

    fn permanent(address: &str, query: &str, message: impl Into<String>) -> Self {
        CaptureError::Permanent {
            address: address.to_string(),
            query: query.to_string(),
            message: message.into(),
        }
    }
}

/// Blocking evaluation of one metric against its resolved target.
#[async_trait]
pub trait MetricCapture: Send + Sync {
    async fn capture(
        &self,
        trial: &Trial,
        metric: &Metric,
        target: &CaptureTarget,
    ) -> Result<CapturedValue, CaptureError>;
}

pub struct MetricCaptureDefault {
    http: reqwest::Client,
    templates: Arc<dyn TemplateEngine>,
}

impl MetricCaptureDefault {
    pub fn new(http: reqwest::Client, templates: Arc<dyn TemplateEngine>) -> Self {
        Self { http, templates }
    }

    fn render(&self, query: &str, trial: &Trial, metric: &Metric) -> Result<String, CaptureError> {
        self.templates
            .render_query(query, trial)
            .map_err(|err| CaptureError::permanent("", &metric.query, err.to_string()))
    }

    async fn capture_local(
        &self,
        trial: &Trial,
        metric: &Metric,
    ) -> Result<CapturedValue, CaptureError> {
        let rendered = self.render(&metric.query, trial, metric)?;
        let value = rendered.trim().parse::<f64>().map_err(|err| {
            CaptureError::permanent("local", &metric.query, format!("{err}: {rendered}"))
        })?;
        Ok(CapturedValue { value, error: None })
    }

    async fn prometheus_query(
        &self,
        base: &Url,
        query: &str,
        time: Option<i64>,
    ) -> Result<f64, CaptureError> {
        let mut url = base
            .join("api/v1/query")
            .map_err(|err| CaptureError::permanent(base.as_str(), query, err.to_string()))?;
        url.query_pairs_mut().append_pair("query", query);
        if let Some(time) = time {
            url.query_pairs_mut().append_pair("time", &time.to_string());
        }

        let response = self.http.get(url.clone()).send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                CaptureError::Retryable {
                    retry_after: SCRAPE_RETRY,
                }
            } else {
                CaptureError::permanent(base.as_str(), query, err.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CaptureError::Retryable {
                retry_after: SCRAPE_RETRY,
            });
        }
        if !status.is_success() {
            return Err(CaptureError::permanent(
                base.as_str(),
                query,
                format!("prometheus returned {status}"),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| CaptureError::permanent(base.as_str(), query, err.to_string()))?;
        parse_prometheus_value(&body).map_err(|outcome| match outcome {
            PrometheusOutcome::NoData => {
                debug!(query, "prometheus query returned no samples yet");
                CaptureError::Retryable {
                    retry_after: SCRAPE_RETRY,
                }
            }
            PrometheusOutcome::Invalid(message) => {
                CaptureError::permanent(base.as_str(), query, message)
            }
        })
    }

    async fn capture_prometheus(
        &self,
        trial: &Trial,
        metric: &Metric,
        target: &CaptureTarget,
    ) -> Result<CapturedValue, CaptureError> {
        let base = target.urls.first().ok_or_else(|| {
            CaptureError::permanent("", &metric.query, "no prometheus endpoint resolved")
        })?;
        let time = trial
            .status
            .as_ref()
            .and_then(|s| s.completion_time.as_ref())
            .map(|t| t.0.timestamp());

        let query = self.render(&metric.query, trial, metric)?;
        let value = self.prometheus_query(base, &query, time).await?;

        let error = match &metric.error_query {
            Some(error_query) => {
                let error_query = self.render(error_query, trial, metric)?;
                Some(self.prometheus_query(base, &error_query, time).await?)
            }
            None => None,
        };

        Ok(CapturedValue { value, error })
    }

    async fn capture_jsonpath(
        &self,
        trial: &Trial,
        metric: &Metric,
        target: &CaptureTarget,
    ) -> Result<CapturedValue, CaptureError> {
        if target.urls.is_empty() {
            return Err(CaptureError::permanent(
                "",
                &metric.query,
                "no endpoints resolved for jsonpath metric",
            ));
        }

        let query = self.render(&metric.query, trial, metric)?;
        let mut total = 0.0;
        for url in &target.urls {
            let response = self.http.get(url.clone()).send().await.map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    CaptureError::Retryable {
                        retry_after: SCRAPE_RETRY,
                    }
                } else {
                    CaptureError::permanent(url.as_str(), &query, err.to_string())
                }
            })?;
            let body: JsonValue = response
                .json()
                .await
                .map_err(|err| CaptureError::permanent(url.as_str(), &query, err.to_string()))?;
            total += jsonpath_value(&body, &query)
                .map_err(|message| CaptureError::permanent(url.as_str(), &query, message))?;
        }

        Ok(CapturedValue {
            value: total,
            error: None,
        })
    }
}

#[async_trait]
impl MetricCapture for MetricCaptureDefault {
    async fn capture(
        &self,
        trial: &Trial,
        metric: &Metric,
        target: &CaptureTarget,
    ) -> Result<CapturedValue, CaptureError> {
        match metric.metric_type {
            MetricType::Local => self.capture_local(trial, metric).await,
            MetricType::Prometheus => self.capture_prometheus(trial, metric, target).await,
            MetricType::JsonPath => self.capture_jsonpath(trial, metric, target).await,
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum PrometheusOutcome {
    NoData,
    Invalid(String),
}

#[derive(Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PrometheusData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: JsonValue,
}

/// Extracts the single sample of a scalar or instant vector result.
pub(crate) fn parse_prometheus_value(body: &[u8]) -> Result<f64, PrometheusOutcome> {
    let response: PrometheusResponse = serde_json::from_slice(body)
        .map_err(|err| PrometheusOutcome::Invalid(err.to_string()))?;
    if response.status != "success" {
        return Err(PrometheusOutcome::Invalid(
            response.error.unwrap_or_else(|| "query failed".to_string()),
        ));
    }
    let Some(data) = response.data else {
        return Err(PrometheusOutcome::NoData);
    };

    let sample = match data.result_type.as_str() {
        "scalar" => data.result.clone(),
        "vector" => match data.result.as_array().and_then(|r| r.first()) {
            Some(first) => first["value"].clone(),
            None => return Err(PrometheusOutcome::NoData),
        },
        other => {
            return Err(PrometheusOutcome::Invalid(format!(
                "unsupported result type {other}"
            )))
        }
    };

    sample
        .as_array()
        .and_then(|pair| pair.get(1))
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| PrometheusOutcome::Invalid("malformed sample".to_string()))
}

/// Evaluates a JSONPath query expecting a single numeric result.
pub(crate) fn jsonpath_value(body: &JsonValue, query: &str) -> Result<f64, String> {
    let path = serde_json_path::JsonPath::parse(query).map_err(|err| err.to_string())?;
    let nodes = path.query(body);
    let count = nodes.len();
    let node = nodes
        .exactly_one()
        .map_err(|_| format!("query matched {count} values, expected 1"))?;
    node.as_f64()
        .or_else(|| node.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| format!("query result is not numeric: {node}"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn scalar_results_parse() {
        let body = br#"{"status":"success","data":{"resultType":"scalar","result":[1712000000,"0.123"]}}"#;
        assert_eq!(parse_prometheus_value(body).unwrap(), 0.123);
    }

    #[test]
    fn vector_results_use_the_first_sample() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1712000000,"42"]}]}}"#;
        assert_eq!(parse_prometheus_value(body).unwrap(), 42.0);
    }

    #[test]
    fn empty_vectors_are_retryable_no_data() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert_eq!(
            parse_prometheus_value(body).unwrap_err(),
            PrometheusOutcome::NoData
        );
    }

    #[test]
    fn query_errors_are_permanent() {
        let body = br#"{"status":"error","error":"parse error at char 3"}"#;
        assert!(matches!(
            parse_prometheus_value(body).unwrap_err(),
            PrometheusOutcome::Invalid(message) if message.contains("parse error")
        ));
    }

    #[test]
    fn jsonpath_extracts_single_numbers() {
        let body = serde_json::json!({"requests": {"cpu": 0.55, "memory": "128"}});
        assert_eq!(jsonpath_value(&body, "$.requests.cpu").unwrap(), 0.55);
        assert_eq!(jsonpath_value(&body, "$.requests.memory").unwrap(), 128.0);
    }

    #[test]
    fn jsonpath_rejects_multiple_matches() {
        let body = serde_json::json!({"a": [1, 2, 3]});
        assert!(jsonpath_value(&body, "$.a[*]").is_err());
    }
}
