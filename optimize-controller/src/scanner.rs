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

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use optimize_api::application::Application;
use optimize_server_client::model::{
    ServerBounds, ServerExperiment, ServerMetric, ServerParameter,
};

/// CPU search space never exceeds two cores.
const CPU_MAX_MILLIS: i64 = 2000;
const CPU_MIN_MILLIS: i64 = 25;
const REPLICAS_MIN: i64 = 1;
const REPLICAS_MAX: i64 = 5;

/// What the scanner learned about one workload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadInfo {
    pub name: String,
    pub replicas: i64,
    pub containers: Vec<ContainerInfo>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerInfo {
    pub name: String,
    pub cpu_millis: Option<i64>,
    pub memory_mib: Option<i64>,
}

/// Extracts the tunable facts from a deployment: replica count and the
/// resource requests of every container.
pub fn workload_from_deployment(deployment: &Deployment) -> WorkloadInfo {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1) as i64;

    let containers = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|pod| {
            pod.containers
                .iter()
                .map(|container| {
                    let requests = container
                        .resources
                        .as_ref()
                        .and_then(|r| r.requests.as_ref());
                    ContainerInfo {
                        name: container.name.clone(),
                        cpu_millis: requests
                            .and_then(|r| r.get("cpu"))
                            .and_then(parse_cpu_millis),
                        memory_mib: requests
                            .and_then(|r| r.get("memory"))
                            .and_then(parse_memory_mib),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    WorkloadInfo {
        name,
        replicas,
        containers,
    }
}

/// `"500m"` → 500, `"1"` → 1000, `"1.5"` → 1500.
pub fn parse_cpu_millis(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse::<i64>().ok();
    }
    raw.parse::<f64>().ok().map(|cores| (cores * 1000.0) as i64)
}

/// `"25Mi"` → 25, `"1Gi"` → 1024, plain bytes are rounded down to MiB.
pub fn parse_memory_mib(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    for (suffix, factor) in [
        ("Ki", 1.0 / 1024.0),
        ("Mi", 1.0),
        ("Gi", 1024.0),
        ("Ti", 1024.0 * 1024.0),
        ("M", 1_000_000.0 / (1024.0 * 1024.0)),
        ("G", 1_000_000_000.0 / (1024.0 * 1024.0)),
    ] {
        if let Some(value) = raw.strip_suffix(suffix) {
            return value.parse::<f64>().ok().map(|v| (v * factor) as i64);
        }
    }
    raw.parse::<f64>()
        .ok()
        .map(|bytes| (bytes / (1024.0 * 1024.0)) as i64)
}

/// Generates the experiment template for an application: per-container cpu
/// and memory parameters around the observed baselines, a replica count
/// parameter, and the metrics backing the declared objectives.
pub fn generate_template(application: &Application, workloads: &[WorkloadInfo]) -> ServerExperiment {
    let parameters = scan_parameters(application, workloads);
    let metrics = scan_metrics(application);
    ServerExperiment {
        parameters,
        metrics,
        ..ServerExperiment::default()
    }
}

pub fn scan_parameters(
    application: &Application,
    workloads: &[WorkloadInfo],
) -> Vec<ServerParameter> {
    let toggles = application
        .spec
        .parameters
        .clone()
        .unwrap_or_default();

    let mut parameters = Vec::new();
    for workload in workloads {
        for container in &workload.containers {
            if toggles.cpu {
                if let Some(baseline) = container.cpu_millis {
                    parameters.push(ServerParameter {
                        name: format!("{}_cpu", container.name),
                        bounds: ServerBounds {
                            min: (baseline / 2).max(CPU_MIN_MILLIS),
                            max: CPU_MAX_MILLIS,
                        },
                        baseline: Some(baseline),
                    });
                }
            }
            if toggles.memory {
                if let Some(baseline) = container.memory_mib {
                    parameters.push(ServerParameter {
                        name: format!("{}_memory", container.name),
                        bounds: ServerBounds {
                            min: (baseline / 2).max(1),
                            max: baseline * 2,
                        },
                        baseline: Some(baseline),
                    });
                }
            }
        }
    }

    if toggles.replicas {
        if let Some(baseline) = workloads.iter().map(|w| w.replicas).max() {
            parameters.push(ServerParameter {
                name: "replicas".to_string(),
                bounds: ServerBounds {
                    min: REPLICAS_MIN,
                    max: REPLICAS_MAX,
                },
                baseline: Some(baseline.clamp(REPLICAS_MIN, REPLICAS_MAX)),
            });
        }
    }

    parameters
}

fn latency_metric(objective: &str) -> Option<ServerMetric> {
    let percentile = match objective {
        "p50" | "p50-latency" => "p50",
        "p95" | "p95-latency" => "p95",
        "p99" | "p99-latency" => "p99",
        _ => return None,
    };
    Some(ServerMetric {
        name: percentile.to_string(),
        minimize: true,
        optimize: None,
    })
}

pub fn scan_metrics(application: &Application) -> Vec<ServerMetric> {
    let mut metrics = Vec::new();
    for objective in &application.spec.objectives {
        if let Some(metric) = latency_metric(&objective.name) {
            metrics.push(metric);
            continue;
        }
        if objective.name == "cost" {
            metrics.push(ServerMetric {
                name: "cost".to_string(),
                minimize: true,
                optimize: None,
            });
            // recorded but not optimized: the weighted total is the objective
            metrics.push(ServerMetric {
                name: "cost-cpu-requests".to_string(),
                minimize: true,
                optimize: Some(false),
            });
            metrics.push(ServerMetric {
                name: "cost-memory-requests".to_string(),
                minimize: true,
                optimize: Some(false),
            });
            continue;
        }
        metrics.push(ServerMetric {
            name: objective.name.clone(),
            minimize: true,
            optimize: None,
        });
    }
    metrics
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use optimize_api::application::{
        ApplicationParameters, ApplicationResource, ApplicationSpec, Objective,
    };

    fn application() -> Application {
        Application::new(
            "app-1",
            ApplicationSpec {
                resources: vec![ApplicationResource {
                    namespace: Some("engineering".into()),
                    label_selector: "app.kubernetes.io/name=app-1".into(),
                }],
                parameters: None,
                objectives: vec![
                    Objective { name: "p95".into() },
                    Objective { name: "cost".into() },
                ],
            },
        )
    }

    fn nginx_workload() -> WorkloadInfo {
        WorkloadInfo {
            name: "nginx".into(),
            replicas: 1,
            containers: vec![ContainerInfo {
                name: "nginx".into(),
                cpu_millis: Some(50),
                memory_mib: Some(25),
            }],
        }
    }

    #[test]
    fn quantities_parse_into_canonical_units() {
        assert_eq!(parse_cpu_millis(&Quantity("50m".into())), Some(50));
        assert_eq!(parse_cpu_millis(&Quantity("1".into())), Some(1000));
        assert_eq!(parse_cpu_millis(&Quantity("1.5".into())), Some(1500));
        assert_eq!(parse_memory_mib(&Quantity("25Mi".into())), Some(25));
        assert_eq!(parse_memory_mib(&Quantity("1Gi".into())), Some(1024));
        assert_eq!(parse_memory_mib(&Quantity("524288".into())), Some(0));
    }

    #[test]
    fn scan_generates_the_expected_parameters() {
        let parameters = scan_parameters(&application(), &[nginx_workload()]);

        assert_eq!(parameters.len(), 3);
        assert_eq!(parameters[0].name, "nginx_cpu");
        assert_eq!(parameters[0].bounds, ServerBounds { min: 25, max: 2000 });
        assert_eq!(parameters[0].baseline, Some(50));

        assert_eq!(parameters[1].name, "nginx_memory");
        assert_eq!(parameters[1].bounds, ServerBounds { min: 12, max: 50 });
        assert_eq!(parameters[1].baseline, Some(25));

        assert_eq!(parameters[2].name, "replicas");
        assert_eq!(parameters[2].bounds, ServerBounds { min: 1, max: 5 });
        assert_eq!(parameters[2].baseline, Some(1));
    }

    #[test]
    fn scan_generates_the_expected_metrics() {
        let metrics = scan_metrics(&application());

        let rendered: Vec<_> = metrics
            .iter()
            .map(|m| (m.name.as_str(), m.minimize, m.optimize))
            .collect();
        assert_eq!(
            rendered,
            vec![
                ("p95", true, None),
                ("cost", true, None),
                ("cost-cpu-requests", true, Some(false)),
                ("cost-memory-requests", true, Some(false)),
            ]
        );
    }

    #[test]
    fn parameter_toggles_suppress_families() {
        let mut application = application();
        application.spec.parameters = Some(ApplicationParameters {
            cpu: true,
            memory: false,
            replicas: false,
        });

        let parameters = scan_parameters(&application, &[nginx_workload()]);
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters[0].name, "nginx_cpu");
    }

    #[test]
    fn containers_without_requests_produce_no_parameters() {
        let workload = WorkloadInfo {
            name: "bare".into(),
            replicas: 2,
            containers: vec![ContainerInfo {
                name: "bare".into(),
                cpu_millis: None,
                memory_mib: None,
            }],
        };
        let parameters = scan_parameters(&application(), &[workload]);
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters[0].name, "replicas");
        assert_eq!(parameters[0].baseline, Some(2));
    }

    #[test]
    fn deployment_extraction_reads_requests() {
        let deployment: Deployment = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "nginx"},
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {"app.kubernetes.io/name": "app-1"}},
                "template": {
                    "metadata": {"labels": {"app.kubernetes.io/name": "app-1"}},
                    "spec": {"containers": [{
                        "name": "nginx",
                        "image": "nginx:1.25",
                        "resources": {"requests": {"cpu": "50m", "memory": "25Mi"}}
                    }]}
                }
            }
        }))
        .unwrap();

        let workload = workload_from_deployment(&deployment);
        assert_eq!(workload, nginx_workload());
    }
}
