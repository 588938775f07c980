use k8s_openapi::api::apps::v1::Deployment;
use optimize_api::application::{Application, ApplicationResource, ApplicationSpec, Objective};
use optimize_controller::scanner::{generate_template, workload_from_deployment};
use optimize_server_client::model::ServerBounds;
use test_r::test;

fn fixture_application() -> Application {
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

fn fixture_deployment() -> Deployment {
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "name": "nginx",
            "namespace": "engineering",
            "labels": {"app.kubernetes.io/name": "app-1"}
        },
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
    .unwrap()
}

/// End to end scan: a deployment with a 50m/25Mi/1-replica baseline turns
/// into the documented parameter space and objective metrics.
#[test]
fn scan_activity_generates_the_expected_template() {
    let application = fixture_application();
    let workload = workload_from_deployment(&fixture_deployment());

    let template = generate_template(&application, &[workload]);

    let parameters: Vec<_> = template
        .parameters
        .iter()
        .map(|p| (p.name.as_str(), p.bounds.clone(), p.baseline))
        .collect();
    assert_eq!(
        parameters,
        vec![
            ("nginx_cpu", ServerBounds { min: 25, max: 2000 }, Some(50)),
            ("nginx_memory", ServerBounds { min: 12, max: 50 }, Some(25)),
            ("replicas", ServerBounds { min: 1, max: 5 }, Some(1)),
        ]
    );

    let metrics: Vec<_> = template
        .metrics
        .iter()
        .map(|m| (m.name.as_str(), m.minimize, m.optimize))
        .collect();
    assert_eq!(
        metrics,
        vec![
            ("p95", true, None),
            ("cost", true, None),
            ("cost-cpu-requests", true, Some(false)),
            ("cost-memory-requests", true, Some(false)),
        ]
    );
}

/// The generated template survives the trip through the cluster experiment
/// form with its parameter space intact.
#[test]
fn generated_template_translates_to_a_cluster_experiment() {
    let template = generate_template(
        &fixture_application(),
        &[workload_from_deployment(&fixture_deployment())],
    );

    let spec = optimize_server_client::conversion::to_cluster_experiment(&template);
    assert_eq!(spec.parameters.len(), 3);
    assert_eq!(spec.parameters[0].name, "nginx_cpu");
    assert_eq!(spec.parameters[0].min, 25);
    assert_eq!(spec.parameters[0].max, 2000);
    assert_eq!(spec.metrics.len(), 4);
    assert!(spec.metrics.iter().all(|m| m.minimize));
}
