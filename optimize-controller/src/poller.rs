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

use crate::controller::{Error, Result};
use crate::scanner::{generate_template, workload_from_deployment, WorkloadInfo};
use crate::Context;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{ListParams, PostParams};
use kube::Api;
use optimize_api::application::Application;
use optimize_api::experiment::Experiment;
use optimize_server_client::client::SuggestionApiError;
use optimize_server_client::conversion::to_cluster_experiment;
use optimize_server_client::model::{ActivityItem, Scenario};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Polls the server activity feed and executes scan and run requests. One
/// failed item never stops the loop; it is marked failed on the server
/// instead.
pub async fn run(ctx: Arc<Context>) {
    if !ctx.config.activity.enabled {
        debug!("activity polling disabled");
        return;
    }

    let mut interval = tokio::time::interval(ctx.config.activity.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match ctx.server.subscribe_activity().await {
            Ok(items) => {
                for item in items {
                    handle_item(&ctx, &item).await;
                }
            }
            Err(err) => warn!(%err, "activity feed poll failed"),
        }
    }
}

async fn handle_item(ctx: &Context, item: &ActivityItem) {
    let result = if item.is_scan() {
        handle_scan(ctx, item).await
    } else if item.is_run() {
        handle_run(ctx, item).await
    } else {
        debug!(url = item.url, tags = ?item.tags, "ignoring unknown activity");
        return;
    };

    match result {
        Ok(()) => {
            if let Err(err) = ctx.server.delete_activity(&item.url).await {
                warn!(url = item.url, %err, "failed to delete processed activity");
            }
        }
        Err(err) => {
            warn!(url = item.url, %err, "activity failed");
            if let Err(err) = ctx.server.fail_activity(&item.url, &err.to_string()).await {
                warn!(url = item.url, %err, "failed to mark activity as failed");
            }
        }
    }
}

async fn scenario_for(ctx: &Context, item: &ActivityItem) -> Result<Scenario> {
    let scenario_url = item.external_url.as_deref().unwrap_or(&item.url);
    Ok(ctx.server.get_scenario(scenario_url).await?)
}

/// Scan: look at the application's workloads and publish an experiment
/// template for them.
async fn handle_scan(ctx: &Context, item: &ActivityItem) -> Result<()> {
    let scenario = scenario_for(ctx, item).await?;
    let namespace = scenario
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let applications: Api<Application> = Api::namespaced(ctx.client.clone(), &namespace);
    let application = applications.get(&scenario.application).await?;

    let mut workloads: Vec<WorkloadInfo> = Vec::new();
    for resource in &application.spec.resources {
        let resource_namespace = resource.namespace.as_deref().unwrap_or(&namespace);
        let deployments: Api<Deployment> =
            Api::namespaced(ctx.client.clone(), resource_namespace);
        let list = deployments
            .list(&ListParams::default().labels(&resource.label_selector))
            .await?;
        workloads.extend(list.items.iter().map(workload_from_deployment));
    }

    if workloads.is_empty() {
        return Err(Error::Server(SuggestionApiError::Unexpected {
            status: 0,
            message: format!(
                "no workloads matched the resources of application {}",
                scenario.application
            ),
        }));
    }

    let template = generate_template(&application, &workloads);
    ctx.server
        .put_template(&scenario.template_url, &template)
        .await?;
    info!(
        application = scenario.application,
        workloads = workloads.len(),
        "published experiment template"
    );
    Ok(())
}

/// Run: turn the published template into a cluster experiment; the
/// experiment coordinator takes it from there.
async fn handle_run(ctx: &Context, item: &ActivityItem) -> Result<()> {
    let scenario = scenario_for(ctx, item).await?;
    let template = ctx.server.get_template(&scenario.template_url).await?;

    let namespace = scenario
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let name = scenario
        .name
        .clone()
        .unwrap_or_else(|| scenario.application.clone());

    let experiment = Experiment::new(&name, to_cluster_experiment(&template));
    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
    match api.create(&PostParams::default(), &experiment).await {
        Ok(_) => {
            info!(experiment = name, namespace, "created experiment from activity");
            Ok(())
        }
        Err(err) if crate::controller::is_already_exists(&err) => {
            debug!(experiment = name, "experiment already exists");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
