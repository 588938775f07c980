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

pub mod capture;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod patchops;
pub mod poller;
pub mod ratelimit;
pub mod readiness;
pub mod scanner;
pub mod setup_jobs;
pub mod template;

use crate::capture::{MetricCapture, MetricCaptureDefault};
use crate::config::ControllerConfig;
use crate::patchops::{PatchAssembler, PatchAssemblerDefault};
use crate::ratelimit::TrialRateLimiter;
use crate::template::{JinjaTemplateEngine, TemplateEngine};
use anyhow::Context as _;
use kube::Client;
use optimize_server_client::client::{SuggestionApi, SuggestionApiDefault};
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::{get, handler, Route, Server};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

#[cfg(test)]
test_r::enable!();

/// Shared state of every controller: the cluster client and the
/// collaborators the reconcilers delegate to.
pub struct Context {
    pub client: Client,
    pub config: ControllerConfig,
    pub server: Arc<dyn SuggestionApi>,
    pub templates: Arc<dyn TemplateEngine>,
    pub assembler: Arc<dyn PatchAssembler>,
    pub capture: Arc<dyn MetricCapture>,
    pub trial_limiter: TrialRateLimiter,
}

impl Context {
    pub fn new(client: Client, config: ControllerConfig) -> anyhow::Result<Self> {
        let server: Arc<dyn SuggestionApi> = Arc::new(
            SuggestionApiDefault::new(&config.server)
                .context("failed to construct the suggestion service client")?,
        );
        let templates: Arc<dyn TemplateEngine> = Arc::new(JinjaTemplateEngine::new());
        let capture: Arc<dyn MetricCapture> = Arc::new(MetricCaptureDefault::new(
            reqwest::Client::builder()
                .timeout(config.server.timeout)
                .build()
                .context("failed to construct the metric capture client")?,
            templates.clone(),
        ));
        Ok(Self {
            client,
            config,
            server,
            templates,
            assembler: Arc::new(PatchAssemblerDefault),
            capture,
            trial_limiter: TrialRateLimiter::one_per_second(),
        })
    }
}

#[handler]
fn healthz() -> &'static str {
    "ok"
}

/// Starts every reconciler, the activity poller and the health endpoint,
/// and runs until the controllers shut down on a termination signal.
pub async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to construct the kubernetes client")?;
    let http_port = config.http_port;
    let ctx = Arc::new(Context::new(client, config)?);

    let mut join_set: JoinSet<()> = JoinSet::new();
    join_set.spawn(controller::setup::run(ctx.clone()));
    join_set.spawn(controller::patch::run(ctx.clone()));
    join_set.spawn(controller::ready::run(ctx.clone()));
    join_set.spawn(controller::trial_job::run(ctx.clone()));
    join_set.spawn(controller::metric::run(ctx.clone()));
    join_set.spawn(controller::experiment::run(ctx.clone()));
    join_set.spawn(poller::run(ctx.clone()));

    let app = Route::new()
        .at("/healthz", get(healthz))
        .at(
            "/metrics",
            PrometheusExporter::new(prometheus::default_registry().clone()),
        );
    let address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, http_port).to_string();
    join_set.spawn(async move {
        if let Err(err) = Server::new(TcpListener::bind(address)).run(app).await {
            tracing::error!(%err, "health endpoint terminated");
        }
    });

    info!("optimize controller started");

    // the kube controllers exit together on SIGTERM; the poller and the
    // HTTP endpoint are torn down with the join set
    join_set.join_next().await;
    join_set.shutdown().await;
    Ok(())
}
