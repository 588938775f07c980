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

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    /// Emit one JSON object per event instead of the human console format.
    pub json: bool,
    pub ansi: bool,
    /// `RUST_LOG`-style directives; the `RUST_LOG` environment variable
    /// overrides this when set.
    pub directives: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            ansi: true,
            directives: "info,kube=warn,hyper=warn,tower=warn".to_string(),
        }
    }

    pub fn deployment(service_name: &str) -> Self {
        Self {
            json: true,
            ansi: false,
            ..Self::local_dev(service_name)
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("optimize-controller")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service name: {}", self.service_name);
        let _ = writeln!(&mut result, "json: {}", self.json);
        let _ = writeln!(&mut result, "directives: {}", self.directives);
        result
    }
}

/// Installs the global subscriber. Must be called once, before the first
/// tracing event.
pub fn init_tracing(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives.clone()));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi))
            .init();
    }
}
