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

use optimize_common::config::ConfigLoader;
use optimize_common::tracing::TracingConfig;
use optimize_common::SafeDisplay;
use optimize_server_client::client::SuggestionApiConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub tracing: TracingConfig,
    /// Port of the health and metrics endpoint.
    pub http_port: u16,
    pub server: SuggestionApiConfig,
    pub setup: SetupConfig,
    pub activity: ActivityConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("optimize-controller"),
            http_port: 8080,
            server: SuggestionApiConfig::default(),
            setup: SetupConfig::default(),
            activity: ActivityConfig::default(),
        }
    }
}

impl SafeDisplay for ControllerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "server:");
        let _ = writeln!(&mut result, "{}", self.server.to_safe_string_indented());
        let _ = writeln!(&mut result, "setup:");
        let _ = writeln!(&mut result, "{}", self.setup.to_safe_string_indented());
        let _ = writeln!(&mut result, "activity:");
        let _ = writeln!(&mut result, "{}", self.activity.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Treat a Forbidden response on teardown job creation as success.
    /// RBAC-strict clusters may want this off to surface real failures.
    pub allow_forbidden_delete: bool,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            allow_forbidden_delete: true,
        }
    }
}

impl SafeDisplay for SetupConfig {
    fn to_safe_string(&self) -> String {
        format!("allow forbidden delete: {}\n", self.allow_forbidden_delete)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for ActivityConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "enabled: {}", self.enabled);
        let _ = writeln!(&mut result, "poll interval: {:?}", self.poll_interval);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ControllerConfig> {
    ConfigLoader::new(&PathBuf::from("config/optimize-controller.toml"))
}
