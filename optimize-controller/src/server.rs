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

use optimize_common::tracing::init_tracing;
use optimize_common::SafeDisplay;
use optimize_controller::config::make_config_loader;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };

    init_tracing(&config.tracing);
    info!("starting with configuration:\n{}", config.to_safe_string());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(optimize_controller::run(config))
}
