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

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "OPTIMIZE__";

/// Layered configuration loader: compiled-in defaults, then the service's
/// TOML file, then `OPTIMIZE__` prefixed environment variables.
pub struct ConfigLoader<T: Default + Serialize + DeserializeOwned> {
    pub config_file_name: PathBuf,
    phantom_data: PhantomData<T>,
}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            phantom_data: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(self.config_file_name.clone()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> figment::error::Result<T> {
        self.figment().extract()
    }

    /// Loads the configuration, or handles the `--dump-config` command line
    /// argument and returns `None` when the process should exit instead of
    /// starting up.
    pub fn load_or_dump_config(&self) -> Option<T> {
        let args: Vec<String> = std::env::args().collect();
        if args.contains(&"--dump-config".to_string()) {
            let config = T::default();
            println!("{}", serde_json::to_string_pretty(&config).unwrap());
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!("Failed to load config: {err}");
                    None
                }
            }
        }
    }
}

/// Retry policy for remote calls, exponential backoff between
/// `min_delay` and `max_delay`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::max_attempts_3()
    }
}

impl RetryConfig {
    pub fn max_attempts_3() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    pub fn max_attempts_5() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    pub fn no_retries() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::RetryConfig;

    #[test]
    fn retry_config_round_trips_through_toml() {
        let config = RetryConfig::default();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: RetryConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}
