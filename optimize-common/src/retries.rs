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

use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn, Instrument};

/// Computes the delay before the given attempt, or `None` when the attempt
/// budget is exhausted. `attempts` is the number of attempts made so far.
pub fn get_delay(config: &RetryConfig, attempts: u32) -> Option<Duration> {
    if attempts >= config.max_attempts {
        return None;
    }
    let delay = config
        .min_delay
        .mul_f64(config.multiplier.powi(attempts.saturating_sub(1) as i32));
    Some(delay.min(config.max_delay))
}

/// Repeatedly invokes `action` until it succeeds, the error is no longer
/// retriable, or the retry budget runs out. The last error is returned.
pub async fn with_retries<'a, In, F, G, R, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    i: &'a In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    In: Send + Sync,
    F: for<'b> Fn(&'b In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'b + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let span = tracing::span!(
        tracing::Level::INFO,
        "retrying",
        target = target_label,
        op = op_label,
        op_id
    );
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = action(i).instrument(span.clone()).await;
        match result {
            Ok(result) => return Ok(result),
            Err(error) if is_retriable(&error) => match get_delay(config, attempts) {
                Some(delay) => {
                    let _enter = span.enter();
                    info!(
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{op_label} failed with {error}, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let _enter = span.enter();
                    warn!(attempts, "{op_label} failed with {error}, giving up");
                    return Err(error);
                }
            },
            Err(error) => {
                let _enter = span.enter();
                warn!(attempts, "{op_label} failed with non-retriable {error}");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::get_delay;
    use crate::config::RetryConfig;
    use std::time::Duration;

    #[test]
    fn delay_grows_exponentially_up_to_the_cap() {
        let config = RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };

        assert_eq!(get_delay(&config, 1), Some(Duration::from_millis(100)));
        assert_eq!(get_delay(&config, 2), Some(Duration::from_millis(200)));
        assert_eq!(get_delay(&config, 3), Some(Duration::from_millis(350)));
        assert_eq!(get_delay(&config, 4), Some(Duration::from_millis(350)));
        assert_eq!(get_delay(&config, 5), None);
    }

    #[test]
    fn no_retries_config_never_delays() {
        let config = RetryConfig::no_retries();
        assert_eq!(get_delay(&config, 1), None);
    }
}
