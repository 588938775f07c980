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

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-experiment trial creation throttle: one token per interval, no burst.
/// `reserve` either consumes the token or reports how long to requeue for.
pub struct TrialRateLimiter {
    interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl TrialRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// One trial per second, no burst.
    pub fn one_per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn reserve(&self, key: &str) -> Duration {
        self.reserve_at(key, Instant::now())
    }

    /// Returns `Duration::ZERO` and consumes the token when the interval has
    /// elapsed since the last reservation for `key`; otherwise returns the
    /// remaining wait without consuming anything.
    pub fn reserve_at(&self, key: &str, now: Instant) -> Duration {
        let mut last = self.last.lock().expect("rate limiter lock poisoned");
        match last.get(key) {
            Some(previous) => {
                let ready_at = *previous + self.interval;
                if now >= ready_at {
                    last.insert(key.to_string(), now);
                    Duration::ZERO
                } else {
                    ready_at - now
                }
            }
            None => {
                last.insert(key.to_string(), now);
                Duration::ZERO
            }
        }
    }

    /// Drops the state for a key, e.g. when an experiment is deleted.
    pub fn forget(&self, key: &str) {
        self.last
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(key);
    }
}
