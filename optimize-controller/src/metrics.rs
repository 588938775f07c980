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

use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use std::sync::LazyLock;

/// Optimistic concurrency conflicts per controller; silent requeues, but
/// worth watching for hot objects.
pub static RECONCILE_CONFLICTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "optimize_reconcile_conflicts_total",
        "Number of optimistic concurrency conflicts hit during reconciliation",
        &["controller"]
    )
    .expect("metric registration must not fail")
});

pub static RECONCILE_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "optimize_reconcile_errors_total",
        "Number of reconciliation attempts that surfaced an error",
        &["controller"]
    )
    .expect("metric registration must not fail")
});

pub static TRIALS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "optimize_trials_created_total",
        "Number of trials created from server suggestions"
    )
    .expect("metric registration must not fail")
});

pub static SERVER_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "optimize_server_requests_total",
        "Number of suggestion service calls by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("metric registration must not fail")
});

pub fn record_conflict(controller: &str) {
    RECONCILE_CONFLICTS_TOTAL
        .with_label_values(&[controller])
        .inc();
}

pub fn record_error(controller: &str) {
    RECONCILE_ERRORS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn record_server_request(operation: &str, outcome: &str) {
    SERVER_REQUESTS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}
