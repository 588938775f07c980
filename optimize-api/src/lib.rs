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

pub mod application;
pub mod condition;
pub mod experiment;
pub mod job;
pub mod trial;
pub mod validation;

#[cfg(test)]
test_r::enable!();

pub const GROUP: &str = "optimize.golem.cloud";
pub const VERSION: &str = "v1beta1";
pub const API_VERSION: &str = "optimize.golem.cloud/v1beta1";

/// Label carrying the owning experiment's name, stamped on trials and on
/// every object a trial creates.
pub const LABEL_EXPERIMENT: &str = "optimize.golem.cloud/experiment";
/// Label carrying the trial's name, stamped on the jobs a trial creates.
pub const LABEL_TRIAL: &str = "optimize.golem.cloud/trial";
/// Label distinguishing the trial-run job from setup jobs.
pub const LABEL_TRIAL_ROLE: &str = "optimize.golem.cloud/trial-role";

pub const TRIAL_ROLE_RUN: &str = "trialRun";
pub const TRIAL_ROLE_SETUP: &str = "trialSetup";

/// Annotation holding the server-side experiment URL.
pub const ANNOTATION_EXPERIMENT_URL: &str = "optimize.golem.cloud/experiment-url";
/// Annotation holding the server-side next-trial URL.
pub const ANNOTATION_NEXT_TRIAL_URL: &str = "optimize.golem.cloud/next-trial-url";
/// Annotation holding the server-side report URL for an in-flight trial.
pub const ANNOTATION_REPORT_TRIAL_URL: &str = "optimize.golem.cloud/report-trial-url";
/// Annotation holding the comma separated initializer token list.
pub const ANNOTATION_INITIALIZER: &str = "optimize.golem.cloud/initializer";
/// Annotation recording where a trial's assignments came from.
pub const ANNOTATION_SUGGESTION_SOURCE: &str = "optimize.golem.cloud/suggestion-source";

pub const SUGGESTION_SOURCE_BASELINE: &str = "baseline";

/// Finalizer held while the server still has to be told about the trial.
pub const FINALIZER_SERVER: &str = "optimize.golem.cloud/server-finalizer";
/// Finalizer held while the setup-delete job has not completed.
pub const FINALIZER_SETUP: &str = "optimize.golem.cloud/setup-finalizer";

/// Initializer token owned by the setup reconciler.
pub const INITIALIZER_SETUP: &str = "setup";
