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

use kube::CustomResourceExt;
use optimize_api::application::Application;
use optimize_api::experiment::Experiment;
use optimize_api::trial::Trial;

/// Prints the custom resource definitions, ready for `kubectl apply -f -`.
fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Experiment::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Trial::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Application::crd())?);
    Ok(())
}
