/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod config;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod process_control;
pub mod properties;
pub mod report;
pub mod stats;
pub mod variant_runner;

pub use health::{HealthPoller, HealthState, HttpServiceClient, ServiceClient};
pub use models::{BenchmarkResult, LoadGeneratorConfig, VariantConfig};
pub use orchestrator::{BenchmarkOrchestrator, CycleError, Phase};
pub use process_control::{ProcessRunner, ServiceHandle, SystemProcessRunner};
pub use report::Report;
pub use variant_runner::VariantRunner;
