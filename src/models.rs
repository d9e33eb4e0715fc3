/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::process_control::LogSinks;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One benchmark cycle's identity: the label it is reported under, the value of the
/// feature flag written into the target's configuration before building and where its
/// logs go.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantConfig {
    pub label: String,
    pub flag: bool,
    /// Load generator output for every run of this cycle, appended in order.
    pub log_file: PathBuf,
    /// Build and service stdout/stderr for this cycle.
    pub sinks: LogSinks,
}

impl VariantConfig {
    pub fn new(label: &str, flag: bool, log_file: PathBuf, sinks: LogSinks) -> Self {
        Self {
            label: label.to_string(),
            flag,
            log_file,
            sinks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadGeneratorConfig {
    pub requests: u32,
    pub concurrency: u32,
    pub url: String,
}

/// Means of the three load generator metrics across every run of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Mean "Time taken for tests", in seconds.
    pub total_duration: f64,
    /// Mean "Time per request" across all concurrent requests, in milliseconds.
    pub time_per_request: f64,
    /// Mean "Requests per second".
    pub requests_per_second: f64,
}

impl BenchmarkResult {
    pub fn new(total_duration: f64, time_per_request: f64, requests_per_second: f64) -> Self {
        Self {
            total_duration,
            time_per_request,
            requests_per_second,
        }
    }
}
