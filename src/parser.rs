/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Reduces load generator output (ApacheBench style reports, possibly many of them
//! concatenated into one log) into per-metric samples.

use crate::{
    models::BenchmarkResult,
    stats::{StatsError, Summary},
};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    TotalDuration,
    TimePerRequest,
    RequestsPerSecond,
}

impl Metric {
    pub const ALL: [Metric; 3] = [
        Metric::TotalDuration,
        Metric::TimePerRequest,
        Metric::RequestsPerSecond,
    ];

    /// Whether the line reports this metric.
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Metric::TotalDuration => line.contains("Time taken for tests"),
            // ab prints "Time per request" twice, only the concurrent batch figure counts
            Metric::TimePerRequest => {
                line.contains("Time per request")
                    && line.contains("across all concurrent requests")
            }
            Metric::RequestsPerSecond => line.contains("Requests per second"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::TotalDuration => "Time taken for tests",
            Metric::TimePerRequest => "Time per request (across all concurrent requests)",
            Metric::RequestsPerSecond => "Requests per second",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line {line_no}: no value after ':' for metric '{metric}': {line}")]
    MissingValue {
        metric: Metric,
        line_no: usize,
        line: String,
    },

    #[error("line {line_no}: '{token}' is not a number for metric '{metric}'")]
    Malformed {
        metric: Metric,
        line_no: usize,
        token: String,
    },

    #[error("no samples found for metric '{metric}'")]
    NoSamples {
        metric: Metric,
        #[source]
        source: StatsError,
    },
}

/// Lazily yields every sample of `metric` found in `log`, in order of appearance.
///
/// The value is the first whitespace delimited token after the first ':' of a matching
/// line. A token that doesn't parse as a number yields an error; it is never skipped.
pub fn samples(log: &str, metric: Metric) -> impl Iterator<Item = Result<f64, ParseError>> + '_ {
    log.lines()
        .enumerate()
        .filter(move |(_, line)| metric.matches(line))
        .map(move |(idx, line)| parse_value(metric, idx + 1, line))
}

fn parse_value(metric: Metric, line_no: usize, line: &str) -> Result<f64, ParseError> {
    let token = line
        .split_once(':')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .ok_or_else(|| ParseError::MissingValue {
            metric,
            line_no,
            line: line.to_string(),
        })?;

    token.parse::<f64>().map_err(|_| ParseError::Malformed {
        metric,
        line_no,
        token: token.to_string(),
    })
}

/// Mean of every sample of `metric` in `log`.
pub fn mean_of(log: &str, metric: Metric) -> Result<f64, ParseError> {
    let summary = samples(log, metric).collect::<Result<Summary, _>>()?;
    summary
        .mean()
        .map_err(|source| ParseError::NoSamples { metric, source })
}

/// Aggregates a whole cycle's load generator log into a [`BenchmarkResult`].
pub fn parse_results(log: &str) -> Result<BenchmarkResult, ParseError> {
    Ok(BenchmarkResult::new(
        mean_of(log, Metric::TotalDuration)?,
        mean_of(log, Metric::TimePerRequest)?,
        mean_of(log, Metric::RequestsPerSecond)?,
    ))
}
