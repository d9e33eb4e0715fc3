/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::models::BenchmarkResult;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

#[derive(Debug, Clone, Serialize)]
pub struct VariantOutcome {
    pub label: String,
    pub flag: bool,
    pub result: BenchmarkResult,
    pub log_dir: PathBuf,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

/// Results of every variant of one run, in the order they ran.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: String,
    pub variants: Vec<VariantOutcome>,
}

impl Report {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            variants: vec![],
        }
    }

    pub fn push(&mut self, outcome: VariantOutcome) {
        self.variants.push(outcome);
    }

    pub fn get(&self, label: &str) -> Option<&BenchmarkResult> {
        self.variants
            .iter()
            .find(|outcome| outcome.label == label)
            .map(|outcome| &outcome.result)
    }

    /// Variant label to result.
    pub fn results(&self) -> BTreeMap<&str, BenchmarkResult> {
        self.variants
            .iter()
            .map(|outcome| (outcome.label.as_str(), outcome.result))
            .collect()
    }

    /// Throughput change of `label` relative to the first variant, in percent.
    pub fn throughput_delta(&self, label: &str) -> Option<f64> {
        let baseline = self.variants.first()?.result.requests_per_second;
        let result = self.get(label)?;
        if baseline == 0.0 {
            return None;
        }
        Some((result.requests_per_second - baseline) / baseline * 100.0)
    }

    pub fn render(&self) -> String {
        let mut rows = rows![row![
            TableCell::builder("Variant".bold()).build(),
            TableCell::builder("Flag".bold()).build(),
            TableCell::builder("Duration (s)".bold()).build(),
            TableCell::builder("Time per request (ms)".bold()).build(),
            TableCell::builder("Requests/s".bold()).build(),
            TableCell::builder("Δ Requests/s".bold()).build()
        ]];

        for (idx, outcome) in self.variants.iter().enumerate() {
            let delta = match (idx, self.throughput_delta(&outcome.label)) {
                (0, _) | (_, None) => "--".bright_black(),
                (_, Some(delta)) if delta >= 0.0 => format!("↑ {:.1}%", delta).green(),
                (_, Some(delta)) => format!("↓ {:.1}%", delta.abs()).red(),
            };

            rows.push(row![
                TableCell::new(outcome.label.green()),
                TableCell::new(outcome.flag),
                TableCell::new(format!("{:.3}", outcome.result.total_duration)),
                TableCell::new(format!("{:.3}", outcome.result.time_per_request)),
                TableCell::new(format!("{:.2}", outcome.result.requests_per_second)),
                TableCell::new(delta)
            ]);
        }

        Table::builder()
            .rows(rows)
            .style(TableStyle::rounded())
            .build()
            .render()
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
