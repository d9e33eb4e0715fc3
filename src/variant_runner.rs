/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::Variant,
    models::{LoadGeneratorConfig, VariantConfig},
    orchestrator::{remove_build_output, BenchmarkOrchestrator},
    process_control::LogSinks,
    report::{Report, VariantOutcome},
};
use anyhow::Context;
use chrono::Utc;
use colored::Colorize;
use nanoid::nanoid;
use std::{fs, path::PathBuf};
use tracing::info;

/// A fresh id for one invocation of the harness, used to keep each run's logs apart.
pub fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        nanoid!(5, &nanoid::alphabet::SAFE)
    )
}

/// Runs one orchestrator cycle per variant, strictly one after the other.
pub struct VariantRunner {
    orchestrator: BenchmarkOrchestrator,
    load: LoadGeneratorConfig,
    logs: PathBuf,
    run_id: String,
}

impl VariantRunner {
    pub fn new(
        orchestrator: BenchmarkOrchestrator,
        load: LoadGeneratorConfig,
        logs: PathBuf,
        run_id: &str,
    ) -> Self {
        Self {
            orchestrator,
            load,
            logs,
            run_id: run_id.to_string(),
        }
    }

    /// `<logs>/<run id>/<label>`
    pub fn log_dir(&self, label: &str) -> PathBuf {
        self.logs.join(&self.run_id).join(label)
    }

    fn variant_config(&self, variant: &Variant) -> anyhow::Result<VariantConfig> {
        let log_dir = self.log_dir(&variant.name);
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("Unable to create log directory {:?}", log_dir))?;

        Ok(VariantConfig::new(
            &variant.name,
            variant.flag,
            log_dir.join("results.log"),
            LogSinks::new(log_dir.join("output.log"), log_dir.join("errors.log")),
        ))
    }

    /// Benchmarks every variant in order. The first failing variant stops the run and no
    /// report is produced.
    pub async fn run(&self, variants: &[Variant]) -> anyhow::Result<Report> {
        let mut report = Report::new(&self.run_id);

        for (idx, variant) in variants.iter().enumerate() {
            println!(
                "\n{}",
                format!(" {} ({}/{}) ", variant.name, idx + 1, variants.len())
                    .reversed()
                    .green()
            );
            let build_dir = &self.orchestrator.target().build_dir;
            remove_build_output(build_dir)
                .with_context(|| format!("Unable to delete build output {:?}", build_dir))?;

            let variant_config = self.variant_config(variant)?;

            let started = Utc::now();
            let result = self
                .orchestrator
                .run_cycle(&variant_config, &self.load)
                .await
                .with_context(|| format!("Variant {} failed", variant.name))?;
            let finished = Utc::now();

            info!("[{}] {:?}", variant.name, result);
            report.push(VariantOutcome {
                label: variant.name.clone(),
                flag: variant.flag,
                result,
                log_dir: self.log_dir(&variant.name),
                started,
                finished,
            });
        }

        Ok(report)
    }
}
