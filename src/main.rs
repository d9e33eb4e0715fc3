/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use flagbench::{
    clap_args::{self, Commands},
    config::{Config, Variant},
    orchestrator::BenchmarkOrchestrator,
    variant_runner::{new_run_id, VariantRunner},
    SystemProcessRunner,
};
use std::{fs, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // read .env before anything looks at the environment
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    init_subscriber(get_subscriber(if args.verbose { "debug" } else { "info" }))?;

    match args.command {
        Commands::Init { path } => {
            Config::write_example_to_file(&path)
                .with_context(|| format!("Error creating config {:?}", path))?;
            println!("{}", format!("{} created!", path.display()).green());
            Ok(())
        }

        Commands::Run {
            config,
            root,
            logs,
            runs,
            variants,
            json,
        } => {
            let mut config = Config::load_or_default(&config)?;
            config.apply_env();
            if let Some(root) = root {
                config.target.root = root;
            }
            if let Some(logs) = logs {
                config.run.logs = logs;
            }
            if let Some(runs) = runs {
                config.load.max_runs = runs;
            }
            config.validate()?;

            let variants = select_variants(&config, &variants)?;
            run(config, variants, json).await
        }
    }
}

fn select_variants(config: &Config, names: &[String]) -> anyhow::Result<Vec<Variant>> {
    if names.is_empty() {
        return Ok(config.variants.clone());
    }
    names
        .iter()
        .map(|name| config.find_variant(name).cloned())
        .collect()
}

async fn run(config: Config, variants: Vec<Variant>, json: Option<PathBuf>) -> anyhow::Result<()> {
    let logs = config.run.logs.clone();
    fs::create_dir_all(&logs).with_context(|| {
        format!(
            "The logs root {:?} does not exist and could not be created",
            logs
        )
    })?;

    let cancel = CancellationToken::new();
    let ctrlc_token = cancel.clone();
    ctrlc::set_handler(move || {
        println!("\n{}", "> interrupted, stopping".yellow());
        ctrlc_token.cancel();
    })
    .context("Unable to install Ctrl-C handler")?;

    let orchestrator = BenchmarkOrchestrator::new(
        config.benchmark_target()?,
        Arc::new(SystemProcessRunner),
        Arc::new(config.service_client()?),
        config.poll_settings(),
        cancel,
    );

    let run_id = new_run_id();
    info!("Starting run {} with logs in {:?}", run_id, logs.join(&run_id));
    let runner = VariantRunner::new(orchestrator, config.load_generator(), logs, &run_id);
    let report = runner.run(&variants).await?;

    println!("\n{}", " Summary ".reversed().green());
    println!("{}", report.render());

    if let Some(path) = json {
        report
            .write_json(&path)
            .with_context(|| format!("Unable to write report to {:?}", path))?;
        println!("> report written to {}", path.display().to_string().green());
    }

    Ok(())
}

fn get_subscriber(env_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}
