/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Benchmark every configured variant and print the comparison
    Run {
        /// Path to the config file
        #[arg(short, long, default_value = "harness.toml")]
        config: PathBuf,

        /// Root of the codebase under test (overrides config and HARNESS_ROOT)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Directory logs are written to (overrides config and HARNESS_LOGS)
        #[arg(long)]
        logs: Option<PathBuf>,

        /// Load generator invocations per variant
        #[arg(short = 'n', long)]
        runs: Option<u32>,

        /// Only run the named variants, in the given order
        #[arg(long = "variant", value_delimiter = ',')]
        variants: Vec<String>,

        /// Also write the report as JSON to this path
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Write an example config file
    Init {
        #[arg(short, long, default_value = "harness.toml")]
        path: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
