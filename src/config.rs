/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    health::HttpServiceClient,
    models::LoadGeneratorConfig,
    orchestrator::{BenchmarkTarget, PollSettings},
    process_control::CommandSpec,
};
use anyhow::Context;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/harness.toml");

pub const ROOT_ENV_VAR: &str = "HARNESS_ROOT";
pub const LOGS_ENV_VAR: &str = "HARNESS_LOGS";

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub target: Target,
    pub service: Service,
    pub load: Load,
    pub run: Run,
    #[serde(rename(serialize = "variant", deserialize = "variant"))]
    pub variants: Vec<Variant>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: Target::default(),
            service: Service::default(),
            load: Load::default(),
            run: Run::default(),
            variants: vec![
                Variant {
                    name: "traditional".to_string(),
                    flag: false,
                },
                Variant {
                    name: "loom".to_string(),
                    flag: true,
                },
            ],
        }
    }
}

impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config file {:?}", path))?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    /// Loads the config at `path`, falling back to the defaults when no file exists there.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Config> {
        if path.exists() {
            Config::try_from_path(path)
        } else {
            tracing::info!("No config found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Environment variables (including those from a `.env` file) override the file.
    pub fn apply_env(&mut self) {
        if let Ok(root) = dotenvy::var(ROOT_ENV_VAR) {
            self.target.root = PathBuf::from(root);
        }
        if let Ok(logs) = dotenvy::var(LOGS_ENV_VAR) {
            self.run.logs = PathBuf::from(logs);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.target.root.is_dir(),
            "The target root {:?} does not exist",
            self.target.root
        );
        anyhow::ensure!(!self.variants.is_empty(), "No variants configured");
        anyhow::ensure!(self.load.max_runs >= 1, "load.max_runs must be at least 1");
        anyhow::ensure!(
            self.service.poll_interval_ms > 0,
            "service.poll_interval_ms must be greater than 0"
        );

        anyhow::ensure!(
            self.variants.iter().all(|v| !v.name.trim().is_empty()),
            "Variant names cannot be blank"
        );
        if let Some(variant) = self.variants.iter().find(|v| !is_plain_name(&v.name)) {
            anyhow::bail!(
                "Variant name {:?} must not contain path separators or be '.' or '..'",
                variant.name
            );
        }
        let duplicates = self
            .variants
            .iter()
            .map(|v| v.name.as_str())
            .duplicates()
            .collect_vec();
        anyhow::ensure!(
            duplicates.is_empty(),
            "Variant names must be unique, duplicated: {}",
            duplicates.join(", ")
        );

        Ok(())
    }

    pub fn find_variant(&self, name: &str) -> anyhow::Result<&Variant> {
        self.variants
            .iter()
            .find(|variant| variant.name == name)
            .context(format!("Unable to find variant with name {}", name))
    }

    pub fn benchmark_target(&self) -> anyhow::Result<BenchmarkTarget> {
        // every command and path below must keep resolving whatever directory it runs in
        let root = &std::path::absolute(&self.target.root)
            .with_context(|| format!("Unable to resolve target root {:?}", self.target.root))?;
        let build = CommandSpec::parse(&self.target.build_command, root)
            .context("Invalid target.build_command")?
            .timeout(self.target.build_timeout_secs.map(Duration::from_secs));

        Ok(BenchmarkTarget {
            root: root.clone(),
            properties: root.join(&self.target.properties),
            flag_key: self.target.flag_key.clone(),
            build,
            build_dir: root.join(&self.target.build_dir),
            binary: root.join(&self.target.binary),
            load_command: self.load.command.clone(),
            load_timeout: self.load.timeout_secs.map(Duration::from_secs),
            max_runs: self.load.max_runs,
        })
    }

    pub fn load_generator(&self) -> LoadGeneratorConfig {
        LoadGeneratorConfig {
            requests: self.load.requests,
            concurrency: self.load.concurrency,
            url: self.load.url.clone(),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        let deadline = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        PollSettings {
            interval: Duration::from_millis(self.service.poll_interval_ms),
            ready_deadline: deadline(self.service.ready_deadline_secs),
            terminated_deadline: deadline(self.service.terminated_deadline_secs),
        }
    }

    pub fn service_client(&self) -> anyhow::Result<HttpServiceClient> {
        HttpServiceClient::new(
            &self.service.health_url,
            &self.service.shutdown_url,
            Duration::from_millis(self.service.request_timeout_ms),
        )
        .context("Unable to create HTTP client")
    }
}

/// Variant names become directory names under the run's log directory.
fn is_plain_name(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// The codebase under test and how to build it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Target {
    pub root: PathBuf,
    pub properties: PathBuf,
    pub flag_key: String,
    pub build_command: String,
    pub build_dir: PathBuf,
    pub binary: PathBuf,
    pub build_timeout_secs: Option<u64>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            properties: PathBuf::from("src/main/resources/application.properties"),
            flag_key: "spring.threads.virtual.enabled".to_string(),
            build_command: "./gradlew nativeCompile".to_string(),
            build_dir: PathBuf::from("build"),
            binary: PathBuf::from("build/native/nativeCompile/service"),
            build_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Service {
    pub health_url: String,
    pub shutdown_url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub ready_deadline_secs: u64,
    pub terminated_deadline_secs: u64,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            health_url: "http://localhost:8080/actuator/health".to_string(),
            shutdown_url: "http://localhost:8080/actuator/shutdown".to_string(),
            poll_interval_ms: 500,
            request_timeout_ms: 2000,
            ready_deadline_secs: 600,
            terminated_deadline_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Load {
    /// Load generator command line. `{requests}`, `{concurrency}` and `{url}` are
    /// substituted before it is split into words.
    pub command: String,
    pub url: String,
    pub requests: u32,
    pub concurrency: u32,
    pub max_runs: u32,
    pub timeout_secs: Option<u64>,
}

impl Default for Load {
    fn default() -> Self {
        Self {
            command: "ab -n {requests} -c {concurrency} {url}".to_string(),
            url: "http://localhost:8080/customers".to_string(),
            requests: 1000,
            concurrency: 10,
            max_runs: 10,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Run {
    pub logs: PathBuf,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            logs: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Variant {
    pub name: String,
    pub flag: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_matches_defaults() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(EXAMPLE_CONFIG)?;
        assert_eq!(cfg, Config::default());
        Ok(())
    }

    #[test]
    fn empty_config_is_valid_toml() -> anyhow::Result<()> {
        let cfg = Config::try_from_str("")?;
        assert_eq!(cfg, Config::default());
        Ok(())
    }

    #[test]
    fn can_load_config_file() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/harness.success.toml"))?;
        assert_eq!(cfg.load.max_runs, 2);
        assert_eq!(cfg.service.poll_interval_ms, 100);
        // unspecified values keep their defaults
        assert_eq!(cfg.target.flag_key, "spring.threads.virtual.enabled");
        Ok(())
    }

    #[test]
    fn can_find_variant_by_name() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/harness.success.toml"))?;
        let variant = cfg.find_variant("B")?;
        assert!(variant.flag);

        assert!(cfg.find_variant("nope").is_err());
        Ok(())
    }

    #[test]
    fn duplicate_variant_names_are_rejected() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/harness.duplicate_variants.toml"))?;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicated: A"));
        Ok(())
    }

    #[test]
    fn missing_root_is_rejected() {
        let mut cfg = Config::default();
        cfg.target.root = PathBuf::from("/definitely/not/a/codebase");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn variant_names_cannot_escape_the_log_directory() {
        for name in ["../x", "a/b", "a\\b", "..", "."] {
            let mut cfg = Config::default();
            cfg.variants[0].name = name.to_string();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("path separators"), "{}", name);
        }

        let mut cfg = Config::default();
        cfg.variants[0].name = "loom..v2".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_runs_is_rejected() {
        let mut cfg = Config::default();
        cfg.load.max_runs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn paths_are_resolved_against_the_root() -> anyhow::Result<()> {
        let mut cfg = Config::default();
        cfg.target.root = PathBuf::from("/srv/service");
        let target = cfg.benchmark_target()?;

        assert_eq!(
            target.properties,
            PathBuf::from("/srv/service/src/main/resources/application.properties")
        );
        assert_eq!(
            target.binary,
            PathBuf::from("/srv/service/build/native/nativeCompile/service")
        );
        assert_eq!(target.build.program, PathBuf::from("/srv/service/./gradlew"));
        assert_eq!(target.build.args, vec!["nativeCompile"]);
        Ok(())
    }

    #[test]
    fn relative_root_is_made_absolute() -> anyhow::Result<()> {
        let cfg = Config::default();
        let target = cfg.benchmark_target()?;
        let cwd = std::env::current_dir()?;

        assert!(target.root.is_absolute());
        assert!(target.root.starts_with(&cwd));
        assert!(target.binary.is_absolute());
        assert!(target.binary.ends_with("build/native/nativeCompile/service"));
        assert!(target.build.working_dir.is_absolute());
        assert!(target.build.program.is_absolute());
        Ok(())
    }

    #[test]
    fn zero_deadline_waits_forever() {
        let mut cfg = Config::default();
        cfg.service.ready_deadline_secs = 0;
        let settings = cfg.poll_settings();

        assert_eq!(settings.interval, Duration::from_millis(500));
        assert_eq!(settings.ready_deadline, None);
        assert_eq!(settings.terminated_deadline, Some(Duration::from_secs(120)));
    }

    #[test]
    fn writes_example_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("harness.toml");

        Config::write_example_to_file(&path)?;
        assert_eq!(Config::try_from_path(&path)?, Config::default());

        // never overwrites an existing config
        assert!(Config::write_example_to_file(&path).is_err());
        Ok(())
    }
}
