//! Full runs against real processes: shell scripts stand in for the build tool, the
//! service binary and the load generator, and a small HTTP server plays the service's
//! health and shutdown endpoints.
#![cfg(unix)]

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use flagbench::{
    config::Config,
    orchestrator::{BenchmarkOrchestrator, Phase},
    properties,
    variant_runner::VariantRunner,
    BenchmarkResult, CycleError, SystemProcessRunner,
};
use std::{fs, net::SocketAddr, path::Path, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;

const BUILD_SCRIPT: &str = r#"
set -e
echo "compiling"
mkdir -p build/bin
cp service.sh build/bin/service
chmod +x build/bin/service
echo "compiled"
"#;

// runs from build/bin, the state directory lives in the target root
const SERVICE_SCRIPT: &str = r#"#!/bin/sh
echo $$ > ../../state/pid
touch ../../state/started
while [ ! -f ../../state/stop ]; do
    sleep 0.05
done
rm -f ../../state/started ../../state/stop
echo "stopped"
"#;

const LOAD_SCRIPT: &str = r#"
cat <<OUT
Benchmarking $5 (be patient).....done

Concurrency Level:      $4
Time taken for tests:   10.000 seconds
Complete requests:      $2
Requests per second:    100.00 [#/sec] (mean)
Time per request:       50.000 [ms] (mean)
Time per request:       5.000 [ms] (mean, across all concurrent requests)
OUT
"#;

// exits 1 from its second invocation on
const FAILING_LOAD_SCRIPT: &str = r#"
count=$(cat state/load-count 2>/dev/null || echo 0)
count=$((count + 1))
echo $count > state/load-count
if [ $count -ge 2 ]; then
    echo "apr_socket_recv: Connection reset by peer" >&2
    exit 1
fi
echo "Requests per second:    100.00 [#/sec] (mean)"
"#;

async fn health(State(state): State<Arc<PathBuf>>) -> StatusCode {
    if state.join("started").exists() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn shutdown(State(state): State<Arc<PathBuf>>) -> StatusCode {
    match fs::write(state.join("stop"), "") {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn serve_actuator(state: PathBuf) -> anyhow::Result<SocketAddr> {
    let app = Router::new()
        .route("/actuator/health", get(health))
        .route("/actuator/shutdown", post(shutdown))
        .with_state(Arc::new(state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    Ok(addr)
}

fn write_project(root: &Path, load_script: &str) -> anyhow::Result<()> {
    fs::create_dir_all(root.join("state"))?;
    fs::write(
        root.join("application.properties"),
        "# service settings\nserver.port=8080\nspring.threads.virtual.enabled=false\n",
    )?;
    fs::write(root.join("build.sh"), BUILD_SCRIPT)?;
    fs::write(root.join("service.sh"), SERVICE_SCRIPT)?;
    fs::write(root.join("loadgen.sh"), load_script)?;
    Ok(())
}

fn config(root: &Path, addr: SocketAddr, max_runs: u32) -> anyhow::Result<Config> {
    let config = Config::try_from_str(&format!(
        r#"
[target]
root = "{root}"
properties = "application.properties"
build_command = "sh build.sh"
build_dir = "build"
binary = "build/bin/service"
build_timeout_secs = 30

[service]
health_url = "http://{addr}/actuator/health"
shutdown_url = "http://{addr}/actuator/shutdown"
poll_interval_ms = 50
request_timeout_ms = 500
ready_deadline_secs = 10
terminated_deadline_secs = 10

[load]
command = "sh loadgen.sh -n {{requests}} -c {{concurrency}} {{url}}"
url = "http://{addr}/customers"
requests = 50
concurrency = 5
max_runs = {max_runs}
timeout_secs = 30

[run]
logs = "{root}/logs"

[[variant]]
name = "traditional"
flag = false

[[variant]]
name = "loom"
flag = true
"#,
        root = root.display(),
    ))?;
    config.validate()?;
    Ok(config)
}

fn orchestrator(config: &Config) -> anyhow::Result<BenchmarkOrchestrator> {
    Ok(BenchmarkOrchestrator::new(
        config.benchmark_target()?,
        Arc::new(SystemProcessRunner),
        Arc::new(config.service_client()?),
        config.poll_settings(),
        CancellationToken::new(),
    ))
}

fn process_exists(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread")]
async fn benchmarks_both_variants_against_real_processes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_project(root, LOAD_SCRIPT)?;
    let addr = serve_actuator(root.join("state")).await?;
    let config = config(root, addr, 2)?;

    let runner = VariantRunner::new(
        orchestrator(&config)?,
        config.load_generator(),
        config.run.logs.clone(),
        "e2e",
    );
    let report = runner.run(&config.variants).await?;

    let expected = BenchmarkResult::new(10.0, 5.0, 100.0);
    assert_eq!(report.get("traditional"), Some(&expected));
    assert_eq!(report.get("loom"), Some(&expected));
    assert!(report.variants[0].finished <= report.variants[1].started);
    assert_eq!(report.throughput_delta("loom"), Some(0.0));

    // the service shut itself down after each cycle
    assert!(!root.join("state/started").exists());
    let pid = fs::read_to_string(root.join("state/pid"))?;
    assert!(!process_exists(pid.trim()));

    let properties = fs::read_to_string(root.join("application.properties"))?;
    assert!(properties.starts_with("# service settings\nserver.port=8080\n"));
    assert_eq!(
        properties::get_property(&properties, "spring.threads.virtual.enabled"),
        Some("true")
    );

    let logs = root.join("logs/e2e");
    for label in ["traditional", "loom"] {
        let results = fs::read_to_string(logs.join(label).join("results.log"))?;
        assert_eq!(results.matches("Time taken for tests").count(), 2);
        assert!(results.contains(&format!("Benchmarking http://{}/customers", addr)));
        assert!(results.contains("Complete requests:      50"));

        let output = fs::read_to_string(logs.join(label).join("output.log"))?;
        assert!(output.contains("compiled"));
        assert!(output.contains("stopped"));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_load_generator_kills_the_service() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_project(root, FAILING_LOAD_SCRIPT)?;
    let addr = serve_actuator(root.join("state")).await?;
    let config = config(root, addr, 5)?;

    let runner = VariantRunner::new(
        orchestrator(&config)?,
        config.load_generator(),
        config.run.logs.clone(),
        "e2e",
    );
    let err = runner.run(&config.variants).await.unwrap_err();

    let cycle_err = err
        .downcast_ref::<CycleError>()
        .expect("cycle error should be preserved");
    assert_eq!(cycle_err.phase, Phase::Benchmarking);

    // stopped at the failing invocation, and never got to the second variant
    assert_eq!(fs::read_to_string(root.join("state/load-count"))?.trim(), "2");
    assert!(!root.join("logs/e2e/loom").exists());
    assert!(!root.join("state/stop").exists());

    let pid = fs::read_to_string(root.join("state/pid"))?;
    assert!(!process_exists(pid.trim()));

    let results = fs::read_to_string(root.join("logs/e2e/traditional/results.log"))?;
    assert!(results.contains("Connection reset by peer"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn relative_target_root_launches_the_built_binary() -> anyhow::Result<()> {
    // a directory relative to the test's working directory, like the default root "."
    let dir = tempfile::Builder::new()
        .prefix(".flagbench-relative-")
        .tempdir_in(".")?;
    let root = &Path::new(".").join(dir.path().file_name().unwrap());
    assert!(root.is_relative());

    write_project(root, LOAD_SCRIPT)?;
    let addr = serve_actuator(root.join("state")).await?;
    let mut config = config(root, addr, 1)?;
    config.variants.truncate(1);

    let runner = VariantRunner::new(
        orchestrator(&config)?,
        config.load_generator(),
        config.run.logs.clone(),
        "relative",
    );
    let report = runner.run(&config.variants).await?;

    assert_eq!(
        report.get("traditional"),
        Some(&BenchmarkResult::new(10.0, 5.0, 100.0))
    );
    let output = fs::read_to_string(root.join("logs/relative/traditional/output.log"))?;
    assert!(output.contains("stopped"));
    Ok(())
}
