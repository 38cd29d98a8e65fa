// src/bin/resilience_cli.rs

use dotenv::dotenv;
use prettytable::{row, Table};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::time;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shop_resilience::config::ResilienceConfig;
use shop_resilience::error::ResilienceError;
use shop_resilience::resilience::{CallOutcome, FallbackHandler, FallbackStrategy, ResilientClient};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "resilience_cli",
    about = "Exercise circuit breakers, retries and fallbacks against a simulated dependency"
)]
struct Opt {
    /// JSON config file; RESILIENCE_* environment variables apply on top
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Drive a flaky dependency through the resilience pipeline
    Simulate {
        /// Dependency name used for the breaker and fallback records
        #[structopt(short, long, default_value = "notification")]
        dependency: String,

        /// Fallback strategy for failed calls
        #[structopt(short, long, possible_values = &["queue", "local-storage", "log-only", "degraded"], default_value = "queue")]
        strategy: FallbackStrategy,

        /// Number of requests to send
        #[structopt(short = "n", long, default_value = "20")]
        num_requests: usize,

        /// Requests at the start that always fail
        #[structopt(long, default_value = "8")]
        outage: usize,

        /// Failure probability once the outage is over
        #[structopt(long, default_value = "0.1")]
        failure_rate: f64,

        /// Simulated dependency latency in milliseconds
        #[structopt(long, default_value = "5")]
        latency_ms: u64,

        /// Time between requests in milliseconds
        #[structopt(short = "t", long, default_value = "250")]
        request_interval_ms: u64,
    },
    /// Empty the fallback queue and print what was in it
    Drain {
        /// Queue directory, overrides the configured one
        #[structopt(long, parse(from_os_str))]
        queue_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let opt = Opt::from_args();

    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "resilience_cli={},shop_resilience={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &opt.config {
        Some(path) => ResilienceConfig::from_file(path)?,
        None => ResilienceConfig::from_env(),
    };

    match opt.cmd {
        Command::Simulate {
            dependency,
            strategy,
            num_requests,
            outage,
            failure_rate,
            latency_ms,
            request_interval_ms,
        } => {
            let simulation = Simulation {
                dependency,
                strategy,
                num_requests,
                outage,
                failure_rate: failure_rate.clamp(0.0, 1.0),
                latency: Duration::from_millis(latency_ms),
                interval: Duration::from_millis(request_interval_ms),
            };
            simulate(config, simulation).await
        }
        Command::Drain { queue_dir } => {
            let mut fallback = config.fallback;
            if let Some(dir) = queue_dir {
                fallback.queue_dir = dir;
            }
            drain(FallbackHandler::new(fallback)).await
        }
    }
}

struct Simulation {
    dependency: String,
    strategy: FallbackStrategy,
    num_requests: usize,
    outage: usize,
    failure_rate: f64,
    latency: Duration,
    interval: Duration,
}

async fn simulate(
    config: ResilienceConfig,
    simulation: Simulation,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        dependency = %simulation.dependency,
        strategy = simulation.strategy.as_str(),
        requests = simulation.num_requests,
        "Starting simulation"
    );

    let client = ResilientClient::try_new(config)?;
    let invocations = AtomicUsize::new(0);
    let start = Instant::now();

    let mut requests = Table::new();
    requests.add_row(row!["Request", "Outcome", "Dependency calls", "Breaker"]);

    let mut completed = 0;
    let mut fallbacks = 0;
    let mut errors = 0;

    for request in 1..=simulation.num_requests {
        let payload = json!({ "request": request, "dependency": simulation.dependency });

        let outcome = client
            .call(&simulation.dependency, payload, simulation.strategy, || async {
                let call = invocations.fetch_add(1, Ordering::SeqCst) + 1;
                time::sleep(simulation.latency).await;
                if request <= simulation.outage || rand::random::<f64>() < simulation.failure_rate {
                    Err(ResilienceError::Connection(format!("simulated outage (call {})", call)))
                } else {
                    Ok(call)
                }
            })
            .await;

        let label = match outcome {
            Ok(CallOutcome::Completed(call)) => {
                completed += 1;
                format!("completed (call {})", call)
            }
            Ok(CallOutcome::Fallback(fallback)) => {
                fallbacks += 1;
                format!("fallback: {}", fallback.message)
            }
            Err(err) => {
                errors += 1;
                format!("error: {}", err)
            }
        };

        let state = client
            .registry()
            .get_state(&simulation.dependency)
            .await
            .map(|s| s.state.as_str())
            .unwrap_or("-");
        requests.add_row(row![request, label, invocations.load(Ordering::SeqCst), state]);

        time::sleep(simulation.interval).await;
    }

    println!("\nSimulation Results:");
    println!("-------------------");
    requests.printstd();
    println!("Completed: {}", completed);
    println!("Fallbacks: {}", fallbacks);
    println!("Errors: {}", errors);
    println!("Dependency calls: {}", invocations.load(Ordering::SeqCst));
    println!("Time elapsed: {:?}", start.elapsed());

    let snapshot = client.snapshot().await;

    println!("\nHealth: {}", snapshot.status.as_str());
    let mut metrics = Table::new();
    metrics.add_row(row![
        "Dependency",
        "State",
        "Window ok/fail",
        "Attempts",
        "Success rate",
        "Fallbacks"
    ]);
    for dep in &snapshot.dependencies {
        let (state, window) = match &dep.breaker {
            Some(b) => (
                b.state.as_str(),
                format!("{}/{}", b.successes, b.failures),
            ),
            None => ("-", "-".to_string()),
        };
        let rate = dep
            .retry_success_rate
            .map(|r| format!("{:.1}%", r * 100.0))
            .unwrap_or_else(|| "n/a".to_string());
        metrics.add_row(row![
            dep.dependency,
            state,
            window,
            dep.retries.total_attempts,
            rate,
            dep.fallbacks.total_fallbacks
        ]);
    }
    metrics.printstd();

    if !snapshot.recent_transitions.is_empty() {
        let mut transitions = Table::new();
        transitions.add_row(row!["At", "Dependency", "From", "To", "Reason"]);
        for t in &snapshot.recent_transitions {
            transitions.add_row(row![
                t.at.format("%H:%M:%S%.3f"),
                t.dependency,
                t.from.as_str(),
                t.to.as_str(),
                t.reason
            ]);
        }
        println!("\nBreaker transitions:");
        transitions.printstd();
    }

    Ok(())
}

async fn drain(handler: FallbackHandler) -> Result<(), Box<dyn std::error::Error>> {
    let records = handler.drain_queue().await?;

    println!("\nDrained {} record(s) from {}", records.len(), handler.queue_dir().display());
    if records.is_empty() {
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row!["Id", "Type", "Timestamp", "Data"]);
    for queued in &records {
        table.add_row(row![
            queued.id,
            queued.record.kind,
            queued.record.timestamp,
            queued.record.data
        ]);
    }
    table.printstd();

    Ok(())
}
