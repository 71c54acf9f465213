//! Simulate command - drive a synthetic layout workload through an engine.
//!
//! Every round measures the same set of elements. Each element offers three
//! strategies (accelerated, parallel, baseline) with decreasing speed; the
//! first available one runs. Failures are injected at a configurable rate
//! and spread across error kinds so every recovery path gets exercised.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use console::style;
use steadfast::dispatch::{DispatchContext, ExecutionStrategy, MaintenanceDaemon, RunOptions};
use steadfast::random::{RandomSource, SeededRandom};
use steadfast::resilience::{FnStrategy, RecoveryAction};
use steadfast::throttle::{Backend, CapabilityProvider, CapabilitySnapshot, SystemCapabilities};
use steadfast::{DispatchEngine, EngineConfig, ErrorKind, OperationError, TelemetrySnapshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CliError;

/// Arguments for the simulate command.
#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Number of distinct elements measured each round
    #[arg(long, default_value_t = 200)]
    pub items: usize,

    /// Number of rounds over the element set
    #[arg(long, default_value_t = 3)]
    pub rounds: usize,

    /// Probability that an attempt fails (0.0 - 1.0)
    #[arg(long, default_value_t = 0.1)]
    pub failure_rate: f64,

    /// Baseline strategy latency in milliseconds
    #[arg(long, default_value_t = 8)]
    pub latency_ms: u64,

    /// Concurrent runs in flight
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Seed for throttle draws and failure injection
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Treat the accelerated backend as unavailable
    #[arg(long)]
    pub no_accelerated: bool,

    /// Share in-flight executions between concurrent runs of one element
    #[arg(long)]
    pub coalesce: bool,

    /// Print the telemetry snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

/// Synthetic result of measuring one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub width: u32,
    pub height: u32,
}

impl Measurement {
    /// Deterministic size derived from the element key.
    fn for_key(key: &str) -> Self {
        let hash = key
            .bytes()
            .fold(0x811c_9dc5_u32, |acc, b| (acc ^ b as u32).wrapping_mul(0x0100_0193));
        Self {
            width: 40 + hash % 600,
            height: 20 + (hash >> 16) % 400,
        }
    }
}

/// Shared failure injector.
struct Workload {
    failure_rate: f64,
    latency: Duration,
    random: SeededRandom,
}

impl Workload {
    /// Pick an error kind for an injected failure, or `None` to succeed.
    fn draw_failure(&self) -> Option<OperationError> {
        if self.random.next_f64() >= self.failure_rate {
            return None;
        }
        let roll = self.random.next_f64();
        Some(if roll < 0.7 {
            OperationError::transient("layout read interrupted")
        } else if roll < 0.9 {
            OperationError::resource_exhaustion("measurement buffers exhausted")
        } else {
            OperationError::structural("element detached during measurement")
        })
    }

    fn strategy(
        self: &Arc<Self>,
        backend: Backend,
        capabilities: &CapabilitySnapshot,
    ) -> ExecutionStrategy<Measurement> {
        let divisor = match backend {
            Backend::Accelerated => 4,
            Backend::Parallel => 2,
            Backend::Baseline => 1,
        };
        let latency = self.latency / divisor;
        let workload = Arc::clone(self);

        ExecutionStrategy::for_backend(backend, capabilities, move |context: DispatchContext| {
            let workload = Arc::clone(&workload);
            async move {
                tokio::time::sleep(latency).await;
                match workload.draw_failure() {
                    Some(error) => Err(error),
                    None => Ok(Measurement::for_key(context.key.as_str())),
                }
            }
        })
    }
}

/// Final tallies of a simulation.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub outcomes: BTreeMap<&'static str, u64>,
    pub snapshot: TelemetrySnapshot,
    pub interrupted: bool,
    /// The engine was shut down once the workload drained.
    pub closed: bool,
}

/// Run the simulate command.
pub fn run(args: SimulateArgs, config: EngineConfig) -> Result<(), CliError> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        return Err(CliError::Config(format!(
            "--failure-rate must be within [0, 1], got {}",
            args.failure_rate
        )));
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("Received interrupt, cancelling in-flight work...");
        handler_token.cancel();
    })
    .map_err(|e| CliError::Signal(e.to_string()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let capabilities = SystemCapabilities::new().with_accelerated(!args.no_accelerated);
    let report = runtime.block_on(simulate(&args, config, Arc::new(capabilities), cancel))?;
    print_report(&args, &report)
}

/// Drive the workload and collect the report.
pub async fn simulate(
    args: &SimulateArgs,
    mut config: EngineConfig,
    capabilities: Arc<dyn CapabilityProvider>,
    cancel: CancellationToken,
) -> Result<SimulationReport, CliError> {
    if args.coalesce {
        config.dispatch.coalesce_in_flight = true;
    }

    let engine: Arc<DispatchEngine<Measurement>> = Arc::new(
        DispatchEngine::builder(config)
            .with_capabilities(capabilities)
            .with_random(Arc::new(SeededRandom::new(args.seed)))
            .with_strategy(Arc::new(FnStrategy::new(
                "refresh_inputs",
                ErrorKind::Transient,
                |_, context| {
                    Ok(RecoveryAction::with_context(
                        context
                            .clone()
                            .with_hint("refreshed_at_attempt", context.attempt.to_string()),
                    ))
                },
            )))
            .build()?,
    );

    let workload = Arc::new(Workload {
        failure_rate: args.failure_rate,
        latency: Duration::from_millis(args.latency_ms),
        random: SeededRandom::new(args.seed.wrapping_add(1)),
    });
    let snapshot = engine.capabilities();
    let strategies = vec![
        workload.strategy(Backend::Accelerated, &snapshot),
        workload.strategy(Backend::Parallel, &snapshot),
        workload.strategy(Backend::Baseline, &snapshot),
    ];

    info!(
        items = args.items,
        rounds = args.rounds,
        preferred_backend = %snapshot.preferred_backend(),
        "Starting simulation"
    );

    // Stops on interrupt, or when the engine closes.
    let maintenance = tokio::spawn(
        MaintenanceDaemon::new(engine.clone(), Duration::from_millis(250)).run(cancel.clone()),
    );

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    let concurrency = args.concurrency.max(1);

    'rounds: for round in 0..args.rounds {
        let mut tasks = JoinSet::new();
        for index in 0..args.items {
            if cancel.is_cancelled() {
                break 'rounds;
            }
            while tasks.len() >= concurrency {
                if let Some(joined) = tasks.join_next().await {
                    tally(&mut outcomes, joined)?;
                }
            }

            let engine = engine.clone();
            let strategies = strategies.clone();
            let options = RunOptions::default().with_cancellation(cancel.clone());
            tasks.spawn(async move {
                engine
                    .run(format!("element-{}", index), strategies, options)
                    .await
                    .map(|outcome| outcome.label())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            tally(&mut outcomes, joined)?;
        }
        info!(round = round + 1, "Round complete");
    }

    let snapshot = engine.snapshot();
    engine.close();
    let maintenance_passes = maintenance
        .await
        .map_err(|e| CliError::Config(format!("maintenance task failed: {}", e)))?;
    info!(maintenance_passes, "Engine closed");

    Ok(SimulationReport {
        outcomes,
        snapshot,
        interrupted: cancel.is_cancelled(),
        closed: engine.is_closed(),
    })
}

fn tally(
    outcomes: &mut BTreeMap<&'static str, u64>,
    joined: Result<Result<&'static str, steadfast::DispatchError>, tokio::task::JoinError>,
) -> Result<(), CliError> {
    match joined {
        Ok(Ok(label)) => {
            *outcomes.entry(label).or_insert(0) += 1;
            Ok(())
        }
        Ok(Err(e)) => Err(CliError::Dispatch(e)),
        Err(e) => Err(CliError::Config(format!("simulation task failed: {}", e))),
    }
}

fn print_report(args: &SimulateArgs, report: &SimulationReport) -> Result<(), CliError> {
    if args.json {
        println!("{}", report.snapshot.to_json()?);
        return Ok(());
    }

    println!("{}", style("Outcomes").bold().underlined());
    for (label, count) in &report.outcomes {
        println!("  {:<14} {}", label, count);
    }
    println!();
    println!("{}", style("Telemetry").bold().underlined());
    println!("{}", report.snapshot);
    if report.interrupted {
        println!();
        println!("{}", style("Interrupted before completion").yellow());
    }
    Ok(())
}
