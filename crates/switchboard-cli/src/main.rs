//! Switchboard CLI - adaptive multi-backend routing

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use switchboard_core::classify::BackendError;
use switchboard_core::config::{Config, StoreBackend};
use switchboard_core::observability::EventRecorder;
use switchboard_core::routing::{
    BackendDescriptor, BanditStore, ProviderClass, RouteRequest, RoutingCoordinator,
    RoutingPreference, SqliteBanditStore, open_store,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(author, version, about = "Adaptive multi-backend request routing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Route simulated traffic through three demo backends
    Simulate(SimulateArgs),

    /// Show bandit arms persisted in a SQLite store
    Stats {
        /// Path to the SQLite database
        #[arg(long)]
        db: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of requests to route
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Seed for ranking and simulated failures
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Bandit store (memory or sqlite); defaults to the configured store
    #[arg(long)]
    store: Option<StoreBackend>,

    /// SQLite database path for the sqlite store
    #[arg(long)]
    db: Option<PathBuf>,

    /// Failure probability for a backend, as id=p (repeatable)
    #[arg(long = "fail-rate", value_parser = parse_fail_rate)]
    fail_rates: Vec<(String, f64)>,

    /// Routing preference (balanced, fast, quality, cost)
    #[arg(long)]
    preference: Option<RoutingPreference>,

    /// Number of distinct simulated users
    #[arg(long, default_value_t = 8)]
    users: usize,

    /// Include per-event counts from the observability bus
    #[arg(long)]
    events: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

/// Demo backends: id, weight, cost, latency hint, class
const SIMULATED_BACKENDS: &[(&str, f64, f64, f64, ProviderClass)] = &[
    ("openai", 1.0, 0.02, 120.0, ProviderClass::FastPricey),
    ("anthropic", 1.0, 0.01, 180.0, ProviderClass::Default),
    ("local", 0.8, 0.001, 300.0, ProviderClass::SlowCheap),
];

fn parse_fail_rate(value: &str) -> Result<(String, f64), String> {
    let (id, rate) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=probability, got '{}'", value))?;
    let rate: f64 = rate
        .trim()
        .parse()
        .map_err(|_| format!("invalid probability '{}'", rate))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("probability must be between 0 and 1, got {}", rate));
    }
    Ok((id.trim().to_string(), rate))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let directive = if cli.quiet { "switchboard=warn" } else { "switchboard=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    match cli.command {
        Commands::Simulate(args) => cmd_simulate(args, cli.format, cli.quiet).await,
        Commands::Stats { db } => cmd_stats(&db, cli.format, cli.quiet).await,
        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

fn simulated_backends(
    fail_rates: &HashMap<String, f64>,
    seed: u64,
) -> Vec<BackendDescriptor> {
    let rng = Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed.wrapping_add(1))));

    SIMULATED_BACKENDS
        .iter()
        .map(|&(id, weight, cost, latency_ms, class)| {
            let fail_rate = fail_rates.get(id).copied().unwrap_or(0.0);
            let rng = rng.clone();
            let name = id.to_string();

            BackendDescriptor::new(id)
                .with_weight(weight)
                .with_cost(cost)
                .with_latency_ms(latency_ms)
                .with_class(class)
                .with_fn(move |args| {
                    let failed = {
                        let mut rng = rng.lock().unwrap_or_else(|e| e.into_inner());
                        rng.r#gen::<f64>() < fail_rate
                    };
                    let name = name.clone();
                    async move {
                        if failed {
                            Err(BackendError::status(503, format!("{} simulated outage", name)))
                        } else {
                            Ok(json!({ "backend": name, "requestId": args["requestId"] }))
                        }
                    }
                })
        })
        .collect()
}

async fn cmd_simulate(args: SimulateArgs, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(preference) = args.preference {
        config.routing.preference = preference;
    }
    if let Some(backend) = args.store {
        config.store.backend = backend;
    }
    if let Some(db) = &args.db {
        config.store.sqlite_path = Some(db.clone());
    }
    if args.users == 0 {
        return Err(anyhow!("--users must be at least 1"));
    }

    let fail_rates: HashMap<String, f64> = args.fail_rates.into_iter().collect();
    for id in fail_rates.keys() {
        if !SIMULATED_BACKENDS.iter().any(|(known, ..)| known == id) {
            return Err(anyhow!(
                "Unknown backend '{}'. Simulated backends: openai, anthropic, local",
                id
            ));
        }
    }

    let store = open_store(&config.store)
        .await
        .context("Failed to open bandit store")?;
    let preference = config.routing.preference;
    let router = RoutingCoordinator::builder()
        .config(config)
        .seed(args.seed)
        .store(store)
        .build();
    let recorder = args.events.then(|| EventRecorder::attach(router.bus()));

    let hydrated = router.hydrate_from_store().await?;
    if hydrated > 0 {
        info!(arms = hydrated, "Resumed from stored bandit state");
    }

    let backends = simulated_backends(&fail_rates, args.seed);
    let mut served: BTreeMap<String, u64> = BTreeMap::new();
    let mut errors: BTreeMap<String, u64> = BTreeMap::new();
    let mut sticky_hits = 0u64;
    let mut fallbacks = 0u64;

    for i in 0..args.requests {
        let request = json!({
            "requestId": format!("sim-{}-{}", args.seed, i),
            "userId": format!("user-{}", i % args.users),
        });
        match router
            .route(RouteRequest::new(backends.clone(), request).with_intent("simulate"))
            .await
        {
            Ok(outcome) => {
                *served.entry(outcome.backend_used).or_default() += 1;
                if outcome.sticky {
                    sticky_hits += 1;
                }
                if outcome.attempt > 1 {
                    fallbacks += 1;
                }
            }
            Err(e) => {
                warn!(request = i, error = %e, "Simulated request failed");
                *errors.entry(e.code().to_string()).or_default() += 1;
            }
        }
    }

    router.persist().await?;
    let arms = router.bandit_snapshot().await;
    let health = router.health().snapshot_all();
    let event_counts: Option<BTreeMap<&'static str, usize>> = recorder.map(|recorder| {
        let mut counts = BTreeMap::new();
        for name in recorder.names() {
            *counts.entry(name).or_default() += 1;
        }
        recorder.detach();
        counts
    });

    if format == OutputFormat::Json {
        let mut report = json!({
            "requests": args.requests,
            "seed": args.seed,
            "preference": preference,
            "served": served,
            "errors": errors,
            "stickyHits": sticky_hits,
            "fallbacks": fallbacks,
            "arms": arms,
            "health": health,
        });
        if let Some(counts) = &event_counts {
            report["events"] = json!(counts);
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !quiet {
        println!(
            "Simulated {} requests (seed {}, preference {})",
            args.requests, args.seed, preference
        );
        println!();
    }
    println!("Served:");
    for (id, count) in &served {
        println!("  {:<12} {}", id, count);
    }
    if !errors.is_empty() {
        println!("Errors:");
        for (code, count) in &errors {
            println!("  {:<24} {}", code, count);
        }
    }
    if !quiet {
        println!("Sticky hits: {}", sticky_hits);
        println!("Fallbacks:   {}", fallbacks);
        println!();
        println!("Bandit arms:");
        print_arms(arms.iter().map(|(key, arm)| {
            (key.as_str(), arm.trials, arm.avg_reward, arm.alpha, arm.beta)
        }));
        let disabled: Vec<&String> = health
            .iter()
            .filter(|(_, state)| !state.enabled)
            .map(|(id, _)| id)
            .collect();
        if !disabled.is_empty() {
            println!();
            let disabled: Vec<&str> = disabled.iter().map(|id| id.as_str()).collect();
            println!("Disabled at end of run: {}", disabled.join(", "));
        }
    }
    if let Some(counts) = &event_counts {
        println!();
        println!("Events:");
        for (name, count) in counts {
            println!("  {:<24} {}", name, count);
        }
    }
    Ok(())
}

fn print_arms<'a>(rows: impl Iterator<Item = (&'a str, u64, f64, f64, f64)>) {
    println!(
        "  {:<28} {:>7} {:>8} {:>9} {:>9}",
        "ARM", "TRIALS", "AVG", "ALPHA", "BETA"
    );
    for (key, trials, avg, alpha, beta) in rows {
        println!(
            "  {:<28} {:>7} {:>8.3} {:>9.2} {:>9.2}",
            key, trials, avg, alpha, beta
        );
    }
}

async fn cmd_stats(db: &std::path::Path, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    if !db.exists() {
        return Err(anyhow!("Database not found: {}", db.display()));
    }

    let store = SqliteBanditStore::connect(db)
        .await
        .with_context(|| format!("Failed to open {}", db.display()))?;
    store.init().await?;
    let summary = store.summary().await?;
    let arms: BTreeMap<String, _> = store.load_all().await?.into_iter().collect();

    if format == OutputFormat::Json {
        let report = json!({
            "summary": summary,
            "arms": arms,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !quiet {
        println!("Bandit Store: {}", db.display());
        println!(
            "  {} arms, {} backends, {} contexts, {} trials",
            summary.arms, summary.backends, summary.contexts, summary.total_trials
        );
        println!();
    }
    print_arms(arms.iter().map(|(key, arm)| {
        (key.as_str(), arm.trials, arm.avg_reward(), arm.alpha, arm.beta)
    }));
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
