//! `homeostat` command-line driver

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use homeostat_core::{Clock, HomeostatConfig, SystemClock};
use homeostat_engine::{Orchestrator, RunOutcome, Stores};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod sim;

#[tokio::main]
async fn main() {
    let cli = Command::new("homeostat")
        .version(homeostat_engine::VERSION)
        .about("Homeostat self-healing decision and safety core")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to a TOML configuration file"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Directory for the audit log, precedents, and circuit state"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run anomalies through the pipeline against simulated collaborators")
                .arg(
                    Arg::new("anomalies")
                        .long("anomalies")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Newline-delimited JSON anomalies"),
                )
                .arg(
                    Arg::new("auto-approve")
                        .long("auto-approve")
                        .action(ArgAction::SetTrue)
                        .help("Approve every escalation immediately"),
                ),
        )
        .subcommand(
            Command::new("audit")
                .about("Export or verify the audit log")
                .arg(
                    Arg::new("since")
                        .long("since")
                        .default_value("0")
                        .value_parser(value_parser!(u64))
                        .help("Only entries after this sequence number"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output entries as JSON lines"),
                )
                .arg(
                    Arg::new("verify")
                        .long("verify")
                        .action(ArgAction::SetTrue)
                        .help("Check the hash chain instead of exporting"),
                ),
        )
        .subcommand(Command::new("circuits").about("List circuit breaker state per service"))
        .subcommand(
            Command::new("recover")
                .about("Resume runs left unfinished by a previous process")
                .arg(
                    Arg::new("auto-approve")
                        .long("auto-approve")
                        .action(ArgAction::SetTrue)
                        .help("Approve every escalation immediately"),
                ),
        );

    let matches = cli.get_matches();
    init_tracing(matches.get_flag("log-json"));

    let result = match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("audit", args)) => audit(args),
        Some(("circuits", args)) => circuits(args),
        Some(("recover", args)) => recover(args).await,
        _ => Ok(true),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> anyhow::Result<HomeostatConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => HomeostatConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HomeostatConfig::default(),
    };
    if let Some(dir) = args.get_one::<PathBuf>("data-dir") {
        config = config.with_data_dir(dir);
    }
    Ok(config)
}

fn open_stores(config: &HomeostatConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Stores> {
    if config.storage.data_dir.is_none() {
        tracing::warn!("no data directory configured, state will not survive this process");
    }
    Stores::open(config, clock).context("opening stores")
}

fn orchestrator(config: HomeostatConfig) -> anyhow::Result<Orchestrator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = open_stores(&config, Arc::clone(&clock))?;
    let collaborators = sim::collaborators(&config)?;
    Ok(Orchestrator::new(config, stores, collaborators, clock)?)
}

/// Resolve every pending approval as it appears
fn spawn_auto_approver(orchestrator: &Orchestrator) -> tokio::task::JoinHandle<()> {
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        loop {
            tick.tick().await;
            for request in orchestrator.pending_approvals() {
                match orchestrator.resolve(request.id, true, "auto-approver") {
                    Ok(_) => tracing::info!(request_id = %request.id, "auto-approved"),
                    Err(e) => tracing::debug!(request_id = %request.id, error = %e, "approval already settled"),
                }
            }
        }
    })
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = load_config(args)?;
    let path = args
        .get_one::<PathBuf>("anomalies")
        .context("--anomalies is required")?;
    let anomalies = sim::read_anomalies(path, &config, SystemClock.now())?;
    println!("Running {} anomalies through the pipeline...", anomalies.len());
    println!();

    let orchestrator = orchestrator(config)?;
    let resumed = orchestrator.recover();
    if !resumed.is_empty() {
        println!("Resumed {} unfinished runs from a previous process", resumed.len());
    }
    let approver = args
        .get_flag("auto-approve")
        .then(|| spawn_auto_approver(&orchestrator));

    let mut runs = Vec::with_capacity(anomalies.len());
    for anomaly in anomalies {
        let run_id = orchestrator.submit_anomaly(anomaly.clone()).await?;
        runs.push((anomaly, run_id));
    }
    let outcomes = futures::future::try_join_all(runs.into_iter().map(|(anomaly, run_id)| {
        let orchestrator = orchestrator.clone();
        async move {
            let outcome: RunOutcome = orchestrator.wait_for(run_id).await?;
            anyhow::Ok((anomaly, outcome))
        }
    }))
    .await?;

    if let Some(approver) = approver {
        approver.abort();
    }
    println!("{}", sim::report(&outcomes));
    Ok(sim::all_completed(&outcomes))
}

fn audit(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = load_config(args)?;
    let stores = open_stores(&config, Arc::new(SystemClock))?;

    if args.get_flag("verify") {
        return Ok(match stores.audit.verify_integrity() {
            Ok(()) => {
                println!("Audit log: VALID");
                println!("Entries checked: {}", stores.audit.len());
                true
            }
            Err(e) => {
                println!("Audit log: INVALID ({e})");
                false
            }
        });
    }

    let since = args.get_one::<u64>("since").copied().unwrap_or(0);
    let json = args.get_flag("json");
    for entry in stores.audit.stream_since(since) {
        if json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            let run = entry.run_id.map(|r| r.to_string()).unwrap_or_default();
            let stage = entry
                .payload_snapshot
                .pointer("/state/stage")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("-");
            println!(
                "{:>6}  {}  {:<10} {:<18} {} {}",
                entry.seq,
                entry.timestamp.to_rfc3339(),
                entry.entity_type.to_string(),
                stage,
                run,
                entry.entity_id
            );
        }
    }
    Ok(true)
}

fn circuits(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = load_config(args)?;
    let stores = open_stores(&config, Arc::new(SystemClock))?;
    let snapshot = stores.breaker.snapshot();
    if snapshot.is_empty() {
        println!("No circuit state recorded");
        return Ok(true);
    }

    println!(
        "{:<24} {:<10} {:>8} {:>10} {:>8}",
        "SERVICE", "STATE", "FAILURES", "COOLDOWN", "REOPENS"
    );
    for circuit in snapshot {
        println!(
            "{:<24} {:<10} {:>8} {:>9}s {:>8}",
            circuit.service,
            circuit.state.to_string(),
            circuit.failure_count,
            circuit.cooldown_secs,
            circuit.reopen_count
        );
    }
    Ok(true)
}

async fn recover(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = load_config(args)?;
    if config.storage.data_dir.is_none() {
        anyhow::bail!("recover needs --data-dir or storage.data_dir");
    }
    let orchestrator = orchestrator(config)?;
    let approver = args
        .get_flag("auto-approve")
        .then(|| spawn_auto_approver(&orchestrator));

    let resumed = orchestrator.recover();
    println!("Resumed {} runs", resumed.len());
    let mut completed = true;
    for run_id in resumed {
        let outcome = orchestrator.wait_for(run_id).await?;
        println!("{run_id}  {}  {}", outcome.result, outcome.reason);
        completed &= outcome.result != homeostat_engine::RunResult::Aborted;
    }

    if let Some(approver) = approver {
        approver.abort();
    }
    Ok(completed)
}
