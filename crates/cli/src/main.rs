//! dagflow CLI application

use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use dagflow_common::error::Error;
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{DagRunRef, RunStatus, TriggerType};
use dagflow_common::Config;
use dagflow_core::status::CreateAttemptOptions;
use dagflow_core::store::{DagDatabase, DagRunStore, ListStatusOptions, QueueStore, RunAttempt};
use dagflow_engine::{enqueue_retry, Engine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let app = Command::new("dagflow-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Workflow orchestrator CLI")
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log verbosity"),
        )
        .subcommand(
            Command::new("run")
                .about("Run a DAG now")
                .arg(Arg::new("dag").required(true).help("DAG name"))
                .arg(
                    Arg::new("params")
                        .short('p')
                        .long("params")
                        .help("Params string, e.g. 'KEY=value other'"),
                )
                .arg(
                    Arg::new("run-id")
                        .long("run-id")
                        .help("Explicit dag-run id (generated when omitted)"),
                ),
        )
        .subcommand(
            Command::new("retry")
                .about("Re-queue a finished dag-run")
                .arg(Arg::new("dag").required(true).help("DAG name"))
                .arg(Arg::new("run-id").required(true).help("dag-run id")),
        )
        .subcommand(
            Command::new("status")
                .about("Show the latest status of a dag-run")
                .arg(Arg::new("dag").required(true).help("DAG name"))
                .arg(Arg::new("run-id").help("dag-run id (latest run when omitted)")),
        )
        .subcommand(
            Command::new("list")
                .about("List stored dag-runs")
                .arg(Arg::new("name").long("name").help("Substring filter on the DAG name"))
                .arg(Arg::new("status").long("status").help("Filter by status"))
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(usize))
                        .help("Maximum rows"),
                ),
        )
        .subcommand(Command::new("queue").about("Show admission queues"))
        .subcommand(Command::new("scheduler").about("Run the scheduler and processors"))
        .subcommand(Command::new("worker").about("Run queue processors for this host"))
        .subcommand(Command::new("check").about("Validate configuration and DAG definitions"));

    let matches = app.get_matches();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;
    if let Err(errors) = config.validate() {
        for error in errors {
            eprintln!("Config error: {error}");
        }
        std::process::exit(1);
    }

    let verbosity = matches.get_count("verbose");
    init_logging(&config, verbosity);

    let outcome = match matches.subcommand() {
        Some(("run", sub)) => cmd_run(&config, sub).await,
        Some(("retry", sub)) => cmd_retry(&config, sub).await,
        Some(("status", sub)) => cmd_status(&config, sub).await,
        Some(("list", sub)) => cmd_list(&config, sub).await,
        Some(("queue", _)) => cmd_queue(&config).await,
        Some(("scheduler" | "worker", _)) => cmd_serve(&config).await,
        Some(("check", _)) => cmd_check(&config).await,
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(config: &Config, verbosity: u8) {
    let mut observability = config.observability.clone();
    if verbosity >= 2 {
        observability.log_level = "trace".to_string();
    } else if verbosity == 1 {
        observability.log_level = "debug".to_string();
    }
    if let Err(e) = dagflow_common::telemetry::init_telemetry(&observability) {
        eprintln!("Warning: telemetry init failed: {e}");
    }
}

async fn cmd_run(config: &Config, matches: &clap::ArgMatches) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let dag_name = matches.get_one::<String>("dag").unwrap();
    let dag = engine.dag_db.get_dag(dag_name).await?;

    let run_id = matches
        .get_one::<String>("run-id")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let opts = CreateAttemptOptions {
        trigger: TriggerType::Manual,
        params: matches.get_one::<String>("params").cloned(),
        ..CreateAttemptOptions::default()
    };
    let attempt = engine
        .run_store
        .create_attempt(&dag, TimeInUtc::now(), &run_id, opts)
        .await?;

    println!("Started {}:{run_id}", dag.name);
    let final_status = engine
        .runner
        .run_attempt(&dag, attempt, CancellationToken::new())
        .await?;
    println!("Finished with status: {final_status}");

    if final_status == RunStatus::Succeeded || final_status == RunStatus::PartiallySucceeded {
        Ok(())
    } else {
        Err(anyhow::anyhow!("run finished with status {final_status}"))
    }
}

async fn cmd_retry(config: &Config, matches: &clap::ArgMatches) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let dag_name = matches.get_one::<String>("dag").unwrap();
    let run_id = matches.get_one::<String>("run-id").unwrap();

    let dag_run = DagRunRef::new(dag_name.clone(), run_id.clone());
    let attempt = engine.run_store.find_attempt(&dag_run).await?;
    // Replay the definition bound at create time, not the current one
    let dag = attempt.read_dag().await?;
    let mut status = attempt.read_status().await?;

    enqueue_retry(
        engine.queue_store.as_ref(),
        engine.run_store.as_ref(),
        &dag,
        &mut status,
        run_id,
    )
    .await?;
    println!("Queued {dag_run} for retry on queue {:?}", dag.proc_group());
    Ok(())
}

async fn cmd_status(config: &Config, matches: &clap::ArgMatches) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let dag_name = matches.get_one::<String>("dag").unwrap();

    let attempt = match matches.get_one::<String>("run-id") {
        Some(run_id) => {
            engine
                .run_store
                .find_attempt(&DagRunRef::new(dag_name.clone(), run_id.clone()))
                .await?
        }
        None => engine.run_store.latest_attempt(dag_name).await?,
    };
    let status = attempt.read_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_list(config: &Config, matches: &clap::ArgMatches) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let statuses = engine
        .run_store
        .list_statuses(ListStatusOptions {
            name: matches.get_one::<String>("name").cloned(),
            statuses: match matches.get_one::<String>("status") {
                Some(s) => vec![parse_status(s)?],
                None => Vec::new(),
            },
            limit: matches.get_one::<usize>("limit").copied(),
            ..ListStatusOptions::default()
        })
        .await?;

    for status in statuses {
        println!(
            "{:<30} {:<24} {:<20} queued={} finished={}",
            status.name, status.dag_run_id, status.status, status.queued_at, status.finished_at
        );
    }
    Ok(())
}

async fn cmd_queue(config: &Config) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let queues = engine.queue_store.queue_list().await?;
    if queues.is_empty() {
        println!("No queued items");
        return Ok(());
    }
    for name in queues {
        let items = engine.queue_store.list(&name).await?;
        println!("{name} ({} items):", items.len());
        for item in items {
            println!("  {}", item.data()?);
        }
    }
    Ok(())
}

async fn cmd_serve(config: &Config) -> Result<()> {
    let engine = Arc::new(Engine::new(config.clone())?);
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    println!("dagflow engine running as {} (ctrl-c to stop)", engine.host_id());
    engine.start(cancel).await?;
    Ok(())
}

async fn cmd_check(config: &Config) -> Result<()> {
    let engine = Engine::new(config.clone())?;
    let dags = engine.dag_db.list_dags().await?;
    for dag in &dags {
        dag.validate()?;
        println!("ok: {}", dag.name);
    }
    println!("{} DAG(s) valid", dags.len());
    Ok(())
}

fn parse_status(s: &str) -> Result<RunStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| anyhow::anyhow!(Error::Validation(format!("unknown status {s:?}"))))
}
