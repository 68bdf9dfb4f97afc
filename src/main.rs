//! Tessera - orchestrator for MPC/FHE computations over encrypted IoT data
//!
//! A CLI that prepares analyses, distributes key shares to compute
//! parties, batches computations, and streams ingested data points into
//! auto-batched analyses.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (party, dataset, store, or config failure)
//!   2 - `status` reported the computation as Failed

mod cli;
mod client;
mod config;
mod engine;
mod error;
mod models;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use cli::{Args, BatchAction, Command, PartyAction, PrepareAction, StreamAction};
use client::{DataRange, EventsQuery, HttpComputeClient, HttpDatasetService, IngestEvent};
use config::Config;
use engine::{EngineConfig, Orchestrator};
use error::OrchestratorError;
use models::{
    now_ms, AnalysisStatus, BatchSpec, FheAnalysisSpec, MpcAnalysisSpec, MpcParty,
    ResultSubmission, StreamingSpec, MS_PER_HOUR,
};
use store::{DocumentStore, MemoryStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("Tessera v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default tessera.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new("tessera.toml");

    if path.exists() {
        eprintln!("⚠️  tessera.toml already exists. Remove it first or edit it manually.");
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).context("Failed to write tessera.toml")?;

    println!("✅ Created tessera.toml with default settings.");
    println!("   Edit it to point at your dataset service, FHE server, and store.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from tessera.toml");
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}

/// A spinner for operations that wait on compute parties or the dataset
/// service.
fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Build the engine and run the requested command. Returns the exit code.
async fn run(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let store: Arc<dyn DocumentStore> = if config.store.path.is_empty() {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(MemoryStore::with_snapshot(&config.store.path)?)
    };
    let compute = Arc::new(HttpComputeClient::new(config.compute.timeout_seconds));
    let datasets = Arc::new(HttpDatasetService::new(
        config.dataset.endpoint.clone(),
        config.dataset.ingest_timeout_seconds,
        config.dataset.query_timeout_seconds,
    ));
    let engine = Orchestrator::new(
        store,
        compute,
        datasets,
        EngineConfig {
            fhe_endpoint: config.compute.fhe_endpoint.clone(),
            submit_delay_ms: config.streaming.submit_delay_ms,
        },
    );

    // A cheap identity resolver: the upstream gateway is out of scope, so
    // the resolved caller identity arrives on the command line.
    let caller = |args: &Args| -> Result<String> {
        args.caller()
            .map(str::to_string)
            .map_err(|reason| OrchestratorError::Unauthorized(reason).into())
    };

    match args.command.clone() {
        Command::Party { action } => run_party(&engine, action).await?,
        Command::Prepare { action } => run_prepare(&engine, &caller(&args)?, action).await?,

        Command::Dispatch { analysis_id } => {
            let user = caller(&args)?;
            let pb = spinner("Dispatching to compute parties...");
            let result = engine.dispatch_analysis(&user, &analysis_id).await;
            pb.finish_and_clear();
            result?;
            println!("✅ Dispatched analysis {} to its parties.", analysis_id);
        }

        Command::List => {
            let user = caller(&args)?;
            let pb = spinner("Refreshing analysis statuses...");
            let result = engine.list_analyses(&user).await;
            pb.finish_and_clear();
            let analyses = result?;

            if analyses.is_empty() {
                println!("No analyses for {}.", user);
            }
            for (analysis_id, analysis) in analyses {
                println!(
                    "{} {}  {}  {}  target={}  results={}",
                    analysis.latest_status.emoji(),
                    analysis_id,
                    analysis.latest_status,
                    analysis.analysis_type,
                    analysis.target,
                    analysis.result_timestamps.len()
                );
            }
        }

        Command::Status { analysis_id } => {
            let user = caller(&args)?;
            let pb = spinner("Polling compute parties...");
            let result = engine.analysis_status(&user, &analysis_id).await;
            pb.finish_and_clear();
            let (status, reports) = result?;

            for report in &reports {
                println!("   {} reports: {}", report.mpc_id, report.status);
            }
            println!("{} Analysis {} is {}.", status.emoji(), analysis_id, status);

            if status == AnalysisStatus::Failed {
                return Ok(2);
            }
        }

        Command::Result { analysis_id } => {
            let user = caller(&args)?;
            let page = engine.fetch_result(&user, &analysis_id).await?;
            if page.items.is_empty() {
                println!("No results reported for {} yet.", analysis_id);
            } else {
                println!("{}", serde_json::to_string_pretty(&page)?);
            }
        }

        Command::Data {
            analysis_id,
            claimed_user,
            data_index,
        } => {
            let ciphertexts = engine
                .fetch_analysis_data(&claimed_user, &analysis_id, data_index.as_deref())
                .await?;
            for ciphertext in ciphertexts {
                println!("{}", ciphertext);
            }
        }

        Command::Share { analysis_id, party } => {
            let share = engine.fetch_key_share(&party, &analysis_id).await?;
            println!("{}", serde_json::to_string_pretty(&share)?);
        }

        Command::Record {
            analysis_id,
            party,
            owner,
            result,
            combined,
        } => {
            engine
                .record_result(
                    &party,
                    &analysis_id,
                    ResultSubmission {
                        user_id: owner,
                        result,
                        is_combined: combined.then_some(true),
                    },
                )
                .await?;
            println!("✅ Recorded result from {} for {}.", party, analysis_id);
        }

        Command::Batch { action } => run_batch(&engine, action).await?,
        Command::Stream { action } => run_stream(&engine, action).await?,

        Command::Ingest {
            dataset,
            metric,
            value,
            timestamp,
            source,
        } => {
            let user = caller(&args)?;
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            let events = vec![IngestEvent {
                timestamp,
                metric,
                value,
                source,
                tags: None,
            }];

            engine.ingest_events(&user, &dataset, &events).await?;
            println!("✅ Ingested 1 event into {}.", dataset);

            // One-shot process: the deferred flush worker would die with
            // us, so settle any submission this ingest produced here.
            let pb = spinner("Settling streaming submissions...");
            let result = engine.flush_pending_submissions().await;
            pb.finish_and_clear();
            for (submission_id, batch_id) in result? {
                println!("📦 Submission {} became batch {}.", submission_id, batch_id);
            }
        }

        Command::Query {
            datasets,
            metrics,
            from,
            to,
        } => {
            let page = engine
                .query_events(EventsQuery {
                    data_range: DataRange { datasets, metrics },
                    from,
                    to,
                    fields: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }

        Command::Cleanup { .. } => {
            let (analyses, shares) = engine.cleanup_analyses().await?;
            println!("🗑️  Deleted {} analyses and {} key shares.", analyses, shares);
        }

        Command::InitConfig => unreachable!("handled before logging init"),
    }

    Ok(0)
}

async fn run_party(engine: &Orchestrator, action: PartyAction) -> Result<()> {
    match action {
        PartyAction::Register {
            mpc_id,
            key,
            host,
            region,
        } => {
            let party = MpcParty {
                mpc_id,
                mpc_key: key,
                host,
                region,
            };
            engine.register_party(party.clone()).await?;
            println!("✅ Registered {}.", party);
        }
        PartyAction::List => {
            let parties = engine.list_parties().await?;
            if parties.is_empty() {
                println!("No parties registered.");
            }
            for party in parties {
                println!("   {}", party);
            }
        }
        PartyAction::Offline { mpc_ids } => {
            let pb = spinner("Kicking offline preprocessing...");
            let result = engine.trigger_offline(&mpc_ids).await;
            pb.finish_and_clear();
            let kicked = result?;
            println!("✅ Offline preprocessing started on: {}.", kicked.join(", "));
        }
    }
    Ok(())
}

async fn run_prepare(engine: &Orchestrator, user: &str, action: PrepareAction) -> Result<()> {
    match action {
        PrepareAction::Mpc {
            parties,
            exp_hours,
            user_key,
            source,
            result,
            metric,
            data_index,
            analysis_type,
            dispatch,
        } => {
            let analysis_id = engine
                .prepare_mpc_analysis(
                    user,
                    MpcAnalysisSpec {
                        parties,
                        exp_hours,
                        user_key,
                        source_dataset: source,
                        result_dataset: result,
                        metric,
                        data_index,
                        analysis_type,
                        invoker: Default::default(),
                    },
                )
                .await?;
            println!("✅ Prepared MPC analysis {} (key shares stored).", analysis_id);

            if dispatch {
                let pb = spinner("Dispatching to compute parties...");
                let dispatched = engine.dispatch_analysis(user, &analysis_id).await;
                pb.finish_and_clear();
                dispatched?;
                println!("✅ Dispatched analysis {} to its parties.", analysis_id);
            }
        }
        PrepareAction::Fhe {
            exp_hours,
            source,
            result,
            metric,
            data_index,
            analysis_type,
        } => {
            let pb = spinner("Pushing to the FHE server...");
            let prepared = engine
                .prepare_fhe_analysis(
                    user,
                    FheAnalysisSpec {
                        exp_hours,
                        source_dataset: source,
                        result_dataset: result,
                        metric,
                        data_index,
                        analysis_type,
                    },
                )
                .await;
            pb.finish_and_clear();
            let analysis_id = prepared?;
            println!("✅ Prepared and queued FHE analysis {}.", analysis_id);
        }
    }
    Ok(())
}

async fn run_batch(engine: &Orchestrator, action: BatchAction) -> Result<()> {
    match action {
        BatchAction::Submit {
            batch_size,
            data_point_count,
            analysis_ids,
            analysis_type,
            online_only,
        } => {
            let pb = spinner("Submitting batch to compute parties...");
            let result = engine
                .submit_batch(BatchSpec {
                    batch_size,
                    analysis_data_point_count: data_point_count,
                    analysis_ids,
                    analysis_type,
                    online_only,
                    streaming: None,
                })
                .await;
            pb.finish_and_clear();
            let batch_id = result?;
            println!("✅ Submitted batch {}.", batch_id);
        }
        BatchAction::List { queued } => {
            let pb = spinner("Refreshing batch statuses...");
            let result = engine.list_batches(queued).await;
            pb.finish_and_clear();
            let batches = result?;

            if batches.is_empty() {
                println!("No batches.");
            }
            for (batch_id, batch) in batches {
                println!(
                    "{} {}  {}  {}  members={}  size={}",
                    batch.latest_status.emoji(),
                    batch_id,
                    batch.latest_status,
                    batch.analysis_type,
                    batch.analysis_ids.len(),
                    batch.batch_size
                );
            }
        }
    }
    Ok(())
}

async fn run_stream(engine: &Orchestrator, action: StreamAction) -> Result<()> {
    match action {
        StreamAction::Start {
            analysis_type,
            batch_size,
            shares,
            exp_hours,
            source,
            result,
        } => {
            let start_time = now_ms();
            engine
                .start_streaming(StreamingSpec {
                    analysis_type,
                    batch_size,
                    key_shares: shares,
                    start_time,
                    keys_exp_at: start_time + (exp_hours * MS_PER_HOUR).round() as i64,
                    source,
                    result,
                })
                .await?;
            println!("✅ Streaming session started.");
        }
        StreamAction::Stop => {
            engine.stop_streaming().await?;
            println!("✅ Streaming session stopped.");
        }
        StreamAction::Info => {
            let info = engine.streaming_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        StreamAction::Flush => {
            let pb = spinner("Re-driving pending submissions...");
            let result = engine.flush_pending_submissions().await;
            pb.finish_and_clear();
            let driven = result?;

            if driven.is_empty() {
                println!("Nothing pending.");
            }
            for (submission_id, batch_id) in driven {
                println!("📦 Submission {} became batch {}.", submission_id, batch_id);
            }
        }
        StreamAction::Submissions => {
            let submissions = engine.list_submissions().await?;
            if submissions.is_empty() {
                println!("No streaming submissions recorded.");
            }
            for (submission_id, submission) in submissions {
                println!(
                    "   {}  {}  members={}  batch={}",
                    submission_id,
                    submission.state,
                    submission.analysis_ids.len(),
                    submission.batch_id.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
