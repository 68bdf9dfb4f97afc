//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values. Every operation the
//! orchestrator exposes is a subcommand here; HTTP route wiring is a
//! deployment concern and lives outside this binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::models::PartyShare;

/// Tessera - orchestrator for MPC/FHE computations over encrypted IoT data
///
/// Prepare analyses, distribute key shares, batch computations across
/// compute parties, and stream ingested data points into auto-batched
/// analyses.
///
/// Examples:
///   tessera --user alice prepare mpc --party mpc1=s1 --party mpc2=s2 ...
///   tessera --user alice list
///   tessera --user alice status 4f3a...
///   tessera batch submit --batch-size 6 --data-point-count 3 --analysis a1 --analysis a2 ...
///   tessera init-config
#[derive(Parser, Debug, Clone)]
#[command(name = "tessera", author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for tessera.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Caller identity for identity-scoped commands
    ///
    /// Authentication is handled upstream; this is the resolved identity.
    #[arg(short, long, env = "TESSERA_USER", value_name = "ID")]
    pub user: Option<String>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Store snapshot file (overrides config)
    #[arg(long, value_name = "FILE")]
    pub store: Option<PathBuf>,

    /// Dataset service base URL (overrides config)
    #[arg(long, value_name = "URL")]
    pub dataset_endpoint: Option<String>,

    /// FHE server base URL (overrides config)
    #[arg(long, value_name = "URL")]
    pub fhe_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Manage the compute-party registry
    Party {
        #[command(subcommand)]
        action: PartyAction,
    },

    /// Prepare a new analysis (MPC or FHE)
    Prepare {
        #[command(subcommand)]
        action: PrepareAction,
    },

    /// Push a prepared MPC analysis to each of its parties
    Dispatch {
        /// Id of the analysis to dispatch
        analysis_id: String,
    },

    /// List your analyses, refreshing any still-live statuses
    List,

    /// Show the per-party status table and the reduced status
    ///
    /// Exit code 2 when the reduced status is Failed.
    Status {
        analysis_id: String,
    },

    /// Fetch the encrypted results reported for an analysis
    Result {
        analysis_id: String,
    },

    /// Party-side: fetch the ciphertexts an analysis computes over
    Data {
        analysis_id: String,

        /// The analysis owner's id, as known to the calling party
        #[arg(long, value_name = "ID")]
        claimed_user: String,

        /// Restrict to these event timestamps (comma-separated);
        /// defaults to the analysis's own data index
        #[arg(long, value_name = "TS", value_delimiter = ',')]
        data_index: Option<Vec<i64>>,
    },

    /// Party-side: fetch the key share intended for a party
    Share {
        analysis_id: String,

        /// The party asking for its share
        #[arg(long, value_name = "ID")]
        party: String,
    },

    /// Party-side: record a computed result for an analysis
    Record {
        analysis_id: String,

        /// The party reporting the result
        #[arg(long, value_name = "ID")]
        party: String,

        /// The analysis owner's id, as claimed by the reporting party
        #[arg(long, value_name = "ID")]
        owner: String,

        /// The encrypted result ciphertext
        #[arg(long, value_name = "HEX")]
        result: String,

        /// The parties already combined their shares
        #[arg(long)]
        combined: bool,
    },

    /// Combine prepared analyses into one batched computation
    Batch {
        #[command(subcommand)]
        action: BatchAction,
    },

    /// Control the streaming auto-batcher
    Stream {
        #[command(subcommand)]
        action: StreamAction,
    },

    /// Ingest events into a dataset (feeds the streaming session)
    Ingest {
        #[arg(long, value_name = "DATASET")]
        dataset: String,

        #[arg(long, value_name = "NAME")]
        metric: String,

        /// Event value, parsed as JSON (falls back to a plain string)
        #[arg(long, value_name = "JSON")]
        value: String,

        /// Event time in epoch milliseconds; defaults to now
        #[arg(long, value_name = "MS")]
        timestamp: Option<i64>,

        #[arg(long, value_name = "ID")]
        source: Option<String>,
    },

    /// Query events by time range and metric
    Query {
        #[arg(long, value_name = "DATASETS", value_delimiter = ',')]
        datasets: Vec<String>,

        #[arg(long, value_name = "METRICS", value_delimiter = ',')]
        metrics: Vec<String>,

        /// Range start, epoch milliseconds (inclusive)
        #[arg(long, value_name = "MS")]
        from: i64,

        /// Range end, epoch milliseconds (exclusive)
        #[arg(long, value_name = "MS")]
        to: i64,
    },

    /// Delete every analysis and key share (test-environment reset)
    Cleanup {
        /// Confirm the destructive reset
        #[arg(long)]
        yes: bool,
    },

    /// Generate a default tessera.toml configuration file
    InitConfig,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PartyAction {
    /// Register a compute party
    Register {
        /// Party identifier (e.g. mpc1)
        mpc_id: String,

        /// The party's public key
        #[arg(long, value_name = "KEY")]
        key: String,

        /// Base URL of the party's compute endpoint
        #[arg(long, value_name = "URL")]
        host: String,

        /// Deployment region label
        #[arg(long, value_name = "REGION", default_value = "eu-west")]
        region: String,
    },

    /// List registered parties
    List,

    /// Kick offline preprocessing on parties (all when none named)
    Offline {
        /// Party ids to kick; empty means every registered party
        mpc_ids: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PrepareAction {
    /// Prepare an MPC analysis and distribute key shares
    Mpc {
        /// A party and its key share, as ID=SHARE (repeatable)
        #[arg(long = "party", value_name = "ID=SHARE", value_parser = parse_party_share)]
        parties: Vec<PartyShare>,

        /// Hours (fractional allowed) until the key shares expire
        #[arg(long, value_name = "HOURS", default_value = "24")]
        exp_hours: f64,

        /// The user's public key
        #[arg(long, value_name = "KEY")]
        user_key: String,

        /// Dataset holding the encrypted input events
        #[arg(long, value_name = "DATASET")]
        source: String,

        /// Dataset where parties push encrypted results
        #[arg(long, value_name = "DATASET")]
        result: String,

        #[arg(long, value_name = "NAME")]
        metric: String,

        /// Event timestamps to compute over (comma-separated)
        #[arg(long, value_name = "TS", value_delimiter = ',')]
        data_index: Vec<i64>,

        #[arg(long, value_name = "TYPE")]
        analysis_type: String,

        /// Also dispatch to the parties immediately
        #[arg(long)]
        dispatch: bool,
    },

    /// Prepare an FHE analysis (dispatched to the FHE server immediately)
    Fhe {
        #[arg(long, value_name = "HOURS", default_value = "24")]
        exp_hours: f64,

        #[arg(long, value_name = "DATASET")]
        source: String,

        #[arg(long, value_name = "DATASET")]
        result: String,

        #[arg(long, value_name = "NAME")]
        metric: String,

        #[arg(long, value_name = "TS", value_delimiter = ',')]
        data_index: Vec<i64>,

        #[arg(long, value_name = "TYPE")]
        analysis_type: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum BatchAction {
    /// Validate and submit a batch of prepared analyses
    Submit {
        /// Declared total data-point count across all members
        #[arg(long, value_name = "COUNT")]
        batch_size: usize,

        /// Data points per member analysis
        #[arg(long, value_name = "COUNT")]
        data_point_count: usize,

        /// Member analysis id (repeatable)
        #[arg(long = "analysis", value_name = "ID")]
        analysis_ids: Vec<String>,

        #[arg(long, value_name = "TYPE")]
        analysis_type: String,

        /// Skip the offline preprocessing phase on the parties
        #[arg(long)]
        online_only: bool,
    },

    /// List batches, refreshing non-terminal statuses first
    List {
        /// Only batches still queued
        #[arg(long)]
        queued: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum StreamAction {
    /// Open the streaming session (there can be only one)
    Start {
        #[arg(long, value_name = "TYPE")]
        analysis_type: String,

        /// Pending analyses are flushed into a batch at this count
        #[arg(long, value_name = "COUNT")]
        batch_size: usize,

        /// Key share for a canonical party, ordered mpc1, mpc2, mpc3
        /// (repeat exactly three times)
        #[arg(long = "share", value_name = "SHARE")]
        shares: Vec<String>,

        /// Hours (fractional allowed) until the session's keys expire
        #[arg(long, value_name = "HOURS", default_value = "24")]
        exp_hours: f64,

        /// Dataset whose ingests feed the session
        #[arg(long, value_name = "DATASET")]
        source: String,

        #[arg(long, value_name = "DATASET")]
        result: String,
    },

    /// Close the streaming session
    Stop,

    /// Show the session state (key shares redacted)
    Info,

    /// Re-drive streaming batch submissions a crash left pending
    Flush,

    /// Show the streaming submission ledger
    Submissions,
}

/// Parses a `--party ID=SHARE` argument.
fn parse_party_share(raw: &str) -> Result<PartyShare, String> {
    let (mpc_id, key_share) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=SHARE, got '{raw}'"))?;
    if mpc_id.is_empty() || key_share.is_empty() {
        return Err(format!("expected ID=SHARE, got '{raw}'"));
    }
    Ok(PartyShare {
        mpc_id: mpc_id.to_string(),
        key_share: key_share.to_string(),
    })
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        // Validate endpoint overrides
        for endpoint in [&self.dataset_endpoint, &self.fhe_endpoint]
            .into_iter()
            .flatten()
        {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(format!(
                    "Endpoint must start with 'http://' or 'https://': {endpoint}"
                ));
            }
        }

        match &self.command {
            Command::Prepare {
                action:
                    PrepareAction::Mpc {
                        parties,
                        exp_hours,
                        data_index,
                        ..
                    },
            } => {
                if parties.is_empty() {
                    return Err("At least one --party ID=SHARE is required".to_string());
                }
                if *exp_hours < 0.0 {
                    return Err("--exp-hours must not be negative".to_string());
                }
                if data_index.is_empty() {
                    return Err("--data-index must name at least one timestamp".to_string());
                }
            }
            Command::Prepare {
                action:
                    PrepareAction::Fhe {
                        exp_hours,
                        data_index,
                        ..
                    },
            } => {
                if *exp_hours < 0.0 {
                    return Err("--exp-hours must not be negative".to_string());
                }
                if data_index.is_empty() {
                    return Err("--data-index must name at least one timestamp".to_string());
                }
            }
            Command::Batch {
                action: BatchAction::Submit { analysis_ids, .. },
            } => {
                if analysis_ids.is_empty() {
                    return Err("At least one --analysis ID is required".to_string());
                }
            }
            Command::Stream {
                action: StreamAction::Start {
                    shares, batch_size, ..
                },
            } => {
                if shares.len() != 3 {
                    return Err(
                        "Streaming needs exactly three --share values, ordered mpc1, mpc2, mpc3"
                            .to_string(),
                    );
                }
                if *batch_size == 0 {
                    return Err("--batch-size must be at least 1".to_string());
                }
            }
            Command::Query { datasets, from, to, .. } => {
                if datasets.is_empty() {
                    return Err("--datasets must name at least one dataset".to_string());
                }
                if from >= to {
                    return Err("--from must be before --to".to_string());
                }
            }
            Command::Cleanup { yes } => {
                if !yes {
                    return Err(
                        "Cleanup deletes every analysis and key share; pass --yes to confirm"
                            .to_string(),
                    );
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// The caller identity, required by identity-scoped commands.
    pub fn caller(&self) -> Result<&str, String> {
        self.user
            .as_deref()
            .filter(|user| !user.is_empty())
            .ok_or_else(|| "No caller identity; pass --user or set TESSERA_USER".to_string())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
