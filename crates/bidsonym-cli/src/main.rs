//! BIDSonym - a BIDS app for de-identification of neuroimaging data.
//!
//! Thin command-line front end over `bidsonym-core`: parses arguments,
//! installs the log subscriber, wires Ctrl-C to the run's cancellation token
//! and maps the outcome to a process exit status.

use anyhow::{Context, Result};
use bidsonym_core::{
    AnalysisLevel, BidsonymError, BrainExtractionMethod, CancellationToken, DeidMethod,
    FailurePolicy, KeywordMatch, RunController, RunOptions, ToolPaths,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "bidsonym", version)]
#[command(about = "A BIDS app for de-identification of neuroimaging data")]
struct Args {
    /// The directory with the input dataset formatted according to the BIDS standard
    bids_dir: PathBuf,

    /// Level of the analysis: participant or group
    analysis_level: AnalysisLevel,

    /// Label(s) of the participant(s) to analyze, with or without "sub-"
    #[arg(long = "participant-label", alias = "participant_label", num_args = 1..)]
    participant_label: Vec<String>,

    /// De-identification method: pydeface, mri_deface, quickshear, mridefacer or deepdefacer
    #[arg(long, value_name = "METHOD")]
    deid: Option<DeidMethod>,

    /// Deface T2w images by using the defaced T1w image as deface mask
    #[arg(long = "deface-t2w", alias = "deface_t2w")]
    deface_t2w: bool,

    /// Sidecar fields to delete; original .json files are kept in sourcedata/bidsonym
    #[arg(long = "del-meta", alias = "del_meta", num_args = 1.., value_name = "FIELD")]
    del_meta: Vec<String>,

    /// Brain extraction used for quality control: bet or nobrainer
    #[arg(long, value_name = "METHOD")]
    brainextraction: Option<BrainExtractionMethod>,

    /// Fractional intensity threshold for BET, in (0, 1]
    #[arg(long = "bet-frac", alias = "bet_frac", value_name = "FRAC")]
    bet_frac: Option<f64>,

    /// Assume the input dataset is BIDS compliant and skip validation
    #[arg(long = "skip-bids-validation", alias = "skip_bids_validation")]
    skip_bids_validation: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(
        long,
        default_value = "info",
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    verbose: String,

    /// Stop at the first failed subject instead of continuing
    #[arg(long = "fail-fast", alias = "fail_fast")]
    fail_fast: bool,

    /// Number of subjects processed concurrently
    #[arg(long, default_value_t = 1)]
    jobs: usize,

    /// Time limit for each external tool invocation, in seconds
    #[arg(long = "tool-timeout", alias = "tool_timeout", value_name = "SECS")]
    tool_timeout: Option<u64>,

    /// JSON file overriding tool executable and model paths
    #[arg(long = "tool-config", alias = "tool_config", value_name = "FILE")]
    tool_config: Option<PathBuf>,

    /// Write a per-subject report of sidecar fields that may identify the subject
    #[arg(long = "inspect-metadata", alias = "inspect_metadata")]
    inspect_metadata: bool,

    /// Field names considered identifying (replaces the default list)
    #[arg(long = "risk-keywords", alias = "risk_keywords", num_args = 1.., value_name = "FIELD")]
    risk_keywords: Vec<String>,

    /// How field names are matched against risk keywords: exact or substring
    #[arg(long = "keyword-match", alias = "keyword_match", default_value = "exact")]
    keyword_match: KeywordMatch,
}

impl Args {
    fn into_options(self) -> RunOptions {
        let mut options = RunOptions::new(self.bids_dir, self.analysis_level);
        options.participant_labels = self.participant_label;
        options.deid = self.deid;
        options.deface_t2w = self.deface_t2w;
        options.del_meta = self.del_meta;
        options.brain_extraction = self.brainextraction;
        options.bet_frac = self.bet_frac;
        options.skip_bids_validation = self.skip_bids_validation;
        options.failure_policy = if self.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::Continue
        };
        options.jobs = self.jobs;
        if let Some(secs) = self.tool_timeout {
            options.tool_timeout = Duration::from_secs(secs);
        }
        options.inspect_metadata = self.inspect_metadata;
        options.risk_keywords = self.risk_keywords;
        options.keyword_match = self.keyword_match;
        options
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.verbose));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(u8::try_from(exit_code_for(&err)).unwrap_or(1))
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let tool_paths = match &args.tool_config {
        Some(path) => ToolPaths::from_json_file(path)
            .with_context(|| format!("loading tool config {}", path.display()))?,
        None => ToolPaths::default(),
    };
    let config = args.into_options().validate()?;
    info!(
        "Starting BIDSonym on {} ({} level, {})",
        config.bids_dir.display(),
        config.analysis_level,
        config.settings.deid
    );

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let summary = RunController::new(config)
        .with_tool_paths(tool_paths)
        .run(&cancel)
        .await?;

    if summary.is_success() {
        info!("All {} subject(s) de-identified", summary.processed.len());
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Failed subjects: {}", summary.failed.join(", "));
        Ok(ExitCode::FAILURE)
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<BidsonymError>()
        .map_or(1, BidsonymError::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underscore_aliases_are_accepted() {
        let args = Args::try_parse_from([
            "bidsonym",
            "/data",
            "participant",
            "--participant_label",
            "01",
            "sub-02",
            "--deid",
            "mri_deface",
            "--deface_t2w",
            "--del_meta",
            "InstitutionName",
            "--brainextraction",
            "bet",
            "--bet_frac",
            "0.5",
            "--skip_bids_validation",
        ])
        .unwrap();

        assert_eq!(args.participant_label, vec!["01", "sub-02"]);
        assert_eq!(args.deid, Some(DeidMethod::MriDeface));
        assert!(args.deface_t2w);
        assert!(args.skip_bids_validation);

        let config = args.into_options().validate().unwrap();
        assert_eq!(config.participants, vec!["01", "02"]);
        assert_eq!(config.settings.bet_frac, Some(0.5));
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
    }

    #[test]
    fn test_unknown_deid_method_is_rejected_by_parser() {
        let result = Args::try_parse_from([
            "bidsonym",
            "/data",
            "group",
            "--deid",
            "blur",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_dashed_options() {
        let args = Args::try_parse_from([
            "bidsonym",
            "/data",
            "group",
            "--deid",
            "pydeface",
            "--brainextraction",
            "nobrainer",
            "--fail-fast",
            "--jobs",
            "4",
            "--tool-timeout",
            "60",
            "--inspect-metadata",
            "--keyword-match",
            "substring",
        ])
        .unwrap();
        let config = args.into_options().validate().unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.jobs, 4);
        assert_eq!(config.tool_timeout, Duration::from_secs(60));
        assert_eq!(
            config.settings.inspect.unwrap().mode,
            KeywordMatch::Substring
        );
    }

    #[test]
    fn test_exit_code_mapping() {
        let err = anyhow::Error::from(BidsonymError::config("x"));
        assert_eq!(exit_code_for(&err), 2);
        let err = anyhow::Error::from(BidsonymError::Cancelled).context("running");
        assert_eq!(exit_code_for(&err), 130);
        let err = anyhow::anyhow!("plain failure");
        assert_eq!(exit_code_for(&err), 1);
    }
}
