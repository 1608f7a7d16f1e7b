//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tagsync_core::{Config, SyncMode};

/// Synchronize role tags onto the customer-managed policies they reference.
#[derive(Parser, Debug)]
#[command(name = "tagsync", version, about)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, short = 'c', global = true, env = "TAGSYNC_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log output format (logs go to stderr).
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = LogFormat::Pretty,
        env = "TAGSYNC_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per event.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one synchronization pass and print its summary as JSON.
    Run(RunArgs),
    /// Print the changes a run would make, one JSON line per policy.
    Plan(PlanArgs),
    /// Validate configuration and print the effective settings.
    CheckConfig,
}

/// Flags shared by `run` and `plan`.
#[derive(Args, Debug, Default)]
pub struct ScopeArgs {
    /// Only sync the named policy. Repeatable.
    #[arg(long = "policy", value_name = "NAME")]
    pub policies: Vec<String>,

    /// `authoritative` removes policy tags no role carries; `additive` never removes.
    #[arg(long, value_name = "MODE")]
    pub mode: Option<SyncMode>,
}

impl ScopeArgs {
    fn apply(&self, config: &mut Config) {
        if !self.policies.is_empty() {
            config.engine.target_policies.clone_from(&self.policies);
        }
        if let Some(mode) = self.mode {
            config.engine.mode = mode;
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Plan and log, but never write tags.
    #[arg(long)]
    pub dry_run: bool,

    /// Policies processed at once.
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Exit with status 2 when any policy failed.
    #[arg(long)]
    pub fail_on_errors: bool,
}

impl RunArgs {
    /// Overlay flags onto file and environment settings.
    pub fn apply(&self, config: &mut Config) {
        self.scope.apply(config);
        if self.dry_run {
            config.engine.dry_run = true;
        }
        if let Some(concurrency) = self.concurrency {
            config.engine.concurrency = concurrency;
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct PlanArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,
}

impl PlanArgs {
    pub fn apply(&self, config: &mut Config) {
        self.scope.apply(config);
    }
}
