//! Subcommand implementations.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use serde::Serialize;
use tagsync_core::lease::{LeaseError, RunLease, current_holder};
use tagsync_core::{
    Config, Enumerator, ResourceStore, RunCoordinator, TagMutationPlan, plan_with_mode, resolve,
};
use tagsync_http::HttpResourceStore;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::RunArgs;

/// Fatal error: bad configuration, discovery failure, unusable store.
pub const EXIT_FATAL: u8 = 1;
/// Run completed but some policies failed, and `--fail-on-errors` was given.
pub const EXIT_FAILURES: u8 = 2;
/// Another run holds the lease.
pub const EXIT_LEASE_HELD: u8 = 3;

/// `tagsync run`
pub async fn run(config: &Config, args: &RunArgs) -> Result<ExitCode> {
    let run_id = Uuid::new_v4();

    let _lease = if config.lease.enabled {
        match RunLease::acquire(&config.lease.dir, &config.lease.key, run_id) {
            Ok(lease) => Some(lease),
            Err(err @ (LeaseError::Held { .. } | LeaseError::HeldNoMeta { .. })) => {
                warn!(error = %err, "Another run is in progress; skipping");
                return Ok(ExitCode::from(EXIT_LEASE_HELD));
            }
            Err(err) => return Err(err).context("failed to acquire run lease"),
        }
    } else {
        None
    };

    let store = HttpResourceStore::new(&config.store)
        .context("failed to build store client")?
        .with_run_id(run_id);
    let store: Arc<dyn ResourceStore> = Arc::new(store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        if wait_for_shutdown_signal().await.is_ok() {
            warn!("Shutdown requested; finishing in-flight policies");
            let _ = shutdown_tx.send(true);
        }
    });

    let coordinator = RunCoordinator::new(store, config.retry_policy(), config.engine_options())
        .with_shutdown(shutdown_rx);
    let result = coordinator.run_once_with_id(run_id).await;
    signal.abort();

    let summary = result.context("policy discovery failed; no policy was changed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if args.fail_on_errors && summary.has_failures() {
        return Ok(ExitCode::from(EXIT_FAILURES));
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct PlannedChange<'a> {
    policy_name: &'a str,
    #[serde(flatten)]
    plan: &'a TagMutationPlan,
}

/// `tagsync plan`
pub async fn plan(config: &Config) -> Result<ExitCode> {
    let store: Arc<dyn ResourceStore> =
        Arc::new(HttpResourceStore::new(&config.store).context("failed to build store client")?);
    let options = config.engine_options();
    let enumerator =
        Enumerator::new(store, config.retry_policy()).with_targets(options.targets.iter().cloned());

    let mut bindings = Box::pin(enumerator.enumerate());
    let mut pending = 0usize;
    while let Some(binding) = bindings
        .try_next()
        .await
        .context("policy discovery failed")?
    {
        let target = resolve(&binding.roles);
        let plan = plan_with_mode(&binding.policy, &target, options.mode);
        if plan.is_noop() {
            continue;
        }
        pending += 1;
        let line = PlannedChange {
            policy_name: &binding.policy.name,
            plan: &plan,
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    info!(pending, "Plan complete");
    Ok(ExitCode::SUCCESS)
}

/// `tagsync check-config`
pub fn check_config(config: &Config) -> Result<ExitCode> {
    if config.lease.enabled {
        match current_holder(&config.lease.dir, &config.lease.key) {
            Some(holder) => info!(
                key = %config.lease.key,
                run_id = %holder.run_id,
                pid = holder.pid,
                acquired_at = %holder.acquired_at,
                "Run lease is currently held"
            ),
            None => info!(key = %config.lease.key, "Run lease is free"),
        }
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        Ok(())
    }
}
