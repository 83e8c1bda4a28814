// ABOUTME: Single-table replication run: decide, diff, apply, finalize, persist
// ABOUTME: Every run ends in exactly one status write, whether it succeeded or failed

pub mod applier;
pub mod decision;
pub mod differ;
pub mod finalizer;
pub mod schema;

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;

pub use applier::{apply_full, apply_incremental, ApplyCounts};
pub use decision::{check_baseline, decide, Decision, DecisionInputs, SyncMode, Trigger};
pub use differ::{adjusted_threshold, key_delta, plan_incremental, IncrementalPlan, KeyDelta};
pub use finalizer::PostCommitSnapshot;
pub use schema::SchemaCheck;

use crate::backend;
use crate::config::ProfileConfig;
use crate::error::{Side, SyncError, SyncResult};
use crate::status::{RunStatus, StatusStore};
use crate::table::{Projection, TableReader, TableWriter};

/// Everything one run knows up front, threaded through every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub profile_name: String,
    pub profile: ProfileConfig,
    /// `--retroactive` on the command line
    pub force_retroactive: bool,
    /// Status written by the previous run, if any
    pub prior: Option<RunStatus>,
}

impl RunContext {
    pub fn new(
        profile_name: impl Into<String>,
        profile: ProfileConfig,
        force_retroactive: bool,
        prior: Option<RunStatus>,
    ) -> Self {
        Self {
            profile_name: profile_name.into(),
            profile,
            force_retroactive,
            prior,
        }
    }
}

/// What a finished run did, alongside the status it persisted.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: SyncMode,
    pub triggers: Vec<Trigger>,
    pub counts: ApplyCounts,
    pub status: RunStatus,
}

struct Completed {
    mode: SyncMode,
    triggers: Vec<Trigger>,
    counts: ApplyCounts,
    snapshot: PostCommitSnapshot,
}

/// Run one profile end to end against live databases.
///
/// The previous status is read first; if that read fails nothing is written,
/// since a failure record built without it would erase the baseline.
pub async fn run_profile(
    profile_name: &str,
    profile: &ProfileConfig,
    store: &StatusStore,
    force_retroactive: bool,
) -> SyncResult<RunReport> {
    let prior = store.load(profile_name)?;
    let ctx = RunContext::new(profile_name, profile.clone(), force_retroactive, prior);

    tracing::info!("Starting replication of table {}", profile.table);

    let outcome = async {
        let (mut source, mut destination) = tokio::try_join!(
            backend::connect(Side::Source, &profile.source, &profile.table),
            backend::connect(Side::Destination, &profile.destination, &profile.table),
        )?;
        guarded(&ctx, &mut source, &mut destination).await
    }
    .await;

    finish(&ctx, store, outcome)
}

/// Run one profile with already-open table handles.
pub async fn run_with<S, D>(
    ctx: &RunContext,
    store: &StatusStore,
    source: &mut S,
    destination: &mut D,
) -> SyncResult<RunReport>
where
    S: TableReader,
    D: TableWriter,
{
    let outcome = guarded(ctx, source, destination).await;
    finish(ctx, store, outcome)
}

/// Run `execute`, turning a panic into an `Unexpected` failure so it still
/// ends in a status write.
async fn guarded<S, D>(
    ctx: &RunContext,
    source: &mut S,
    destination: &mut D,
) -> SyncResult<Completed>
where
    S: TableReader,
    D: TableWriter,
{
    let outcome = AssertUnwindSafe(execute(ctx, source, destination))
        .catch_unwind()
        .await;
    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if let Err(e) = destination.rollback().await {
                tracing::warn!("No rollback after panic in {}: {:#}", ctx.profile.table, e);
            }
            Err(SyncError::Unexpected(anyhow::anyhow!(
                "replication panicked: {}",
                message
            )))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

fn finish(
    ctx: &RunContext,
    store: &StatusStore,
    outcome: SyncResult<Completed>,
) -> SyncResult<RunReport> {
    let finished_at = Utc::now();
    match outcome {
        Ok(done) => {
            let status =
                finalizer::on_success(ctx, done.mode, done.counts, done.snapshot, finished_at);
            store.save(&status)?;
            tracing::info!("Replication of table {} complete", ctx.profile.table);
            Ok(RunReport {
                mode: done.mode,
                triggers: done.triggers,
                counts: done.counts,
                status,
            })
        }
        Err(error) => {
            tracing::error!("Replication of {} failed: {}", ctx.profile.table, error);
            let status = finalizer::on_failure(ctx, &error, finished_at);
            if let Err(save_error) = store.save(&status) {
                tracing::error!("Failed to record failed run: {}", save_error);
            }
            Err(error)
        }
    }
}

async fn execute<S, D>(
    ctx: &RunContext,
    source: &mut S,
    destination: &mut D,
) -> SyncResult<Completed>
where
    S: TableReader,
    D: TableWriter,
{
    let profile = &ctx.profile;

    let source_exists = source
        .table_exists()
        .await
        .map_err(|e| SyncError::query(Side::Source, e))?;
    if !source_exists {
        return Err(SyncError::configuration(format!(
            "source table '{}' does not exist",
            profile.table
        )));
    }
    let source_columns = source
        .columns()
        .await
        .map_err(|e| SyncError::query(Side::Source, e))?;
    let projection = Projection::new(
        &source_columns,
        profile.selected_fields(),
        &profile.primary_key,
        &profile.incremental_field,
    )?;
    if profile.selected_fields().is_some() {
        tracing::info!(
            "Replicating selected columns only: {:?}",
            projection.column_names().collect::<Vec<_>>()
        );
    }

    let schema = schema::reconcile(&projection, destination).await?;
    let mut decision = decide(&DecisionInputs {
        cli_override: ctx.force_retroactive,
        config_retroactive: profile.retroactive,
        prior: ctx.prior.as_ref(),
        schema: &schema,
    });

    if !decision.is_retroactive() {
        let prior = ctx.prior.as_ref().ok_or_else(|| {
            SyncError::InvariantViolation("incremental run without a previous status".to_string())
        })?;

        let key = projection.key_column();
        let (source_keys, destination_keys) = tokio::try_join!(
            async {
                source
                    .fetch_primary_keys(key)
                    .await
                    .map_err(|e| SyncError::query(Side::Source, e))
            },
            async {
                destination
                    .fetch_primary_keys(key)
                    .await
                    .map_err(|e| SyncError::query(Side::Destination, e))
            },
        )?;

        match check_baseline(&prior.last_success_pks, &destination_keys) {
            Some(trigger) => decision.force(trigger),
            None => {
                let threshold =
                    adjusted_threshold(prior.last_successful_attempt, profile.offset)?;
                tracing::info!(
                    "Update threshold on {}: {} minus {}h{}m offset",
                    projection.incremental_field(),
                    prior.last_successful_attempt.map(|t| t.to_string()).unwrap_or_default(),
                    profile.offset.hours,
                    profile.offset.minutes
                );
                let plan = plan_incremental(
                    source,
                    &projection,
                    &source_keys,
                    &prior.last_success_pks,
                    threshold,
                )
                .await?;
                let counts = apply_incremental(destination, &projection, &plan).await?;
                let snapshot = finalizer::snapshot(destination, &projection).await?;
                return Ok(Completed {
                    mode: SyncMode::Incremental,
                    triggers: Vec::new(),
                    counts,
                    snapshot,
                });
            }
        }
    }

    let rows = source
        .fetch_all_rows(&projection)
        .await
        .map_err(|e| SyncError::query(Side::Source, e))?;
    let counts = apply_full(destination, &projection, &rows, schema.needs_recreate()).await?;
    let snapshot = finalizer::snapshot(destination, &projection).await?;

    Ok(Completed {
        mode: SyncMode::Retroactive,
        triggers: decision.triggers().to_vec(),
        counts,
        snapshot,
    })
}
