// ABOUTME: Builds the next run status from a finished run
// ABOUTME: Success replaces the baseline from a post-commit snapshot; failure carries the baseline over untouched

use chrono::{DateTime, Local, NaiveDateTime, Utc};

use super::applier::ApplyCounts;
use super::decision::SyncMode;
use super::RunContext;
use crate::error::{Side, SyncError, SyncResult};
use crate::status::{RunOutcome, RunStatus, STATUS_VERSION};
use crate::table::value::wall_clock;
use crate::table::{KeySet, Projection, TableReader};

/// Destination state read right after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostCommitSnapshot {
    pub row_count: u64,
    pub keys: KeySet,
    /// Largest incremental-field value now in the destination
    pub max_incremental: Option<NaiveDateTime>,
}

/// Read the destination state the next run will validate against.
pub async fn snapshot<D: TableReader>(
    destination: &mut D,
    projection: &Projection,
) -> SyncResult<PostCommitSnapshot> {
    let read = |e| SyncError::query(Side::Destination, e);
    let row_count = destination.row_count().await.map_err(read)?;
    let keys = destination
        .fetch_primary_keys(projection.key_column())
        .await
        .map_err(read)?;
    let max_incremental = destination
        .max_timestamp(projection.incremental_field())
        .await
        .map_err(read)?;
    Ok(PostCommitSnapshot {
        row_count,
        keys,
        max_incremental,
    })
}

/// Status after a committed run.
///
/// A retroactive run anchors the next threshold at the local wall clock; an
/// incremental run anchors it at the newest incremental value it left in
/// the destination, keeping the previous anchor when there is none.
pub fn on_success(
    ctx: &RunContext,
    mode: SyncMode,
    counts: ApplyCounts,
    snapshot: PostCommitSnapshot,
    finished_at: DateTime<Utc>,
) -> RunStatus {
    let last_successful_attempt = match mode {
        SyncMode::Retroactive => Some(wall_clock(finished_at, &Local)),
        SyncMode::Incremental => snapshot.max_incremental.or_else(|| {
            ctx.prior
                .as_ref()
                .and_then(|prior| prior.last_successful_attempt)
        }),
    };

    RunStatus {
        version: STATUS_VERSION,
        profile: ctx.profile_name.clone(),
        table: ctx.profile.table.clone(),
        last_attempt: finished_at,
        last_status: Some(RunOutcome::Success),
        last_status_details: format!(
            "{} replication of {} complete: {} inserted, {} deleted, {} updated; \
             {} rows in destination",
            mode,
            ctx.profile.table,
            counts.inserted,
            counts.deleted,
            counts.updated,
            snapshot.row_count
        ),
        last_successful_attempt,
        last_success_dest_row_count: Some(snapshot.row_count),
        last_success_pks: snapshot.keys,
        last_mode: Some(mode),
        last_counts: Some(counts),
    }
}

/// Status after a failed run: only the attempt fields change.
pub fn on_failure(ctx: &RunContext, error: &SyncError, finished_at: DateTime<Utc>) -> RunStatus {
    let details = error.to_string();
    match &ctx.prior {
        Some(prior) => RunStatus {
            last_attempt: finished_at,
            last_status: Some(error.outcome()),
            last_status_details: details,
            ..prior.clone()
        },
        None => RunStatus {
            version: STATUS_VERSION,
            profile: ctx.profile_name.clone(),
            table: ctx.profile.table.clone(),
            last_attempt: finished_at,
            last_status: Some(error.outcome()),
            last_status_details: details,
            last_successful_attempt: None,
            last_success_dest_row_count: None,
            last_success_pks: KeySet::new(),
            last_mode: None,
            last_counts: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatorConfig;
    use crate::table::PrimaryKey;

    const CONFIG: &str = r#"
[profiles.orders]
table = "orders"
primary_key = "id"
incremental_field = "updated_at"

[profiles.orders.source]
connection = "/tmp/source.db"

[profiles.orders.destination]
connection = "/tmp/destination.db"
"#;

    fn ts(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn keys(ids: &[i64]) -> KeySet {
        ids.iter().map(|i| PrimaryKey::Int(*i)).collect()
    }

    fn context(prior: Option<RunStatus>) -> RunContext {
        let config = ReplicatorConfig::parse(CONFIG).unwrap();
        let profile = config.profile("orders").unwrap().clone();
        RunContext::new("orders", profile, false, prior)
    }

    fn snapshot(ids: &[i64], max: Option<&str>) -> PostCommitSnapshot {
        PostCommitSnapshot {
            row_count: ids.len() as u64,
            keys: keys(ids),
            max_incremental: max.map(ts),
        }
    }

    #[test]
    fn test_success_after_full_sync_anchors_at_now() {
        let ctx = context(None);
        let now = Utc::now();
        let status = on_success(
            &ctx,
            SyncMode::Retroactive,
            ApplyCounts {
                inserted: 3,
                ..Default::default()
            },
            snapshot(&[1, 2, 3], Some("2020-01-01 00:00:00")),
            now,
        );
        assert_eq!(status.last_status, Some(RunOutcome::Success));
        assert_eq!(
            status.last_successful_attempt,
            Some(wall_clock(now, &Local))
        );
        assert_eq!(status.last_success_dest_row_count, Some(3));
        assert_eq!(status.last_success_pks, keys(&[1, 2, 3]));
        assert_eq!(status.last_mode, Some(SyncMode::Retroactive));
    }

    #[test]
    fn test_success_after_incremental_anchors_at_destination_max() {
        let first = on_success(
            &context(None),
            SyncMode::Retroactive,
            ApplyCounts::default(),
            snapshot(&[1], None),
            Utc::now(),
        );
        let ctx = context(Some(first));
        let status = on_success(
            &ctx,
            SyncMode::Incremental,
            ApplyCounts::default(),
            snapshot(&[1, 2], Some("2024-02-02 09:00:00")),
            Utc::now(),
        );
        assert_eq!(
            status.last_successful_attempt,
            Some(ts("2024-02-02 09:00:00"))
        );
    }

    #[test]
    fn test_incremental_without_destination_max_keeps_anchor() {
        let mut prior = on_success(
            &context(None),
            SyncMode::Retroactive,
            ApplyCounts::default(),
            snapshot(&[], None),
            Utc::now(),
        );
        prior.last_successful_attempt = Some(ts("2024-01-01 00:00:00"));
        let ctx = context(Some(prior));
        let status = on_success(
            &ctx,
            SyncMode::Incremental,
            ApplyCounts::default(),
            snapshot(&[], None),
            Utc::now(),
        );
        assert_eq!(
            status.last_successful_attempt,
            Some(ts("2024-01-01 00:00:00"))
        );
    }

    #[test]
    fn test_failure_preserves_baseline() {
        let prior = on_success(
            &context(None),
            SyncMode::Retroactive,
            ApplyCounts::default(),
            snapshot(&[1, 2], None),
            Utc::now(),
        );
        let ctx = context(Some(prior.clone()));
        let error = SyncError::Transaction(anyhow::anyhow!("disk full"));
        let failed_at = Utc::now();
        let status = on_failure(&ctx, &error, failed_at);

        assert_eq!(status.last_attempt, failed_at);
        assert_eq!(status.last_status, Some(RunOutcome::Exception));
        assert!(status.last_status_details.contains("disk full"));
        assert_eq!(status.last_success_pks, prior.last_success_pks);
        assert_eq!(
            status.last_success_dest_row_count,
            prior.last_success_dest_row_count
        );
        assert_eq!(
            status.last_successful_attempt,
            prior.last_successful_attempt
        );
        assert_eq!(status.last_mode, prior.last_mode);
    }

    #[test]
    fn test_failure_on_first_run_has_no_baseline() {
        let ctx = context(None);
        let error = SyncError::InvariantViolation("broken".into());
        let status = on_failure(&ctx, &error, Utc::now());
        assert_eq!(status.last_status, Some(RunOutcome::Error));
        assert!(!status.has_baseline());
        assert!(status.last_success_pks.is_empty());
        assert_eq!(status.profile, "orders");
    }
}
