// ABOUTME: Computes incremental deltas from primary-key sets and an update threshold
// ABOUTME: to_delete / to_insert come from set differences, to_update from the incremental field

use chrono::NaiveDateTime;

use crate::config::Offset;
use crate::error::{Side, SyncError, SyncResult};
use crate::table::{Comparison, KeySet, PrimaryKey, Projection, Row, TableReader, Value};

/// Insert and delete candidates derived from key sets alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDelta {
    /// In the previous destination state but gone from the source
    pub to_delete: KeySet,
    /// In the source but not in the previous destination state
    pub to_insert: KeySet,
}

/// Everything the applier needs for one incremental run.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalPlan {
    pub to_delete: KeySet,
    pub insert_rows: Vec<Row>,
    /// Source rows modified after `threshold`; may overlap `insert_rows`
    pub update_rows: Vec<Row>,
    pub threshold: NaiveDateTime,
}

/// Split source and previous destination keys into delete and insert sets.
///
/// The two sets are disjoint, and `to_insert` together with the keys both
/// sides share is exactly the source key set.
pub fn key_delta(source: &KeySet, previous: &KeySet) -> KeyDelta {
    KeyDelta {
        to_delete: previous.difference(source).cloned().collect(),
        to_insert: source.difference(previous).cloned().collect(),
    }
}

/// Lookback threshold for detecting updated rows.
///
/// Fails instead of guessing when no successful timestamp exists.
pub fn adjusted_threshold(
    last_successful_attempt: Option<NaiveDateTime>,
    offset: Offset,
) -> SyncResult<NaiveDateTime> {
    let last = last_successful_attempt.ok_or_else(|| {
        SyncError::InvariantViolation(
            "incremental threshold requested without a previous successful run".to_string(),
        )
    })?;
    last.checked_sub_signed(offset.as_duration()).ok_or_else(|| {
        SyncError::InvariantViolation(format!(
            "offset of {}h{}m underflows last successful timestamp {}",
            offset.hours, offset.minutes, last
        ))
    })
}

/// Read the rows an incremental run will write.
pub async fn plan_incremental<S: TableReader>(
    source: &mut S,
    projection: &Projection,
    source_keys: &KeySet,
    previous_keys: &KeySet,
    threshold: NaiveDateTime,
) -> SyncResult<IncrementalPlan> {
    let KeyDelta {
        to_delete,
        to_insert,
    } = key_delta(source_keys, previous_keys);

    let insert_keys: Vec<PrimaryKey> = to_insert.into_iter().collect();
    let insert_rows = if insert_keys.is_empty() {
        Vec::new()
    } else {
        source
            .fetch_rows_by_keys(projection, &insert_keys)
            .await
            .map_err(|e| SyncError::query(Side::Source, e))?
    };

    tracing::info!(
        "Selecting rows with {} after {}",
        projection.incremental_field(),
        threshold
    );
    let update_rows = source
        .fetch_rows_where(
            projection,
            projection.incremental_field(),
            Comparison::Greater,
            &Value::Timestamp(threshold),
        )
        .await
        .map_err(|e| SyncError::query(Side::Source, e))?;

    tracing::info!(
        "Planned {} deletes, {} inserts and {} updates",
        to_delete.len(),
        insert_rows.len(),
        update_rows.len()
    );

    Ok(IncrementalPlan {
        to_delete,
        insert_rows,
        update_rows,
        threshold,
    })
}
