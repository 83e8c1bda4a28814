// ABOUTME: Applies a full copy or an incremental plan to the destination in one transaction
// ABOUTME: Commits only when every step succeeded; any failure rolls the whole batch back

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::differ::IncrementalPlan;
use crate::error::{SyncError, SyncResult};
use crate::table::{Projection, Row, TableWriter};

/// Row-level changes made by one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCounts {
    pub inserted: u64,
    pub deleted: u64,
    pub updated: u64,
}

impl ApplyCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.deleted + self.updated
    }
}

/// Replace the destination contents with `rows`.
///
/// With `recreate` the table is dropped and created from the projection
/// first; otherwise existing rows are deleted. Either way the destination
/// key set equals the source key set afterwards.
pub async fn apply_full<D: TableWriter>(
    destination: &mut D,
    projection: &Projection,
    rows: &[Row],
    recreate: bool,
) -> SyncResult<ApplyCounts> {
    tracing::info!("Performing retroactive replication of {} rows", rows.len());
    begin(destination).await?;

    let result = async {
        let mut counts = ApplyCounts::default();
        if recreate {
            destination
                .recreate_table(projection)
                .await
                .context("Failed to recreate destination table")?;
        } else {
            counts.deleted = destination
                .delete_all()
                .await
                .context("Failed to clear destination table")?;
        }
        counts.inserted = destination
            .insert_rows(projection, rows)
            .await
            .context("Failed to copy source rows")?;
        Ok::<_, anyhow::Error>(counts)
    }
    .await;

    finish(destination, result).await
}

/// Apply an incremental plan: deletes, then inserts, then updates.
///
/// Updates are delete-then-insert by primary key. An update row that was
/// also inserted in this batch is simply replaced again.
pub async fn apply_incremental<D: TableWriter>(
    destination: &mut D,
    projection: &Projection,
    plan: &IncrementalPlan,
) -> SyncResult<ApplyCounts> {
    tracing::info!("Performing incremental replication");
    begin(destination).await?;

    let result = async {
        let primary_key = projection.primary_key();
        let mut counts = ApplyCounts::default();

        for key in &plan.to_delete {
            counts.deleted += destination
                .delete_by_pk(primary_key, key)
                .await
                .with_context(|| format!("Failed to delete record {}", key))?;
            tracing::debug!("Deleted key {}", key);
        }
        tracing::info!("Deleted {} rows", counts.deleted);

        counts.inserted = destination
            .insert_rows(projection, &plan.insert_rows)
            .await
            .context("Failed to insert new records")?;
        tracing::info!("Inserted {} rows", counts.inserted);

        for row in &plan.update_rows {
            let key = projection.key_of(row)?;
            destination
                .delete_by_pk(primary_key, &key)
                .await
                .with_context(|| format!("Failed to replace record {}", key))?;
            tracing::debug!("Replacing key {}", key);
        }
        destination
            .insert_rows(projection, &plan.update_rows)
            .await
            .context("Failed to insert updated records")?;
        counts.updated = plan.update_rows.len() as u64;
        tracing::info!("Updated {} rows", counts.updated);

        Ok::<_, anyhow::Error>(counts)
    }
    .await;

    finish(destination, result).await
}

async fn begin<D: TableWriter>(destination: &mut D) -> SyncResult<()> {
    destination
        .begin_transaction()
        .await
        .context("Failed to begin destination transaction")
        .map_err(SyncError::Transaction)
}

async fn finish<D: TableWriter>(
    destination: &mut D,
    result: anyhow::Result<ApplyCounts>,
) -> SyncResult<ApplyCounts> {
    match result {
        Ok(counts) => match destination.commit().await {
            Ok(()) => {
                tracing::info!(
                    "Committed {} inserts, {} deletes and {} updates",
                    counts.inserted,
                    counts.deleted,
                    counts.updated
                );
                Ok(counts)
            }
            Err(e) => {
                rollback(destination).await;
                Err(SyncError::Transaction(
                    e.context("Failed to commit destination transaction"),
                ))
            }
        },
        Err(e) => {
            tracing::error!("Applying changes failed, rolling back: {:#}", e);
            rollback(destination).await;
            Err(SyncError::Transaction(e))
        }
    }
}

async fn rollback<D: TableWriter>(destination: &mut D) {
    if let Err(e) = destination.rollback().await {
        // The driver discards an unfinished transaction when the connection closes
        tracing::error!("Rollback failed: {:#}", e);
    }
}
