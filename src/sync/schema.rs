// ABOUTME: Schema reconciliation between the projected source columns and the destination table
// ABOUTME: A missing table or a different column set forces a retroactive run with re-creation

use std::collections::BTreeSet;

use super::decision::Trigger;
use crate::error::{Side, SyncError, SyncResult};
use crate::table::{ColumnDef, Projection, TableReader};

/// How the destination table relates to the projected source columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCheck {
    Compatible,
    Missing,
    Mismatch {
        only_in_source: Vec<String>,
        only_in_destination: Vec<String>,
    },
}

impl SchemaCheck {
    /// Compare column names; `None` means the destination table is absent.
    pub fn compare(projection: &Projection, destination: Option<&[ColumnDef]>) -> Self {
        let Some(destination) = destination else {
            return SchemaCheck::Missing;
        };

        let source: BTreeSet<&str> = projection.column_names().collect();
        let dest: BTreeSet<&str> = destination.iter().map(|c| c.name.as_str()).collect();

        let only_in_source: Vec<String> =
            source.difference(&dest).map(|s| s.to_string()).collect();
        let only_in_destination: Vec<String> =
            dest.difference(&source).map(|s| s.to_string()).collect();

        if only_in_source.is_empty() && only_in_destination.is_empty() {
            SchemaCheck::Compatible
        } else {
            SchemaCheck::Mismatch {
                only_in_source,
                only_in_destination,
            }
        }
    }

    /// Retroactive trigger raised by this result, if any.
    pub fn trigger(&self) -> Option<Trigger> {
        match self {
            SchemaCheck::Compatible => None,
            SchemaCheck::Missing => Some(Trigger::DestinationMissing),
            SchemaCheck::Mismatch {
                only_in_source,
                only_in_destination,
            } => Some(Trigger::ColumnMismatch {
                only_in_source: only_in_source.clone(),
                only_in_destination: only_in_destination.clone(),
            }),
        }
    }

    /// Whether the destination must be dropped and created from the projection.
    pub fn needs_recreate(&self) -> bool {
        !matches!(self, SchemaCheck::Compatible)
    }
}

/// Inspect the destination table.
pub async fn reconcile<D: TableReader>(
    projection: &Projection,
    destination: &mut D,
) -> SyncResult<SchemaCheck> {
    let exists = destination
        .table_exists()
        .await
        .map_err(|e| SyncError::query(Side::Destination, e))?;

    let check = if exists {
        let columns = destination
            .columns()
            .await
            .map_err(|e| SyncError::query(Side::Destination, e))?;
        SchemaCheck::compare(projection, Some(&columns))
    } else {
        SchemaCheck::Missing
    };

    match &check {
        SchemaCheck::Compatible => tracing::info!("Destination columns match the source"),
        SchemaCheck::Missing => tracing::info!("Destination table does not exist"),
        SchemaCheck::Mismatch {
            only_in_source,
            only_in_destination,
        } => tracing::info!(
            "Destination columns differ (only in source: {:?}, only in destination: {:?})",
            only_in_source,
            only_in_destination
        ),
    }

    Ok(check)
}
