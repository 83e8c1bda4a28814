// ABOUTME: Explicit column projection applied to every replicated row
// ABOUTME: Restricts a table to the selected fields and locates the key and incremental columns

use anyhow::{Context, Result};
use std::collections::HashSet;

use super::{ColumnDef, PrimaryKey, Row};
use crate::error::SyncError;

/// The columns a profile replicates, in source declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    columns: Vec<ColumnDef>,
    key_index: usize,
    incremental_index: usize,
}

impl Projection {
    /// Build the projection of `source_columns` onto `selected_fields`.
    ///
    /// `None`, an empty list, or `["*"]` select every column. The primary key
    /// and the incremental field must survive the projection.
    pub fn new(
        source_columns: &[ColumnDef],
        selected_fields: Option<&[String]>,
        primary_key: &str,
        incremental_field: &str,
    ) -> Result<Self, SyncError> {
        let columns: Vec<ColumnDef> = match selected_fields {
            Some(fields) if !selects_everything(fields) => {
                let known: HashSet<&str> =
                    source_columns.iter().map(|c| c.name.as_str()).collect();
                if let Some(missing) = fields.iter().find(|f| !known.contains(f.as_str())) {
                    return Err(SyncError::configuration(format!(
                        "selected field '{}' does not exist in the source table",
                        missing
                    )));
                }
                source_columns
                    .iter()
                    .filter(|c| fields.iter().any(|f| f == &c.name))
                    .cloned()
                    .collect()
            }
            _ => source_columns.to_vec(),
        };

        let position = |name: &str| columns.iter().position(|c| c.name == name);
        let key_index = position(primary_key).ok_or_else(|| {
            SyncError::configuration(format!(
                "primary key column '{}' is not part of the replicated columns",
                primary_key
            ))
        })?;
        let incremental_index = position(incremental_field).ok_or_else(|| {
            SyncError::configuration(format!(
                "incremental field '{}' is not part of the replicated columns",
                incremental_field
            ))
        })?;

        Ok(Self {
            columns,
            key_index,
            incremental_index,
        })
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn primary_key(&self) -> &str {
        &self.columns[self.key_index].name
    }

    pub fn key_column(&self) -> &ColumnDef {
        &self.columns[self.key_index]
    }

    pub fn incremental_field(&self) -> &str {
        &self.columns[self.incremental_index].name
    }

    /// Primary key of a row fetched with this projection.
    pub fn key_of(&self, row: &Row) -> Result<PrimaryKey> {
        let value = row
            .get(self.key_index)
            .context("row is shorter than the projection")?;
        PrimaryKey::from_value(value).with_context(|| {
            format!("invalid value in primary key column '{}'", self.primary_key())
        })
    }
}

fn selects_everything(fields: &[String]) -> bool {
    fields.is_empty() || (fields.len() == 1 && fields[0].trim() == "*")
}
