// ABOUTME: Decides between a retroactive (full) and an incremental run
// ABOUTME: Any single trigger forces retroactive mode; triggers are kept for logging and status details

use serde::{Deserialize, Serialize};
use std::fmt;

use super::schema::SchemaCheck;
use crate::status::RunStatus;
use crate::table::KeySet;

/// How a run moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    /// Replace destination contents with source contents
    Retroactive,
    /// Apply key-set differences and recently updated rows
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Retroactive => f.write_str("RETROACTIVE"),
            SyncMode::Incremental => f.write_str("INCREMENTAL"),
        }
    }
}

/// Reason a run was forced to be retroactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    CliOverride,
    ConfigFlag,
    Bootstrap,
    DestinationMissing,
    ColumnMismatch {
        only_in_source: Vec<String>,
        only_in_destination: Vec<String>,
    },
    /// Destination keys differ from the last successful snapshot
    DestinationDrift {
        missing: usize,
        unexpected: usize,
    },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::CliOverride => f.write_str("retroactive requested on the command line"),
            Trigger::ConfigFlag => f.write_str("retroactive set in the profile"),
            Trigger::Bootstrap => f.write_str("no previous successful run"),
            Trigger::DestinationMissing => f.write_str("destination table does not exist"),
            Trigger::ColumnMismatch {
                only_in_source,
                only_in_destination,
            } => write!(
                f,
                "column mismatch (only in source: {:?}, only in destination: {:?})",
                only_in_source, only_in_destination
            ),
            Trigger::DestinationDrift {
                missing,
                unexpected,
            } => write!(
                f,
                "destination changed since last success ({} keys missing, {} unexpected)",
                missing, unexpected
            ),
        }
    }
}

/// Everything known before any data is read.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub cli_override: bool,
    pub config_retroactive: bool,
    pub prior: Option<&'a RunStatus>,
    pub schema: &'a SchemaCheck,
}

/// Outcome of the decision; retroactive exactly when a trigger fired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    triggers: Vec<Trigger>,
}

impl Decision {
    pub fn mode(&self) -> SyncMode {
        if self.triggers.is_empty() {
            SyncMode::Incremental
        } else {
            SyncMode::Retroactive
        }
    }

    pub fn is_retroactive(&self) -> bool {
        self.mode() == SyncMode::Retroactive
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn force(&mut self, trigger: Trigger) {
        tracing::info!("Requiring retroactive replication: {}", trigger);
        self.triggers.push(trigger);
    }
}

/// Evaluate the triggers that need no table data.
///
/// A prior status that never recorded a success counts as bootstrap: there
/// is no timestamp to compute an incremental threshold from.
pub fn decide(inputs: &DecisionInputs<'_>) -> Decision {
    let mut decision = Decision::default();

    if inputs.cli_override {
        decision.force(Trigger::CliOverride);
    }
    if inputs.config_retroactive {
        decision.force(Trigger::ConfigFlag);
    }
    if !inputs.prior.is_some_and(RunStatus::has_baseline) {
        decision.force(Trigger::Bootstrap);
    }
    if let Some(trigger) = inputs.schema.trigger() {
        decision.force(trigger);
    }

    decision
}

/// Re-validate the stored baseline against the live destination keys.
///
/// Runs only on the incremental path. Any difference means the destination
/// was changed out-of-band or the last run did not finish as recorded.
pub fn check_baseline(baseline: &KeySet, current: &KeySet) -> Option<Trigger> {
    if baseline == current {
        return None;
    }
    Some(Trigger::DestinationDrift {
        missing: baseline.difference(current).count(),
        unexpected: current.difference(baseline).count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{RunOutcome, STATUS_VERSION};
    use crate::table::PrimaryKey;
    use chrono::{NaiveDateTime, Utc};

    fn prior(successful: bool) -> RunStatus {
        RunStatus {
            version: STATUS_VERSION,
            profile: "orders".to_string(),
            table: "orders".to_string(),
            last_attempt: Utc::now(),
            last_status: Some(if successful {
                RunOutcome::Success
            } else {
                RunOutcome::Exception
            }),
            last_status_details: String::new(),
            last_successful_attempt: successful.then(|| {
                NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S")
                    .unwrap()
            }),
            last_success_dest_row_count: None,
            last_success_pks: KeySet::new(),
            last_mode: None,
            last_counts: None,
        }
    }

    fn inputs<'a>(prior: Option<&'a RunStatus>, schema: &'a SchemaCheck) -> DecisionInputs<'a> {
        DecisionInputs {
            cli_override: false,
            config_retroactive: false,
            prior,
            schema,
        }
    }

    #[test]
    fn test_bootstrap_always_retroactive() {
        let schema = SchemaCheck::Compatible;
        let decision = decide(&inputs(None, &schema));
        assert!(decision.is_retroactive());
        assert_eq!(decision.triggers(), &[Trigger::Bootstrap]);
    }

    #[test]
    fn test_prior_without_success_is_bootstrap() {
        let schema = SchemaCheck::Compatible;
        let failed = prior(false);
        let decision = decide(&inputs(Some(&failed), &schema));
        assert_eq!(decision.triggers(), &[Trigger::Bootstrap]);
    }

    #[test]
    fn test_incremental_when_nothing_triggers() {
        let schema = SchemaCheck::Compatible;
        let ok = prior(true);
        let decision = decide(&inputs(Some(&ok), &schema));
        assert_eq!(decision.mode(), SyncMode::Incremental);
        assert!(decision.triggers().is_empty());
    }

    #[test]
    fn test_column_mismatch_forces_retroactive_without_flags() {
        let schema = SchemaCheck::Mismatch {
            only_in_source: vec!["email".to_string()],
            only_in_destination: vec![],
        };
        let ok = prior(true);
        let decision = decide(&inputs(Some(&ok), &schema));
        assert!(decision.is_retroactive());
        assert!(matches!(
            decision.triggers(),
            [Trigger::ColumnMismatch { .. }]
        ));
    }

    #[test]
    fn test_flags_each_force_retroactive() {
        let schema = SchemaCheck::Compatible;
        let ok = prior(true);

        let mut cli = inputs(Some(&ok), &schema);
        cli.cli_override = true;
        assert_eq!(decide(&cli).triggers(), &[Trigger::CliOverride]);

        let mut config = inputs(Some(&ok), &schema);
        config.config_retroactive = true;
        assert_eq!(decide(&config).triggers(), &[Trigger::ConfigFlag]);
    }

    #[test]
    fn test_all_triggers_collected() {
        let schema = SchemaCheck::Missing;
        let decision = decide(&DecisionInputs {
            cli_override: true,
            config_retroactive: true,
            prior: None,
            schema: &schema,
        });
        assert_eq!(decision.triggers().len(), 4);
    }

    #[test]
    fn test_check_baseline() {
        let keys = |ids: &[i64]| -> KeySet { ids.iter().map(|i| PrimaryKey::Int(*i)).collect() };
        assert_eq!(check_baseline(&keys(&[1, 2]), &keys(&[1, 2])), None);
        assert_eq!(
            check_baseline(&keys(&[1, 2, 3]), &keys(&[1, 2, 4, 5])),
            Some(Trigger::DestinationDrift {
                missing: 1,
                unexpected: 2
            })
        );
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(SyncMode::Retroactive.to_string(), "RETROACTIVE");
        assert_eq!(SyncMode::Incremental.to_string(), "INCREMENTAL");
    }
}
