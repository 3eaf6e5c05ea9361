//! Core domain model for the retailer master sync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One `(retailer_id, retailer_name, network)` triple read from the source database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRetailer {
    pub retailer_id: String,
    pub retailer_name: Option<String>,
    pub network: Option<String>,
}

impl SourceRetailer {
    pub fn new(
        retailer_id: impl Into<String>,
        retailer_name: Option<&str>,
        network: Option<&str>,
    ) -> Self {
        Self {
            retailer_id: retailer_id.into(),
            retailer_name: retailer_name.map(str::to_string),
            network: network.map(str::to_string),
        }
    }

    fn attributes(&self) -> (Option<String>, Option<String>) {
        (self.retailer_name.clone(), self.network.clone())
    }
}

/// Persisted `retailer_master` row in the destination database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetailerMasterRow {
    pub retailer_id: String,
    pub retailer_name: Option<String>,
    pub network: Option<String>,
    pub first_seen_date: DateTime<Utc>,
    pub last_seen_date: DateTime<Utc>,
    pub last_sync_datetime: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// What a single upsert did to the destination row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Row existed with identical attributes; only the seen/sync timestamps moved.
    Touched,
    /// Row existed with identical attributes and nothing was written.
    Unchanged,
}

/// Whether `last_seen_date`/`last_sync_datetime` advance for rows whose
/// name and network did not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TouchPolicy {
    /// Every observation advances the seen/sync timestamps.
    #[default]
    Always,
    /// Identical rows are skipped entirely, timestamps included.
    OnChange,
}

impl TouchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnChange => "on-change",
        }
    }
}

impl fmt::Display for TouchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown touch policy `{0}` (expected `always` or `on-change`)")]
pub struct ParseTouchPolicyError(pub String);

impl FromStr for TouchPolicy {
    type Err = ParseTouchPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "on-change" | "on_change" | "legacy" => Ok(Self::OnChange),
            other => Err(ParseTouchPolicyError(other.to_string())),
        }
    }
}

/// Per-run tallies. `found` counts rows as returned by the source query,
/// `distinct` counts retailer ids after de-duplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub found: usize,
    pub distinct: usize,
    pub inserted: usize,
    pub updated: usize,
    pub touched: usize,
    pub unchanged: usize,
}

impl SyncCounts {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Touched => self.touched += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn applied(&self) -> usize {
        self.inserted + self.updated + self.touched + self.unchanged
    }
}

/// A retailer id that the source reported with more than one distinct
/// name/network pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateConflict {
    pub retailer_id: String,
    pub kept: (Option<String>, Option<String>),
    pub discarded: Vec<(Option<String>, Option<String>)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deduplicated {
    pub retailers: Vec<SourceRetailer>,
    pub conflicts: Vec<DuplicateConflict>,
}

/// Collapse source rows to exactly one row per `retailer_id`, ordered by id.
///
/// Contradictory duplicates resolve to the greatest `(retailer_name, network)`
/// pair, with `None` ordering before any value. The result does not depend on
/// the order the database returned the rows in.
pub fn dedupe_retailers(rows: impl IntoIterator<Item = SourceRetailer>) -> Deduplicated {
    let mut groups: BTreeMap<String, Vec<(Option<String>, Option<String>)>> = BTreeMap::new();
    for row in rows {
        let attrs = row.attributes();
        groups.entry(row.retailer_id).or_default().push(attrs);
    }

    let mut out = Deduplicated::default();
    for (retailer_id, mut pairs) in groups {
        pairs.sort();
        pairs.dedup();
        let Some(kept) = pairs.pop() else {
            continue;
        };
        if !pairs.is_empty() {
            out.conflicts.push(DuplicateConflict {
                retailer_id: retailer_id.clone(),
                kept: kept.clone(),
                discarded: pairs,
            });
        }
        out.retailers.push(SourceRetailer {
            retailer_id,
            retailer_name: kept.0,
            network: kept.1,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_duplicates_collapse_without_conflict() {
        let rows = vec![
            SourceRetailer::new("boots", Some("Boots"), Some("Awin")),
            SourceRetailer::new("boots", Some("Boots"), Some("Awin")),
            SourceRetailer::new("argos", Some("Argos"), None),
        ];
        let deduped = dedupe_retailers(rows);
        assert!(deduped.conflicts.is_empty());
        let ids: Vec<_> = deduped.retailers.iter().map(|r| r.retailer_id.as_str()).collect();
        assert_eq!(ids, vec!["argos", "boots"]);
    }

    #[test]
    fn contradictory_duplicates_pick_greatest_pair_regardless_of_order() {
        let forward = vec![
            SourceRetailer::new("boots", Some("Boots UK"), Some("Awin")),
            SourceRetailer::new("boots", Some("Boots"), Some("Awin")),
            SourceRetailer::new("boots", Some("Boots UK"), None),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        let a = dedupe_retailers(forward);
        let b = dedupe_retailers(backward);
        assert_eq!(a, b);
        assert_eq!(a.retailers.len(), 1);
        assert_eq!(a.retailers[0].retailer_name.as_deref(), Some("Boots UK"));
        assert_eq!(a.retailers[0].network.as_deref(), Some("Awin"));

        let conflict = &a.conflicts[0];
        assert_eq!(conflict.retailer_id, "boots");
        assert_eq!(conflict.discarded.len(), 2);
    }

    #[test]
    fn null_network_loses_to_a_value() {
        let deduped = dedupe_retailers(vec![
            SourceRetailer::new("x", Some("X"), Some("East")),
            SourceRetailer::new("x", Some("X"), None),
        ]);
        assert_eq!(deduped.retailers[0].network.as_deref(), Some("East"));
    }

    #[test]
    fn touch_policy_parses_aliases() {
        assert_eq!("always".parse::<TouchPolicy>(), Ok(TouchPolicy::Always));
        assert_eq!(" On-Change ".parse::<TouchPolicy>(), Ok(TouchPolicy::OnChange));
        assert_eq!("legacy".parse::<TouchPolicy>(), Ok(TouchPolicy::OnChange));
        assert!("sometimes".parse::<TouchPolicy>().is_err());
        assert_eq!(TouchPolicy::default(), TouchPolicy::Always);
    }

    #[test]
    fn counts_record_each_outcome() {
        let mut counts = SyncCounts::default();
        for outcome in [
            UpsertOutcome::Inserted,
            UpsertOutcome::Inserted,
            UpsertOutcome::Updated,
            UpsertOutcome::Touched,
            UpsertOutcome::Unchanged,
        ] {
            counts.record(outcome);
        }
        assert_eq!(counts.inserted, 2);
        assert_eq!(counts.updated, 1);
        assert_eq!(counts.touched, 1);
        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.applied(), 5);
    }
}
