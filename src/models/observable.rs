use serde::{Deserialize, Serialize};

use super::extraction::ProcessLineageEntry;
use super::extraction::HuntQuery;

/// The typed tag of an [`Observable`], used for deterministic sort order
/// when merging sub-agent outputs (sorted by type, then by index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservableType {
    Cmdline,
    ProcessLineage,
    HuntQueries,
}

/// `Observable = Cmdline(string) | ProcessLineage(record) | HuntQuery(record)`
/// (design note: dynamic typing in the source becomes a tagged sum type
/// here rather than a loosely-typed mapping). `source` carries spec.md's
/// `{type, value, source}` merge shape (§4.3.d fan-in); every observable
/// reaching this type comes out of the ExtractSupervisor merge, so it is
/// always [`Observable::SOURCE_SUPERVISOR_AGGREGATION`] today, but the
/// field is on the variant (not hoisted onto `ExtractionResult`) so a
/// future non-supervisor producer can tag its own observables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observable {
    Cmdline { value: String, source: String },
    ProcessLineage { value: ProcessLineageEntry, source: String },
    HuntQuery { value: HuntQuery, source: String },
}

impl Observable {
    pub fn observable_type(&self) -> ObservableType {
        match self {
            Observable::Cmdline { .. } => ObservableType::Cmdline,
            Observable::ProcessLineage { .. } => ObservableType::ProcessLineage,
            Observable::HuntQuery { .. } => ObservableType::HuntQueries,
        }
    }

    /// A newline-renderable text form, used to build the `content` field
    /// the SigmaGen stage consumes.
    pub fn render(&self) -> String {
        match self {
            Observable::Cmdline { value, .. } => value.clone(),
            Observable::ProcessLineage { value, .. } => format!(
                "{} -> {}{}",
                value.parent,
                value.child,
                value
                    .arguments
                    .as_deref()
                    .map(|a| format!(" {a}"))
                    .unwrap_or_default()
            ),
            Observable::HuntQuery { value, .. } => value.query.clone(),
        }
    }

    pub const SOURCE_SUPERVISOR_AGGREGATION: &'static str = "supervisor_aggregation";
}
