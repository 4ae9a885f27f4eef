use super::path::FieldPath;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Out-of-band health events surfaced to the UI collaborator.
///
/// None of these tear down the view on their own; `Fatal` is raised only
/// when the backing store is unreachable at startup and means the aggregator
/// never presented an authoritative index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// One SubQuery's stream failed past its retry budget; sibling streams
    /// keep populating the index, search coverage for that field is lost.
    PartialDegradation { sub_query_id: SmolStr, error: String },
    /// A search field cannot be range-ordered by the store and was skipped
    /// at compile time.
    PartialCoverage { field: FieldPath },
    Fatal { error: String },
}
