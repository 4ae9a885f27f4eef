//! weave: an incremental multi-predicate query aggregator.
//!
//! Compiles a filter spec (equality filters + debounced search term over a
//! set of searchable fields) into per-field range subscriptions against a
//! document store, merges their live change feeds into one deduplicated
//! index, and projects that index into a sorted, paginated page that stays
//! live as the backing data mutates.

pub mod engine;
pub mod store;

// Re-export the surface most callers need.
pub use engine::aggregator::{AggregatorConfig, LiveViewAggregator};
pub use engine::subscription::RetryPolicy;
pub use engine::types::{
    FieldPath, FieldValue, FilterSpec, Generation, Page, Predicate, Record, RowKey, Signal,
    SortDirection, SubQuery, ViewState,
};
pub use store::{ChangeEvent, ChangeStream, DocumentStore, StoreCapabilities};
