pub mod aggregator;
pub mod compiler;
pub mod debounce;
pub mod eval;
pub mod index;
pub mod projector;
pub mod subscription;
pub mod types;

pub use aggregator::{AggregatorConfig, LiveViewAggregator};
pub use compiler::CompileOutcome;
pub use index::MergeIndex;
pub use subscription::RetryPolicy;
pub use types::{
    FastMap, FieldPath, FieldValue, FilterSpec, Generation, Page, Predicate, Record, RowKey,
    Signal, SortDirection, SubQuery, ViewState,
};
