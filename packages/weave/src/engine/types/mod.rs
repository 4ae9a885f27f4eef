mod filter;
mod path;
mod record;
mod signal;
mod value;
mod view;

pub use filter::{FilterSpec, Generation, Predicate, SubQuery, RANGE_UPPER_BOUND};
pub use path::FieldPath;
pub use record::{FastMap, Record, RowKey};
pub use signal::Signal;
pub use value::FieldValue;
pub use view::{Page, SortDirection, ViewState, DEFAULT_PAGE_SIZE};
