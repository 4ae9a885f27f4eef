use super::path::FieldPath;
use super::record::Record;
use serde::{Deserialize, Serialize};

/// Requested sort direction. `None` keeps an id-stable order without a
/// primary key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
    None,
}

/// Client-requested sort and pagination window. Mutated by the UI; the
/// projector consumes it read-only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ViewState {
    pub sort_field: FieldPath,
    pub sort_dir: SortDirection,
    pub page: usize,
    pub page_size: usize,
}

pub const DEFAULT_PAGE_SIZE: usize = 25;

impl ViewState {
    pub fn new(sort_field: impl Into<FieldPath>) -> Self {
        Self {
            sort_field: sort_field.into(),
            sort_dir: SortDirection::Asc,
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One projected window over the merged index. Rows are owned copies; the
/// receiver can hold them across further index mutations.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Page {
    pub rows: Vec<Record>,
    pub total_count: usize,
    pub total_pages: usize,
    pub page: usize,
    pub page_size: usize,
}
