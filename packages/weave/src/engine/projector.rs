//! Sort + paginate projection over a merge-index snapshot.
//!
//! Pure functions: no store round-trips, no mutation of shared state. The
//! comparison contract lives in [`crate::engine::eval`] and is part of the
//! public behavior, not an implementation detail.

use crate::engine::eval;
use crate::engine::types::{FieldValue, Page, Record, SortDirection, ViewState};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::cmp::Ordering;

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
use rayon::prelude::*;

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
const PARALLEL_SORT_THRESHOLD: usize = 2048;

/// Project a snapshot into one page. The snapshot is consumed; callers hand
/// over the copy they received from the merge index.
pub fn project(mut snapshot: Vec<Record>, view: &ViewState) -> Page {
    sort_records(&mut snapshot, view);

    let total_count = snapshot.len();
    let page_size = view.page_size.max(1);
    let total_pages = total_count.div_ceil(page_size);
    // Clamp into [0, total_pages - 1]; an empty index pins page 0.
    let page = if total_pages == 0 {
        0
    } else {
        view.page.min(total_pages - 1)
    };

    let start = page * page_size;
    let end = (start + page_size).min(total_count);
    let rows = snapshot.drain(start..end).collect();

    Page {
        rows,
        total_count,
        total_pages,
        page,
        page_size,
    }
}

fn sort_records(rows: &mut [Record], view: &ViewState) {
    let cmp = |a: &Record, b: &Record| compare_records(a, b, view);

    #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
    {
        if rows.len() >= PARALLEL_SORT_THRESHOLD {
            rows.par_sort_unstable_by(cmp);
            return;
        }
    }

    rows.sort_unstable_by(cmp);
}

/// Total order: primary key per the eval contract, direction applied to the
/// primary key only, ties broken by ascending id. `None` direction sorts by
/// id alone, which keeps output stable regardless of insertion order.
fn compare_records(a: &Record, b: &Record, view: &ViewState) -> Ordering {
    let primary = match view.sort_dir {
        SortDirection::None => Ordering::Equal,
        SortDirection::Asc | SortDirection::Desc => {
            let ord = eval::compare_values(
                a.field(&view.sort_field),
                b.field(&view.sort_field),
            );
            if view.sort_dir == SortDirection::Desc {
                ord.reverse()
            } else {
                ord
            }
        }
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

/// Content fingerprint of a projected page, used to suppress render
/// callbacks when an event burst leaves the visible window unchanged.
pub fn page_fingerprint(page: &Page) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(page.total_count as u64).to_be_bytes());
    hasher.update(&(page.page as u64).to_be_bytes());
    hasher.update(&(page.page_size as u64).to_be_bytes());
    for rec in &page.rows {
        hasher.update(rec.id.as_bytes());
        hasher.update(&[0]);
        hash_value(&rec.fields, &mut hasher);
        hasher.update(&[1]);
    }
    hasher.finalize().to_hex().to_string()
}

fn hash_value(v: &FieldValue, hasher: &mut blake3::Hasher) {
    match v {
        FieldValue::Null => {
            hasher.update(&[0]);
        }
        FieldValue::Bool(b) => {
            hasher.update(&[1, *b as u8]);
        }
        FieldValue::Number(n) => {
            hasher.update(&[2]);
            hasher.update(&n.to_be_bytes());
        }
        FieldValue::Str(s) => {
            hasher.update(&[3]);
            hasher.update(s.as_bytes());
        }
        FieldValue::Array(arr) => {
            hasher.update(&[4]);
            for item in arr {
                hash_value(item, hasher);
            }
        }
        FieldValue::Object(obj) => {
            hasher.update(&[5]);
            // Sort keys so the hash does not depend on map iteration order.
            let mut keys: SmallVec<[&SmolStr; 16]> = obj.keys().collect();
            keys.sort_unstable();
            for k in keys {
                hasher.update(k.as_bytes());
                hash_value(&obj[k], hasher);
            }
        }
    }
}
