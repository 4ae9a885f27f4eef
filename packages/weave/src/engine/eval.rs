//! Value ordering shared by the view projector and the range-matching path.
//!
//! The comparison contract is deliberately narrow and mirrors the backing
//! store's native ordering: numbers compare numerically, everything else
//! compares as a case-folded, locale-naive textual rendering, and missing
//! values sort first. No locale-aware collation is attempted.

use crate::engine::types::FieldValue;
use std::cmp::Ordering;

/// Case-folded textual rendering used for non-numeric ordering and for
/// range-prefix interval checks.
pub fn fold_text(v: &FieldValue) -> String {
    let mut out = String::new();
    write_folded(v, &mut out);
    out
}

fn write_folded(v: &FieldValue, out: &mut String) {
    match v {
        FieldValue::Null => {}
        FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        FieldValue::Number(n) => {
            // Integral floats render without the trailing ".0" so numeric ids
            // fold the way they were written.
            if n.fract() == 0.0 && n.is_finite() {
                out.push_str(&format!("{}", *n as i64));
            } else {
                out.push_str(&format!("{}", n));
            }
        }
        FieldValue::Str(s) => {
            for c in s.chars() {
                out.extend(c.to_lowercase());
            }
        }
        FieldValue::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_folded(item, out);
            }
        }
        FieldValue::Object(obj) => {
            let mut keys: Vec<_> = obj.keys().collect();
            keys.sort_unstable();
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push('=');
                write_folded(&obj[k], out);
            }
        }
    }
}

/// Total order over optional field values.
///
/// Missing sorts before present; two numbers compare numerically; any other
/// pairing compares by `fold_text`. This is the documented, testable sort
/// contract of the projector.
pub fn compare_values(a: Option<&FieldValue>, b: Option<&FieldValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(FieldValue::Number(x)), Some(FieldValue::Number(y))) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (Some(va), Some(vb)) => fold_text(va).cmp(&fold_text(vb)),
    }
}
