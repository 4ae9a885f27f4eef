use super::path::FieldPath;
use super::record::Record;
use super::value::FieldValue;
use crate::engine::eval;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Upper bound character closing the half-open prefix interval
/// `[term, term + RANGE_UPPER_BOUND)`.
pub const RANGE_UPPER_BOUND: char = '\u{FFFF}';

/// A single store-evaluable condition.
///
/// `RangePrefix` emulates starts-with search on an ordered field via the
/// half-open interval `[prefix, prefix + "\u{FFFF}")` over the store's
/// case-folded string order. `Eq` is exact field match.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { field: FieldPath, value: FieldValue },
    RangePrefix { field: FieldPath, prefix: String },
}

impl Predicate {
    pub fn eq(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Predicate::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn range_prefix(field: impl Into<FieldPath>, prefix: impl Into<String>) -> Self {
        Predicate::RangePrefix {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    pub fn field(&self) -> &FieldPath {
        match self {
            Predicate::Eq { field, .. } | Predicate::RangePrefix { field, .. } => field,
        }
    }

    /// Half-open `[lo, hi)` string bounds, for range predicates only.
    pub fn range_bounds(&self) -> Option<(String, String)> {
        match self {
            Predicate::RangePrefix { prefix, .. } => {
                let mut hi = String::with_capacity(prefix.len() + RANGE_UPPER_BOUND.len_utf8());
                hi.push_str(prefix);
                hi.push(RANGE_UPPER_BOUND);
                Some((prefix.clone(), hi))
            }
            Predicate::Eq { .. } => None,
        }
    }

    /// Evaluate against a record, with the same semantics the store applies:
    /// exact match for equality, case-folded interval check for ranges.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::Eq { field, value } => {
                record.field(field).map(|v| v == value).unwrap_or(false)
            }
            Predicate::RangePrefix { field, .. } => {
                let Some(v) = record.field(field) else {
                    return false;
                };
                let Some((lo, hi)) = self.range_bounds() else {
                    return false;
                };
                let folded = eval::fold_text(v);
                folded.as_str() >= lo.as_str() && folded.as_str() < hi.as_str()
            }
        }
    }
}

/// Immutable description of what the view should show. A new FilterSpec
/// fully replaces the previous one.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FilterSpec {
    pub equalities: Vec<Predicate>,
    #[serde(default)]
    pub search_term: String,
    #[serde(default)]
    pub search_fields: Vec<FieldPath>,
}

impl FilterSpec {
    pub fn new(search_fields: Vec<FieldPath>) -> Self {
        Self {
            equalities: Vec::new(),
            search_term: String::new(),
            search_fields,
        }
    }

    pub fn with_equality(mut self, field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        self.equalities.push(Predicate::eq(field, value));
        self
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.search_term = term.into();
        self
    }

    /// Search term as used for range bounds: trimmed and case-folded.
    pub fn normalized_term(&self) -> String {
        self.search_term.trim().to_lowercase()
    }

    /// Stable 64-bit fingerprint over a canonical byte encoding.
    ///
    /// Two specs with identical content always fingerprint identically, which
    /// lets the subscription layer recognize a no-op re-apply.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = Vec::with_capacity(64);
        for pred in &self.equalities {
            match pred {
                Predicate::Eq { field, value } => {
                    buf.push(b'e');
                    buf.extend_from_slice(field.to_string().as_bytes());
                    buf.push(0);
                    write_value_bytes(value, &mut buf);
                }
                Predicate::RangePrefix { field, prefix } => {
                    buf.push(b'r');
                    buf.extend_from_slice(field.to_string().as_bytes());
                    buf.push(0);
                    buf.extend_from_slice(prefix.as_bytes());
                }
            }
            buf.push(0);
        }
        buf.push(1);
        buf.extend_from_slice(self.normalized_term().as_bytes());
        buf.push(1);
        for field in &self.search_fields {
            buf.extend_from_slice(field.to_string().as_bytes());
            buf.push(0);
        }
        xxh64(&buf, 0)
    }
}

/// Tagged byte encoding for fingerprinting. Object keys are sorted so the
/// encoding does not depend on map iteration order.
fn write_value_bytes(v: &FieldValue, buf: &mut Vec<u8>) {
    match v {
        FieldValue::Null => buf.push(0),
        FieldValue::Bool(b) => {
            buf.push(1);
            buf.push(*b as u8);
        }
        FieldValue::Number(n) => {
            buf.push(2);
            buf.extend_from_slice(&n.to_be_bytes());
        }
        FieldValue::Str(s) => {
            buf.push(3);
            buf.extend_from_slice(s.as_bytes());
        }
        FieldValue::Array(arr) => {
            buf.push(4);
            for item in arr {
                write_value_bytes(item, buf);
            }
        }
        FieldValue::Object(obj) => {
            buf.push(5);
            let mut keys: Vec<&SmolStr> = obj.keys().collect();
            keys.sort_unstable();
            for k in keys {
                buf.extend_from_slice(k.as_bytes());
                write_value_bytes(&obj[k], buf);
            }
        }
    }
}

/// One single-field query submitted to the backing store.
///
/// `predicates` go to the store; `residual` holds equalities the store cannot
/// evaluate in a compound query and is enforced client-side on every event
/// before the merge index accepts it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SubQuery {
    pub id: SmolStr,
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub residual: Vec<Predicate>,
    pub order_field: FieldPath,
}

impl SubQuery {
    pub fn matches_residual(&self, record: &Record) -> bool {
        self.residual.iter().all(|p| p.matches(record))
    }
}

/// Version tag distinguishing the current active filter cycle from
/// superseded ones. Events tagged with a generation below the current one
/// are discarded unread.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Generation(pub u64);

impl Generation {
    pub const ZERO: Generation = Generation(0);

    #[must_use]
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eq_is_exact() {
        let pred = Predicate::eq("status", "active");
        let hit = Record::from_json("a", json!({ "status": "active" }));
        let cased = Record::from_json("b", json!({ "status": "Active" }));
        let missing = Record::from_json("c", json!({}));
        assert!(pred.matches(&hit));
        assert!(!pred.matches(&cased));
        assert!(!pred.matches(&missing));
    }

    #[test]
    fn test_range_prefix_is_case_folded() {
        let pred = Predicate::range_prefix("name", "jo");
        let john = Record::from_json("a", json!({ "name": "John Doe" }));
        let jane = Record::from_json("b", json!({ "name": "Jane" }));
        assert!(pred.matches(&john));
        assert!(!pred.matches(&jane));
    }

    #[test]
    fn test_range_bounds_half_open() {
        let pred = Predicate::range_prefix("name", "jo");
        let (lo, hi) = pred.range_bounds().unwrap();
        assert_eq!(lo, "jo");
        assert_eq!(hi, format!("jo{}", RANGE_UPPER_BOUND));
        // "jo" itself is inside the interval, "jp" is past it.
        assert!("jo" >= lo.as_str() && "jo" < hi.as_str());
        assert!(!("jp" < hi.as_str()));
    }

    #[test]
    fn test_fingerprint_stability() {
        let spec = FilterSpec::new(vec!["name".into(), "email".into()])
            .with_equality("status", "active")
            .with_term("Jo ");
        assert_eq!(spec.fingerprint(), spec.clone().fingerprint());

        // Normalization folds into the fingerprint.
        let folded = spec.clone().with_term("jo");
        assert_eq!(spec.fingerprint(), folded.fingerprint());

        let different = spec.clone().with_term("joh");
        assert_ne!(spec.fingerprint(), different.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_fields_and_equalities() {
        let base = FilterSpec::new(vec!["name".into()]);
        let more_fields = FilterSpec::new(vec!["name".into(), "email".into()]);
        assert_ne!(base.fingerprint(), more_fields.fingerprint());

        let with_eq = base.clone().with_equality("status", "active");
        assert_ne!(base.fingerprint(), with_eq.fingerprint());
    }

    #[test]
    fn test_generation_ordering() {
        let g = Generation::ZERO;
        assert!(g.next() > g);
        assert_eq!(g.next(), Generation(1));
    }
}
