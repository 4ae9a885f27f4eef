//! Compiles a [`FilterSpec`] into the set of backing-store sub-queries.
//!
//! The output is a pure function of (spec, store capabilities): recompiling
//! an unchanged spec yields byte-identical sub-queries, which lets the
//! subscription layer skip a no-op resubscription by fingerprint alone.

use crate::engine::types::{FieldPath, FilterSpec, Predicate, SubQuery};
use crate::store::StoreCapabilities;
use smol_str::SmolStr;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct CompileOutcome {
    pub sub_queries: Vec<SubQuery>,
    /// Search fields skipped because the store cannot range-order them.
    /// Non-fatal: partial search coverage is acceptable.
    pub skipped: Vec<FieldPath>,
    pub fingerprint: u64,
}

pub fn compile(
    spec: &FilterSpec,
    default_order: &FieldPath,
    caps: &StoreCapabilities,
) -> CompileOutcome {
    let fingerprint = spec.fingerprint();
    let term = spec.normalized_term();

    if term.is_empty() {
        // No search: one query over the equalities, default order.
        let (predicates, residual) = split_equalities(&spec.equalities, caps, None);
        return CompileOutcome {
            sub_queries: vec![SubQuery {
                id: sub_query_id(fingerprint, default_order),
                predicates,
                residual,
                order_field: default_order.clone(),
            }],
            skipped: Vec::new(),
            fingerprint,
        };
    }

    let mut sub_queries = Vec::with_capacity(spec.search_fields.len());
    let mut skipped = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for field in &spec.search_fields {
        // A field listed twice would compile to two identical sub-queries.
        if !seen.insert(field) {
            continue;
        }
        if !caps.supports_range(field) {
            warn!(field = %field, "field is not range-orderable, search coverage degraded");
            skipped.push(field.clone());
            continue;
        }

        let range = Predicate::range_prefix(field.clone(), term.clone());
        let (predicates, residual) = split_equalities(&spec.equalities, caps, Some(range));
        sub_queries.push(SubQuery {
            id: sub_query_id(fingerprint, field),
            predicates,
            residual,
            order_field: field.clone(),
        });
    }

    CompileOutcome {
        sub_queries,
        skipped,
        fingerprint,
    }
}

/// Deterministic id derived from the spec fingerprint and the order field.
fn sub_query_id(fingerprint: u64, field: &FieldPath) -> SmolStr {
    SmolStr::new(format!("sq-{:016x}-{}", fingerprint, field))
}

/// Decide which equality predicates the store evaluates and which stay
/// client-side. Stores without compound filtering get at most one pushed
/// predicate per sub-query; the rest become residual.
fn split_equalities(
    equalities: &[Predicate],
    caps: &StoreCapabilities,
    range: Option<Predicate>,
) -> (Vec<Predicate>, Vec<Predicate>) {
    let mut predicates = Vec::with_capacity(equalities.len() + 1);
    let mut residual = Vec::new();

    match range {
        Some(range) => {
            predicates.push(range);
            if caps.compound_predicates {
                predicates.extend_from_slice(equalities);
            } else {
                residual.extend_from_slice(equalities);
            }
        }
        None => {
            if caps.compound_predicates || equalities.len() <= 1 {
                predicates.extend_from_slice(equalities);
            } else {
                predicates.push(equalities[0].clone());
                residual.extend_from_slice(&equalities[1..]);
            }
        }
    }

    (predicates, residual)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_full() -> StoreCapabilities {
        StoreCapabilities::full()
    }

    fn default_order() -> FieldPath {
        FieldPath::new("created_at")
    }

    #[test]
    fn test_empty_term_compiles_single_query() {
        let spec = FilterSpec::new(vec!["name".into(), "email".into()])
            .with_equality("status", "active");
        let out = compile(&spec, &default_order(), &caps_full());

        assert_eq!(out.sub_queries.len(), 1);
        let q = &out.sub_queries[0];
        assert_eq!(q.order_field, default_order());
        assert_eq!(q.predicates, vec![Predicate::eq("status", "active")]);
        assert!(q.residual.is_empty());
        assert!(out.skipped.is_empty());
    }

    #[test]
    fn test_one_query_per_search_field() {
        let spec = FilterSpec::new(vec!["name".into(), "email".into()])
            .with_equality("status", "active")
            .with_term("  Jo ");
        let out = compile(&spec, &default_order(), &caps_full());

        assert_eq!(out.sub_queries.len(), 2);
        for (q, field) in out.sub_queries.iter().zip(["name", "email"]) {
            assert_eq!(q.order_field, FieldPath::new(field));
            // Range on the field with the normalized term, plus the equality.
            assert_eq!(
                q.predicates[0],
                Predicate::range_prefix(field, "jo")
            );
            assert_eq!(q.predicates[1], Predicate::eq("status", "active"));
            assert!(q.residual.is_empty());
        }
    }

    #[test]
    fn test_recompile_is_byte_identical() {
        let spec = FilterSpec::new(vec!["name".into(), "email".into()])
            .with_equality("status", "active")
            .with_term("jo");
        let a = compile(&spec, &default_order(), &caps_full());
        let b = compile(&spec, &default_order(), &caps_full());
        assert_eq!(a.sub_queries, b.sub_queries);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_non_orderable_field_is_skipped() {
        let caps = StoreCapabilities::full().with_range_fields(["name"]);
        let spec = FilterSpec::new(vec!["name".into(), "avatar".into()]).with_term("jo");
        let out = compile(&spec, &default_order(), &caps);

        assert_eq!(out.sub_queries.len(), 1);
        assert_eq!(out.sub_queries[0].order_field, FieldPath::new("name"));
        assert_eq!(out.skipped, vec![FieldPath::new("avatar")]);
    }

    #[test]
    fn test_no_compound_support_splits_residual() {
        let caps = StoreCapabilities::single_predicate();
        let spec = FilterSpec::new(vec!["name".into()])
            .with_equality("status", "active")
            .with_term("jo");
        let out = compile(&spec, &default_order(), &caps);

        let q = &out.sub_queries[0];
        assert_eq!(q.predicates, vec![Predicate::range_prefix("name", "jo")]);
        assert_eq!(q.residual, vec![Predicate::eq("status", "active")]);
    }

    #[test]
    fn test_no_compound_no_search_keeps_first_equality() {
        let caps = StoreCapabilities::single_predicate();
        let spec = FilterSpec::new(vec![])
            .with_equality("status", "active")
            .with_equality("lab", "x");
        let out = compile(&spec, &default_order(), &caps);

        let q = &out.sub_queries[0];
        assert_eq!(q.predicates, vec![Predicate::eq("status", "active")]);
        assert_eq!(q.residual, vec![Predicate::eq("lab", "x")]);
    }
}
