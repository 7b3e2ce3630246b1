//! Field-level merge policies.
//!
//! Shared by version merges and `merge` conflict resolution. Every policy
//! receives candidates in any order and sorts them by timestamp itself;
//! equal timestamps keep their input order.

use concord_types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How competing payloads are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    /// Top-level fields are unioned; the newest candidate wins each field.
    LatestWins,
    /// Top-level fields are unioned; the oldest candidate wins each field.
    EarliestWins,
    /// Deep union of nested objects, last write wins at each leaf.
    MergeAll,
    /// Agreeing fields are kept; differing fields are reported, not chosen.
    KeepConflicts,
}

impl MergeStrategy {
    /// The policy implementing this strategy.
    #[must_use]
    pub fn merger(self) -> &'static dyn FieldMerger {
        match self {
            Self::LatestWins => &LatestWinsMerger,
            Self::EarliestWins => &EarliestWinsMerger,
            Self::MergeAll => &MergeAllMerger,
            Self::KeepConflicts => &KeepConflictsMerger,
        }
    }
}

/// One input to a merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeCandidate<'a> {
    /// Where the value came from (version id or source id), for reporting.
    pub origin: &'a str,
    pub timestamp: Timestamp,
    pub value: &'a Value,
}

/// A competing value for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub origin: String,
    pub timestamp: Timestamp,
    pub value: Value,
}

/// A field the merge refused to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Dotted field path, `$` for a non-object root.
    pub field: String,
    /// Distinct values, oldest first.
    pub values: Vec<FieldValue>,
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub value: Value,
    pub conflicts: Vec<FieldConflict>,
}

impl MergeOutcome {
    fn clean(value: Value) -> Self {
        Self {
            value,
            conflicts: Vec::new(),
        }
    }
}

/// Uniform merge contract.
pub trait FieldMerger: Send + Sync {
    fn merge(&self, candidates: &[MergeCandidate<'_>]) -> MergeOutcome;
}

fn sorted<'a>(candidates: &[MergeCandidate<'a>]) -> Vec<MergeCandidate<'a>> {
    let mut out = candidates.to_vec();
    out.sort_by_key(|c| c.timestamp);
    out
}

fn all_objects(candidates: &[MergeCandidate<'_>]) -> bool {
    !candidates.is_empty() && candidates.iter().all(|c| c.value.is_object())
}

/// Applies candidates in order; a later candidate overwrites top-level fields.
fn overlay_top_level<'a>(ordered: impl Iterator<Item = MergeCandidate<'a>>) -> Value {
    let mut merged = Map::new();
    for candidate in ordered {
        if let Value::Object(fields) = candidate.value {
            for (k, v) in fields {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(merged)
}

pub struct LatestWinsMerger;

impl FieldMerger for LatestWinsMerger {
    fn merge(&self, candidates: &[MergeCandidate<'_>]) -> MergeOutcome {
        let ordered = sorted(candidates);
        if all_objects(&ordered) {
            return MergeOutcome::clean(overlay_top_level(ordered.into_iter()));
        }
        MergeOutcome::clean(ordered.last().map_or(Value::Null, |c| c.value.clone()))
    }
}

pub struct EarliestWinsMerger;

impl FieldMerger for EarliestWinsMerger {
    fn merge(&self, candidates: &[MergeCandidate<'_>]) -> MergeOutcome {
        let ordered = sorted(candidates);
        if all_objects(&ordered) {
            return MergeOutcome::clean(overlay_top_level(ordered.into_iter().rev()));
        }
        MergeOutcome::clean(ordered.first().map_or(Value::Null, |c| c.value.clone()))
    }
}

pub struct MergeAllMerger;

impl MergeAllMerger {
    fn deep_merge(base: &mut Value, incoming: &Value) {
        match (base, incoming) {
            (Value::Object(base_fields), Value::Object(incoming_fields)) => {
                for (k, v) in incoming_fields {
                    let nested = v.is_object() && base_fields.get(k).is_some_and(Value::is_object);
                    if nested {
                        if let Some(existing) = base_fields.get_mut(k) {
                            Self::deep_merge(existing, v);
                        }
                    } else {
                        base_fields.insert(k.clone(), v.clone());
                    }
                }
            }
            (base, incoming) => *base = incoming.clone(),
        }
    }
}

impl FieldMerger for MergeAllMerger {
    fn merge(&self, candidates: &[MergeCandidate<'_>]) -> MergeOutcome {
        let ordered = sorted(candidates);
        let mut iter = ordered.iter();
        let Some(first) = iter.next() else {
            return MergeOutcome::clean(Value::Null);
        };
        let mut merged = first.value.clone();
        for candidate in iter {
            Self::deep_merge(&mut merged, candidate.value);
        }
        MergeOutcome::clean(merged)
    }
}

pub struct KeepConflictsMerger;

impl KeepConflictsMerger {
    fn distinct_values(field_values: Vec<FieldValue>) -> Vec<FieldValue> {
        let mut out: Vec<FieldValue> = Vec::new();
        for fv in field_values {
            if !out.iter().any(|existing| existing.value == fv.value) {
                out.push(fv);
            }
        }
        out
    }
}

impl FieldMerger for KeepConflictsMerger {
    fn merge(&self, candidates: &[MergeCandidate<'_>]) -> MergeOutcome {
        let ordered = sorted(candidates);
        if ordered.is_empty() {
            return MergeOutcome::clean(Value::Null);
        }

        if !all_objects(&ordered) {
            let values = Self::distinct_values(
                ordered
                    .iter()
                    .map(|c| FieldValue {
                        origin: c.origin.to_string(),
                        timestamp: c.timestamp,
                        value: c.value.clone(),
                    })
                    .collect(),
            );
            if values.len() == 1 {
                return MergeOutcome::clean(ordered[0].value.clone());
            }
            return MergeOutcome {
                value: Value::Null,
                conflicts: vec![FieldConflict {
                    field: "$".to_string(),
                    values,
                }],
            };
        }

        let mut field_names: Vec<&String> = ordered
            .iter()
            .filter_map(|c| c.value.as_object())
            .flat_map(|fields| fields.keys())
            .collect();
        field_names.sort();
        field_names.dedup();

        let mut merged = Map::new();
        let mut conflicts = Vec::new();
        for name in field_names {
            let values = Self::distinct_values(
                ordered
                    .iter()
                    .filter_map(|c| {
                        c.value.get(name.as_str()).map(|v| FieldValue {
                            origin: c.origin.to_string(),
                            timestamp: c.timestamp,
                            value: v.clone(),
                        })
                    })
                    .collect(),
            );
            match values.as_slice() {
                [only] => {
                    merged.insert(name.clone(), only.value.clone());
                }
                _ => conflicts.push(FieldConflict {
                    field: name.clone(),
                    values,
                }),
            }
        }
        MergeOutcome {
            value: Value::Object(merged),
            conflicts,
        }
    }
}

/// Top-level and nested field paths whose values differ between `a` and `b`.
pub(crate) fn diff_paths(a: &Value, b: &Value, prefix: &str, out: &mut Vec<String>) {
    match (a, b) {
        (Value::Object(af), Value::Object(bf)) => {
            let mut keys: Vec<&String> = af.keys().chain(bf.keys()).collect();
            keys.sort();
            keys.dedup();
            for k in keys {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                match (af.get(k), bf.get(k)) {
                    (Some(x), Some(y)) => diff_paths(x, y, &path, out),
                    _ => out.push(path),
                }
            }
        }
        _ if a != b => {
            let path = if prefix.is_empty() { "$" } else { prefix };
            out.push(path.to_string());
        }
        _ => {}
    }
}

/// Number of leaf paths in a value; scalars and arrays count as one.
pub(crate) fn leaf_count(v: &Value) -> usize {
    match v {
        Value::Object(fields) if !fields.is_empty() => fields.values().map(leaf_count).sum(),
        _ => 1,
    }
}

/// Looks up a dotted path as produced by `diff_paths`.
///
/// A field whose own name contains dots matches before the path is split.
pub(crate) fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path == "$" {
        return Some(value);
    }
    if let Some(found) = value.get(path) {
        return Some(found);
    }
    path.match_indices('.').find_map(|(at, _)| {
        value
            .get(&path[..at])
            .and_then(|child| value_at(child, &path[at + 1..]))
    })
}
