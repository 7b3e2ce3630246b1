//! Configurable consistency rules.
//!
//! A rule names one of a small set of expressions and carries its
//! parameters as JSON. Rules are checked when configured, so evaluation
//! never sees a malformed rule.
//!
//! | expression       | parameters                    | violated when                             |
//! |------------------|-------------------------------|-------------------------------------------|
//! | `field_equals`   | `field`, optional `tolerance` | sources disagree on the field             |
//! | `field_required` | `field`                       | a source lacks the field or has `null`    |
//! | `field_range`    | `field`, `min` and/or `max`   | a source value is non-numeric or outside  |
//! | `max_staleness`  | `max_age_ms`                  | a source record is older than the max age |

use crate::conflict::{CompetingValue, ConflictSeverity};
use crate::error::{SyncError, SyncResult};
use crate::merge::value_at;
use concord_types::{ItemKey, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Broad category of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleType {
    Validation,
    CrossSource,
    Freshness,
}

/// The expression a rule evaluates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub expression: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// What to do when a rule is violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleActionType {
    /// Raise a conflict.
    FlagConflict,
    /// Only log the violation.
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    pub action_type: RuleActionType,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// A consistency rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyRule {
    pub rule_id: String,
    pub rule_type: RuleType,
    /// Restricts the rule to one item type; `None` applies everywhere.
    #[serde(default)]
    pub item_type: Option<String>,
    pub condition: RuleCondition,
    pub action: RuleAction,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled")]
    pub is_enabled: bool,
    #[serde(default = "default_severity")]
    pub severity: ConflictSeverity,
}

fn enabled() -> bool {
    true
}

fn default_severity() -> ConflictSeverity {
    ConflictSeverity::Medium
}

/// A parsed rule expression.
#[derive(Debug, Clone, PartialEq)]
enum Check {
    FieldEquals { field: String, tolerance: f64 },
    FieldRequired { field: String },
    FieldRange { field: String, min: Option<f64>, max: Option<f64> },
    MaxStaleness { max_age: Duration },
}

impl ConsistencyRule {
    /// A cross-source equality rule on `field`, flagging a conflict.
    pub fn field_equals(rule_id: impl Into<String>, field: impl Into<String>) -> Self {
        let mut parameters = Map::new();
        parameters.insert("field".into(), Value::String(field.into()));
        Self {
            rule_id: rule_id.into(),
            rule_type: RuleType::CrossSource,
            item_type: None,
            condition: RuleCondition {
                expression: "field_equals".into(),
                parameters,
            },
            action: RuleAction {
                action_type: RuleActionType::FlagConflict,
                parameters: Map::new(),
            },
            priority: 0,
            is_enabled: true,
            severity: ConflictSeverity::High,
        }
    }

    /// Restricts the rule to one item type.
    #[must_use]
    pub fn for_item_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = Some(item_type.into());
        self
    }

    /// Whether the rule covers `key`.
    #[must_use]
    pub fn applies_to(&self, key: &ItemKey) -> bool {
        self.is_enabled && self.item_type.as_deref().is_none_or(|t| t == key.item_type)
    }

    /// Rejects unknown expressions and missing or mistyped parameters.
    pub fn validate(&self) -> SyncResult<()> {
        if self.rule_id.trim().is_empty() {
            return Err(SyncError::InvalidArgument("rule id is empty".into()));
        }
        self.check().map(|_| ())
    }

    fn check(&self) -> SyncResult<Check> {
        let params = &self.condition.parameters;
        let invalid = |msg: &str| {
            SyncError::InvalidArgument(format!("rule {}: {msg}", self.rule_id))
        };
        let field = || {
            params
                .get("field")
                .and_then(Value::as_str)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .ok_or_else(|| invalid("missing string parameter 'field'"))
        };
        let number = |name: &str| -> SyncResult<Option<f64>> {
            match params.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => v
                    .as_f64()
                    .map(Some)
                    .ok_or_else(|| invalid(&format!("parameter '{name}' must be a number"))),
            }
        };

        match self.condition.expression.as_str() {
            "field_equals" => {
                let tolerance = number("tolerance")?.unwrap_or(0.0);
                if tolerance < 0.0 {
                    return Err(invalid("tolerance must not be negative"));
                }
                Ok(Check::FieldEquals {
                    field: field()?,
                    tolerance,
                })
            }
            "field_required" => Ok(Check::FieldRequired { field: field()? }),
            "field_range" => {
                let (min, max) = (number("min")?, number("max")?);
                match (min, max) {
                    (None, None) => Err(invalid("field_range needs 'min' or 'max'")),
                    (Some(lo), Some(hi)) if lo > hi => Err(invalid("'min' exceeds 'max'")),
                    _ => Ok(Check::FieldRange {
                        field: field()?,
                        min,
                        max,
                    }),
                }
            }
            "max_staleness" => {
                let max_age_ms = params
                    .get("max_age_ms")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| invalid("missing integer parameter 'max_age_ms'"))?;
                Ok(Check::MaxStaleness {
                    max_age: Duration::from_millis(max_age_ms),
                })
            }
            other => Err(invalid(&format!("unknown expression '{other}'"))),
        }
    }

    /// Evaluates the rule against every source's value.
    ///
    /// Returns a description of the violation, or `None` if the values pass.
    pub fn evaluate(
        &self,
        values: &[CompetingValue],
        now: Timestamp,
    ) -> SyncResult<Option<String>> {
        Ok(match self.check()? {
            Check::FieldEquals { field, tolerance } => {
                let observed: Vec<Option<&Value>> =
                    values.iter().map(|v| value_at(&v.payload, &field)).collect();
                let agree = observed.windows(2).all(|pair| match (pair[0], pair[1]) {
                    (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
                        (Some(x), Some(y)) => (x - y).abs() <= tolerance,
                        _ => a == b,
                    },
                    (None, None) => true,
                    _ => false,
                });
                (!agree).then(|| format!("sources disagree on '{field}'"))
            }
            Check::FieldRequired { field } => values
                .iter()
                .find(|v| value_at(&v.payload, &field).is_none_or(Value::is_null))
                .map(|v| format!("{} is missing '{field}'", v.source_id)),
            Check::FieldRange { field, min, max } => values
                .iter()
                .find(|v| {
                    let Some(n) = value_at(&v.payload, &field).and_then(Value::as_f64) else {
                        return true;
                    };
                    min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi)
                })
                .map(|v| format!("{} has '{field}' out of range", v.source_id)),
            Check::MaxStaleness { max_age } => values
                .iter()
                .find(|v| now.duration_since(v.timestamp) > max_age)
                .map(|v| {
                    format!(
                        "{} is stale by {} ms",
                        v.source_id,
                        now.duration_since(v.timestamp).as_millis()
                    )
                }),
        })
    }
}

/// Validates a rule set and orders it by descending priority.
pub fn prepare_rules(mut rules: Vec<ConsistencyRule>) -> SyncResult<Vec<ConsistencyRule>> {
    for rule in &rules {
        rule.validate()?;
    }
    let mut ids: Vec<&str> = rules.iter().map(|r| r.rule_id.as_str()).collect();
    ids.sort_unstable();
    if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(SyncError::InvalidArgument(format!(
            "duplicate rule id '{}'",
            dup[0]
        )));
    }
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(rules)
}
