//! Data quality rules evaluated after the transform stage.
//!
//! Rules run in declaration order. The first `error`-severity violation
//! aborts the pipeline (later rules are not evaluated); `warn`-severity
//! violations are counted and reported on the final progress event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::row::{self, Row};
use crate::transform::{evaluate, FilterOp};

/// How a violated rule affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Error,
}

/// Predicate a column must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "predicate", rename_all = "snake_case")]
pub enum Predicate {
    /// Value must be present and non-empty.
    NotNull,
    /// Value must be unique across the batch.
    Unique,
    /// Numeric value must fall within `[min, max]`.
    Range { min: f64, max: f64 },
    /// General comparison, e.g. `a > 0`.
    Compare {
        op: FilterOp,
        #[serde(default)]
        value: Value,
    },
    /// Rendered value must contain the given substring.
    Contains { value: String },
}

/// One quality rule declared on a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRule {
    pub column: String,
    #[serde(flatten)]
    pub predicate: Predicate,
    pub severity: Severity,
}

/// A single recorded violation.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub column: String,
    pub rule: String,
    pub row_index: usize,
    pub value: String,
}

/// Outcome of the validate stage when no error-severity rule fired.
#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    /// Count of warn-severity violations.
    pub warnings: u64,
    /// Sample of warn violations for logging (bounded).
    pub samples: Vec<Violation>,
}

/// How many warn violations to keep as log samples.
const MAX_SAMPLES: usize = 16;

fn predicate_name(p: &Predicate) -> &'static str {
    match p {
        Predicate::NotNull => "not_null",
        Predicate::Unique => "unique",
        Predicate::Range { .. } => "range",
        Predicate::Compare { .. } => "compare",
        Predicate::Contains { .. } => "contains",
    }
}

fn violates(rows: &[Row], index: usize, rule: &QualityRule) -> bool {
    let null = Value::Null;
    let cell = rows[index].get(&rule.column).unwrap_or(&null);
    match &rule.predicate {
        Predicate::NotNull => cell.is_null() || row::display_value(cell).is_empty(),
        Predicate::Unique => {
            let rendered = row::display_value(cell);
            rows.iter().enumerate().any(|(j, other)| {
                j != index
                    && row::display_value(other.get(&rule.column).unwrap_or(&null)) == rendered
            })
        }
        Predicate::Range { min, max } => {
            let v = row::to_f64(cell);
            v < *min || v > *max
        }
        Predicate::Compare { op, value } => !evaluate(Some(cell), *op, value),
        Predicate::Contains { value } => !row::display_value(cell).contains(value.as_str()),
    }
}

/// Evaluate all rules against the batch.
///
/// Returns `Err(CoreError::QualityViolation)` on the first error-severity
/// violation, in rule declaration order then row order.
pub fn evaluate_rules(rows: &[Row], rules: &[QualityRule]) -> Result<QualityReport, CoreError> {
    let mut report = QualityReport::default();

    for rule in rules {
        for index in 0..rows.len() {
            if !violates(rows, index, rule) {
                continue;
            }
            match rule.severity {
                Severity::Error => {
                    return Err(CoreError::QualityViolation {
                        rule: predicate_name(&rule.predicate).to_string(),
                        column: rule.column.clone(),
                    });
                }
                Severity::Warn => {
                    report.warnings += 1;
                    if report.samples.len() < MAX_SAMPLES {
                        let null = Value::Null;
                        report.samples.push(Violation {
                            column: rule.column.clone(),
                            rule: predicate_name(&rule.predicate).to_string(),
                            row_index: index,
                            value: row::display_value(
                                rows[index].get(&rule.column).unwrap_or(&null),
                            ),
                        });
                    }
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rows(v: serde_json::Value) -> Vec<Row> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn error_severity_violation_aborts() {
        let data = rows(json!([{"a": -1}]));
        let rules = [QualityRule {
            column: "a".into(),
            predicate: Predicate::Compare {
                op: FilterOp::Gt,
                value: json!(0),
            },
            severity: Severity::Error,
        }];
        let err = evaluate_rules(&data, &rules).unwrap_err();
        assert!(matches!(err, CoreError::QualityViolation { .. }));
    }

    #[test]
    fn warn_severity_counts_and_continues() {
        let data = rows(json!([{"a": -1}, {"a": 2}, {"a": -3}]));
        let rules = [QualityRule {
            column: "a".into(),
            predicate: Predicate::Compare {
                op: FilterOp::Gt,
                value: json!(0),
            },
            severity: Severity::Warn,
        }];
        let report = evaluate_rules(&data, &rules).unwrap();
        assert_eq!(report.warnings, 2);
        assert_eq!(report.samples.len(), 2);
    }

    #[test]
    fn first_error_rule_shortcircuits_later_rules() {
        let data = rows(json!([{"a": null, "b": null}]));
        let rules = [
            QualityRule {
                column: "a".into(),
                predicate: Predicate::NotNull,
                severity: Severity::Error,
            },
            QualityRule {
                column: "b".into(),
                predicate: Predicate::NotNull,
                severity: Severity::Error,
            },
        ];
        let err = evaluate_rules(&data, &rules).unwrap_err();
        match err {
            CoreError::QualityViolation { column, .. } => assert_eq!(column, "a"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unique_detects_duplicates() {
        let data = rows(json!([{"id": 1}, {"id": 1}, {"id": 2}]));
        let rules = [QualityRule {
            column: "id".into(),
            predicate: Predicate::Unique,
            severity: Severity::Warn,
        }];
        let report = evaluate_rules(&data, &rules).unwrap();
        assert_eq!(report.warnings, 2); // both members of the duplicate pair
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let data = rows(json!([{"v": 0}, {"v": 10}, {"v": 11}]));
        let rules = [QualityRule {
            column: "v".into(),
            predicate: Predicate::Range { min: 0.0, max: 10.0 },
            severity: Severity::Warn,
        }];
        let report = evaluate_rules(&data, &rules).unwrap();
        assert_eq!(report.warnings, 1);
    }

    #[test]
    fn missing_column_fails_not_null() {
        let data = rows(json!([{"other": 1}]));
        let rules = [QualityRule {
            column: "a".into(),
            predicate: Predicate::NotNull,
            severity: Severity::Warn,
        }];
        assert_eq!(evaluate_rules(&data, &rules).unwrap().warnings, 1);
    }

    #[test]
    fn empty_rules_pass() {
        let data = rows(json!([{"a": 1}]));
        let report = evaluate_rules(&data, &[]).unwrap();
        assert_eq!(report.warnings, 0);
    }
}
