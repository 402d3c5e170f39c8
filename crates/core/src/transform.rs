//! Transformation steps applied between extract and validate.
//!
//! Steps execute in declared order and each step is pure over its row
//! batch. A misconfigured step is a configuration error (permanent);
//! row-level failures are only survivable when the step opts into
//! `on_error = skip_row` or the pipeline runs in lenient cast mode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::row::{self, CastType, Row};

// ---------------------------------------------------------------------------
// Step definitions
// ---------------------------------------------------------------------------

/// Comparison operator used by filter and validate steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Contains,
    NotContains,
    StartsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    IsNotNull,
}

/// Aggregate function for the aggregate step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate output column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub column: String,
    pub function: AggregateFn,
    /// Output column name; defaults to `{function}_{column}`.
    #[serde(default)]
    pub alias: Option<String>,
}

/// What a step does to its batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Filter {
        column: String,
        op: FilterOp,
        #[serde(default)]
        value: Value,
    },
    Rename {
        mappings: BTreeMap<String, String>,
    },
    Cast {
        casts: BTreeMap<String, CastType>,
    },
    Aggregate {
        group_by: Vec<String>,
        aggregates: Vec<AggregateSpec>,
    },
    Deduplicate {
        columns: Vec<String>,
    },
    /// Per-row assertion; rows failing it are an error unless the step
    /// declares `on_error = skip_row`.
    Validate {
        column: String,
        op: FilterOp,
        #[serde(default)]
        value: Value,
    },
}

/// Row-level failure handling for a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the pipeline (configuration errors always abort).
    #[default]
    Fail,
    /// Drop the offending row and count it.
    SkipRow,
}

/// A transformation step as declared on the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStep {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub on_error: OnError,
}

/// Result of running the transform stage.
#[derive(Debug, Clone, Default)]
pub struct TransformOutcome {
    pub rows: Vec<Row>,
    /// Rows dropped by `skip_row` handling (including lenient casts).
    pub rows_skipped: u64,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a comparison against one cell.
///
/// Equality and string operators compare rendered values
/// (case-insensitive for the substring family); ordering operators
/// compare numerically.
pub fn evaluate(cell: Option<&Value>, op: FilterOp, operand: &Value) -> bool {
    let null = Value::Null;
    let cell = cell.unwrap_or(&null);
    let cell_str = row::display_value(cell);
    let operand_str = row::display_value(operand);
    match op {
        FilterOp::Eq => cell_str == operand_str,
        FilterOp::Neq => cell_str != operand_str,
        FilterOp::Contains => cell_str.to_lowercase().contains(&operand_str.to_lowercase()),
        FilterOp::NotContains => !cell_str.to_lowercase().contains(&operand_str.to_lowercase()),
        FilterOp::StartsWith => cell_str.to_lowercase().starts_with(&operand_str.to_lowercase()),
        FilterOp::Gt => row::to_f64(cell) > row::to_f64(operand),
        FilterOp::Gte => row::to_f64(cell) >= row::to_f64(operand),
        FilterOp::Lt => row::to_f64(cell) < row::to_f64(operand),
        FilterOp::Lte => row::to_f64(cell) <= row::to_f64(operand),
        FilterOp::IsNull => cell.is_null() || cell_str.is_empty(),
        FilterOp::IsNotNull => !cell.is_null() && !cell_str.is_empty(),
    }
}

/// Apply all steps in declared order.
///
/// `lenient_casts` turns row-level cast failures into skipped rows
/// instead of aborting the stage.
pub fn apply_steps(
    rows: Vec<Row>,
    steps: &[TransformStep],
    lenient_casts: bool,
) -> Result<TransformOutcome, CoreError> {
    let mut outcome = TransformOutcome {
        rows,
        rows_skipped: 0,
    };
    for step in steps {
        outcome = apply_step(outcome, step, lenient_casts)?;
    }
    Ok(outcome)
}

fn apply_step(
    mut outcome: TransformOutcome,
    step: &TransformStep,
    lenient_casts: bool,
) -> Result<TransformOutcome, CoreError> {
    match &step.kind {
        StepKind::Filter { column, op, value } => {
            if column.is_empty() {
                return Err(CoreError::Configuration(
                    "filter step requires a column".into(),
                ));
            }
            outcome
                .rows
                .retain(|r| evaluate(r.get(column), *op, value));
            Ok(outcome)
        }

        StepKind::Rename { mappings } => {
            if mappings.is_empty() {
                return Err(CoreError::Configuration(
                    "rename step requires at least one mapping".into(),
                ));
            }
            for r in &mut outcome.rows {
                for (old, new) in mappings {
                    if new.is_empty() {
                        continue;
                    }
                    if let Some(v) = r.remove(old) {
                        r.insert(new.clone(), v);
                    }
                }
            }
            Ok(outcome)
        }

        StepKind::Cast { casts } => {
            if casts.is_empty() {
                return Err(CoreError::Configuration(
                    "cast step requires at least one column".into(),
                ));
            }
            let skip_on_failure = lenient_casts || step.on_error == OnError::SkipRow;
            let mut kept = Vec::with_capacity(outcome.rows.len());
            'rows: for mut r in outcome.rows {
                for (col, target) in casts {
                    let Some(v) = r.get(col) else { continue };
                    match row::cast_value(v, *target) {
                        Ok(cast) => {
                            r.insert(col.clone(), cast);
                        }
                        Err(_) if skip_on_failure => {
                            outcome.rows_skipped += 1;
                            continue 'rows;
                        }
                        Err(e) => return Err(e),
                    }
                }
                kept.push(r);
            }
            outcome.rows = kept;
            Ok(outcome)
        }

        StepKind::Aggregate {
            group_by,
            aggregates,
        } => {
            if group_by.is_empty() {
                return Err(CoreError::Configuration(
                    "aggregate step requires a group_by column list".into(),
                ));
            }
            outcome.rows = aggregate_rows(outcome.rows, group_by, aggregates);
            Ok(outcome)
        }

        StepKind::Deduplicate { columns } => {
            if columns.is_empty() {
                return Err(CoreError::Configuration(
                    "deduplicate step requires a column list".into(),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            outcome
                .rows
                .retain(|r| seen.insert(composite_key(r, columns)));
            Ok(outcome)
        }

        StepKind::Validate { column, op, value } => {
            if column.is_empty() {
                return Err(CoreError::Configuration(
                    "validate step requires a column".into(),
                ));
            }
            if step.on_error == OnError::SkipRow {
                let before = outcome.rows.len();
                outcome
                    .rows
                    .retain(|r| evaluate(r.get(column), *op, value));
                outcome.rows_skipped += (before - outcome.rows.len()) as u64;
                Ok(outcome)
            } else if let Some(bad) = outcome
                .rows
                .iter()
                .position(|r| !evaluate(r.get(column), *op, value))
            {
                Err(CoreError::Validation(format!(
                    "row {bad} failed validation on column '{column}'"
                )))
            } else {
                Ok(outcome)
            }
        }
    }
}

/// Group rows in first-seen order and compute aggregate columns.
fn aggregate_rows(rows: Vec<Row>, group_by: &[String], aggregates: &[AggregateSpec]) -> Vec<Row> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<Row>> = std::collections::HashMap::new();

    for r in rows {
        let key = composite_key(&r, group_by);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(r);
    }

    order
        .into_iter()
        .map(|key| {
            let members = groups.remove(&key).unwrap_or_default();
            let mut out = Row::new();
            if let Some(first) = members.first() {
                for col in group_by {
                    out.insert(col.clone(), first.get(col).cloned().unwrap_or(Value::Null));
                }
            }
            for agg in aggregates {
                let alias = agg.alias.clone().unwrap_or_else(|| {
                    format!("{}_{}", aggregate_fn_name(agg.function), agg.column)
                });
                out.insert(alias, compute_aggregate(&members, &agg.column, agg.function));
            }
            out
        })
        .collect()
}

fn aggregate_fn_name(f: AggregateFn) -> &'static str {
    match f {
        AggregateFn::Count => "count",
        AggregateFn::Sum => "sum",
        AggregateFn::Avg => "avg",
        AggregateFn::Min => "min",
        AggregateFn::Max => "max",
    }
}

fn compute_aggregate(rows: &[Row], column: &str, f: AggregateFn) -> Value {
    let nums = || rows.iter().map(|r| row::to_f64(r.get(column).unwrap_or(&Value::Null)));
    match f {
        AggregateFn::Count => Value::from(rows.len() as u64),
        AggregateFn::Sum => number(nums().sum()),
        AggregateFn::Avg => {
            if rows.is_empty() {
                number(0.0)
            } else {
                number(nums().sum::<f64>() / rows.len() as f64)
            }
        }
        AggregateFn::Min => nums().reduce(f64::min).map(number).unwrap_or(Value::Null),
        AggregateFn::Max => nums().reduce(f64::max).map(number).unwrap_or(Value::Null),
    }
}

fn number(f: f64) -> Value {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn composite_key(row: &Row, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| row::display_value(row.get(c).unwrap_or(&Value::Null)))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
