/// SQL judge - result-set comparison, table rendering and query execution
///
/// Row-sets are compared as multisets: column order and row order do not
/// matter, duplicates do. Ordering is defined over the JSON value model so
/// `1` and `1.0` compare equal and no string encoding leaks into the result.

use crate::evaluator::CaseOutcome;
use anyhow::Context;
use async_trait::async_trait;
use ojudge_common::types::{TestCase, TestCaseResult, VerdictKind};
use serde_json::{Map, Number, Value};
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use std::cmp::Ordering;
use std::time::{Duration, Instant};
use tracing::debug;

pub type SqlRow = Map<String, Value>;

/// Rendered in place of a table when a result set has no rows
pub const EMPTY_TABLE: &str = "(0 rows)";

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// Exact comparison of an integer against a float, without rounding through `f64`
fn compare_integer_float(int: i128, float: f64) -> Ordering {
    if float.is_nan() || float >= i128::MAX as f64 {
        return Ordering::Less;
    }
    if float < i128::MIN as f64 {
        return Ordering::Greater;
    }
    let whole = float.trunc();
    match int.cmp(&(whole as i128)) {
        Ordering::Equal => 0.0_f64
            .partial_cmp(&(float - whole))
            .unwrap_or(Ordering::Equal),
        ord => ord,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    match (as_integer(a), as_integer(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => compare_integer_float(x, b.as_f64().unwrap_or(f64::NAN)),
        (None, Some(y)) => compare_integer_float(y, a.as_f64().unwrap_or(f64::NAN)).reverse(),
        (None, None) => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            // -0.0 == 0.0, so the order agrees with the integer comparisons
            x.partial_cmp(&y).unwrap_or_else(|| x.total_cmp(&y))
        }
    }
}

fn compare_objects(a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
    let mut left: Vec<_> = a.iter().collect();
    let mut right: Vec<_> = b.iter().collect();
    left.sort_by(|x, y| x.0.cmp(y.0));
    right.sort_by(|x, y| x.0.cmp(y.0));

    for ((ka, va), (kb, vb)) in left.iter().zip(right.iter()) {
        let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Total order: null < bool < number < string < array < object
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                let ord = compare_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => compare_objects(x, y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Multiset equality of two row-sets
pub fn rows_equal(actual: &[SqlRow], expected: &[SqlRow]) -> bool {
    if actual.len() != expected.len() {
        return false;
    }
    let mut actual: Vec<&SqlRow> = actual.iter().collect();
    let mut expected: Vec<&SqlRow> = expected.iter().collect();
    actual.sort_by(|a, b| compare_objects(a, b));
    expected.sort_by(|a, b| compare_objects(a, b));

    actual
        .iter()
        .zip(expected.iter())
        .all(|(a, b)| compare_objects(a, b) == Ordering::Equal)
}

/// Parse a stored row-set: a JSON array of row objects
pub fn parse_rows(text: &str) -> anyhow::Result<Vec<SqlRow>> {
    let value: Value = serde_json::from_str(text).context("Row-set is not valid JSON")?;
    let Value::Array(items) = value else {
        anyhow::bail!("Row-set must be a JSON array");
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(row) => Ok(row),
            other => anyhow::bail!("Row {} is not an object: {}", i, other),
        })
        .collect()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fixed-width text table with a rule under every row
///
/// ```text
/// +----+-------+
/// | id | name  |
/// |----|-------|
/// | 1  | alice |
/// +----+-------+
/// ```
pub fn render_grid(grid: &[Vec<String>]) -> String {
    let columns = grid.iter().map(Vec::len).max().unwrap_or(0);
    if grid.is_empty() || columns == 0 {
        return EMPTY_TABLE.to_string();
    }

    let mut widths = vec![0usize; columns];
    for line in grid {
        for (i, cell) in line.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let border = |edge: char| {
        let mut out = String::new();
        for w in &widths {
            out.push(edge);
            out.push_str(&"-".repeat(w + 2));
        }
        out.push(edge);
        out.push('\n');
        out
    };

    let mut out = border('+');
    for (n, line) in grid.iter().enumerate() {
        for (i, w) in widths.iter().enumerate() {
            let cell = line.get(i).map(String::as_str).unwrap_or("");
            let pad = w - cell.chars().count();
            out.push_str("| ");
            out.push_str(cell);
            out.push_str(&" ".repeat(pad + 1));
        }
        out.push_str("|\n");
        if n + 1 < grid.len() {
            out.push_str(&border('|'));
        }
    }
    out.push_str(&border('+'));
    out
}

/// Header row of column names followed by one line per row
pub fn render_rows_table(rows: &[SqlRow]) -> String {
    let Some(first) = rows.first() else {
        return EMPTY_TABLE.to_string();
    };
    let header: Vec<String> = first.keys().cloned().collect();

    let mut grid = Vec::with_capacity(rows.len() + 1);
    grid.push(header.clone());
    for row in rows {
        grid.push(
            header
                .iter()
                .map(|col| row.get(col).map(cell_text).unwrap_or_default())
                .collect(),
        );
    }
    render_grid(&grid)
}

fn render_table_value(value: &Value) -> String {
    match value {
        Value::Array(items) if items.iter().all(Value::is_object) => {
            let rows: Vec<SqlRow> = items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect();
            render_rows_table(&rows)
        }
        Value::Array(items) => {
            let grid: Vec<Vec<String>> = items
                .iter()
                .map(|line| match line {
                    Value::Array(cells) => cells.iter().map(cell_text).collect(),
                    other => vec![cell_text(other)],
                })
                .collect();
            render_grid(&grid)
        }
        other => cell_text(other),
    }
}

/// Render each input table of a test case (`{table: rows}`) for display.
/// Input that is not a JSON object is passed through as text.
pub fn render_input_tables(input: &str) -> Value {
    match serde_json::from_str::<Value>(input) {
        Ok(Value::Object(tables)) => Value::Object(
            tables
                .iter()
                .map(|(name, table)| (name.clone(), Value::String(render_table_value(table))))
                .collect(),
        ),
        _ => Value::String(input.to_string()),
    }
}

/// Convert a text-protocol MySQL cell into its JSON value
pub fn convert_cell(type_name: &str, text: &str) -> Value {
    let base = type_name
        .trim_end_matches(" UNSIGNED")
        .to_ascii_uppercase();
    match base.as_str() {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR" | "BOOLEAN" => {
            if let Ok(n) = text.parse::<i64>() {
                Value::from(n)
            } else if let Ok(n) = text.parse::<u64>() {
                Value::from(n)
            } else {
                Value::String(text.to_string())
            }
        }
        "FLOAT" | "DOUBLE" | "REAL" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        "JSON" => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
        // DECIMAL keeps its exact text, as do dates and strings
        _ => Value::String(text.to_string()),
    }
}

/// Rows returned by one query execution
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<SqlRow>,
    /// Wall-clock milliseconds around the query
    pub runtime_ms: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("time limit exceeded")]
    TimedOut,
    /// Rejected by the database; the message is shown to the submitter
    #[error("{0}")]
    Query(String),
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

#[async_trait]
pub trait SqlEngine: Send + Sync {
    async fn run_query(&self, query: &str, time_limit_ms: u64) -> Result<QueryOutput, SqlError>;
}

/// Runs submitted queries against the judge database.
/// Each run happens inside a transaction that is always rolled back.
pub struct MySqlEngine {
    pool: MySqlPool,
}

impl MySqlEngine {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn decode_row(row: &MySqlRow) -> Result<SqlRow, SqlError> {
        let mut out = SqlRow::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let raw: Option<Vec<u8>> = row
                .try_get_unchecked(idx)
                .map_err(|e| SqlError::Infrastructure(anyhow::Error::new(e).context("Failed to decode column")))?;
            let value = match raw {
                None => Value::Null,
                Some(bytes) => convert_cell(column.type_info().name(), &String::from_utf8_lossy(&bytes)),
            };
            out.insert(column.name().to_string(), value);
        }
        Ok(out)
    }

    async fn execute(&self, query: &str) -> Result<QueryOutput, SqlError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let started = Instant::now();
        let fetched = sqlx::Executor::fetch_all(&mut *tx, query).await;
        let runtime_ms = started.elapsed().as_secs_f64() * 1000.0;

        let rollback = tx.rollback().await;
        let rows = fetched.map_err(map_sqlx_error)?;
        rollback.map_err(map_sqlx_error)?;

        let rows = rows.iter().map(Self::decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok(QueryOutput { rows, runtime_ms })
    }
}

fn map_sqlx_error(e: sqlx::Error) -> SqlError {
    match e {
        sqlx::Error::Database(db) => SqlError::Query(db.message().to_string()),
        other => SqlError::Infrastructure(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl SqlEngine for MySqlEngine {
    async fn run_query(&self, query: &str, time_limit_ms: u64) -> Result<QueryOutput, SqlError> {
        match tokio::time::timeout(Duration::from_millis(time_limit_ms), self.execute(query)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(limit_ms = time_limit_ms, "Query timed out");
                Err(SqlError::TimedOut)
            }
        }
    }
}

/// Classify one query run against its test case.
/// A malformed expected row-set is a problem-data fault, not a verdict.
pub fn classify_sql_case(
    case: &TestCase,
    outcome: Result<QueryOutput, SqlError>,
) -> anyhow::Result<CaseOutcome> {
    let output = match outcome {
        Ok(output) => output,
        Err(SqlError::TimedOut) => return Ok(CaseOutcome::TimedOut),
        Err(SqlError::Query(message)) => return Ok(CaseOutcome::RuntimeFailure(message)),
        Err(SqlError::Infrastructure(e)) => return Err(e),
    };

    let expected = parse_rows(&case.expected_output)
        .with_context(|| format!("Invalid expected output for test case {}", case.id))?;
    let accepted = rows_equal(&output.rows, &expected);

    Ok(CaseOutcome::Completed(TestCaseResult {
        status: if accepted {
            VerdictKind::Accepted
        } else {
            VerdictKind::WrongAnswer
        },
        test_input: render_input_tables(&case.input),
        expected_output: render_rows_table(&expected),
        real_output: render_rows_table(&output.rows),
        time: None,
        memory: None,
        runtime: Some(output.runtime_ms),
    }))
}
