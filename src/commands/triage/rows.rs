use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use tracing::warn;

use crate::labels::LabelSet;
use crate::util::ensure_directory;

/// One scored interaction at trace level, with the mutable label state
/// threaded through the per-metric loop.
#[derive(Debug, Clone)]
pub(crate) struct TraceRow {
    pub trace_id: String,
    pub root_question: String,
    pub completion: String,
    pub scores: BTreeMap<String, f64>,
    pub root_span: Option<String>,
    pub violated_metrics: LabelSet,
    pub group_list: LabelSet,
    pub topic_list: LabelSet,
}

impl TraceRow {
    pub fn score(&self, metric: &str) -> Option<f64> {
        self.scores.get(metric).copied()
    }
}

/// One span-level output record, immutable once built.
#[derive(Debug, Clone)]
pub(crate) struct OutputRow {
    pub trace_id: String,
    pub span_id: String,
    pub root_question: String,
    pub prompt: String,
    pub completion: String,
    pub topic_list: String,
    pub group_list: String,
    pub violated_metrics: String,
    pub index_content: String,
    pub index_id: Option<String>,
    pub context: String,
    pub index_score: f64,
}

pub(crate) fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory(parent)?;
        }
    }

    let connection = Connection::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(connection)
}

pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '_');
    if !valid {
        bail!("invalid table name: {name}");
    }
    Ok(())
}

pub(crate) fn load_rows(
    connection: &Connection,
    table: &str,
    prompt_column: &str,
    completion_column: &str,
    metrics: &[String],
    warnings: &mut Vec<String>,
) -> Result<Vec<TraceRow>> {
    validate_table_name(table)?;

    let sql = format!("SELECT * FROM {table}");
    let mut statement = connection
        .prepare(&sql)
        .with_context(|| format!("failed to read input table {table}"))?;
    let columns: Vec<String> = statement
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let column_index = |name: &str| columns.iter().position(|column| column == name);
    let trace_index = column_index("trace_id")
        .with_context(|| format!("input table {table} missing trace_id column"))?;
    let prompt_index = column_index(prompt_column)
        .with_context(|| format!("input table {table} missing prompt column {prompt_column}"))?;
    let completion_index = column_index(completion_column).with_context(|| {
        format!("input table {table} missing completion column {completion_column}")
    })?;
    let span_index = column_index("root_span");
    if span_index.is_none() {
        warnings.push(format!("input table {table} has no root_span column"));
        warn!(table = %table, "input table has no root_span column, no debugging info will be extracted");
    }

    let mut metric_indices = Vec::new();
    for metric in metrics {
        match column_index(metric) {
            Some(index) => metric_indices.push((metric.clone(), index)),
            None => {
                warnings.push(format!("input table {table} has no score column for {metric}"));
                warn!(table = %table, metric = %metric, "input table has no score column for metric");
            }
        }
    }

    let mut rows = Vec::new();
    let mut skipped = 0_usize;
    let mut result_rows = statement
        .query([])
        .with_context(|| format!("failed to query input table {table}"))?;

    while let Some(sql_row) = result_rows
        .next()
        .with_context(|| format!("failed to iterate input table {table}"))?
    {
        let trace_id: Option<String> = sql_row.get(trace_index)?;
        let Some(trace_id) = trace_id else {
            skipped += 1;
            continue;
        };

        let root_question: Option<String> = sql_row.get(prompt_index)?;
        let completion: Option<String> = sql_row.get(completion_index)?;
        let root_span: Option<String> = match span_index {
            Some(index) => sql_row.get(index)?,
            None => None,
        };

        let mut scores = BTreeMap::new();
        for (metric, index) in &metric_indices {
            let score: Option<f64> = sql_row.get(*index)?;
            if let Some(score) = score {
                scores.insert(metric.clone(), score);
            }
        }

        rows.push(TraceRow {
            trace_id,
            root_question: root_question.unwrap_or_default(),
            completion: completion.unwrap_or_default(),
            scores,
            root_span,
            violated_metrics: LabelSet::new(),
            group_list: LabelSet::new(),
            topic_list: LabelSet::new(),
        });
    }

    if skipped > 0 {
        warnings.push(format!("skipped {skipped} input rows without a trace_id"));
        warn!(skipped, "skipped input rows without a trace_id");
    }

    Ok(rows)
}

pub(crate) fn ensure_output_schema(connection: &Connection, table: &str) -> Result<()> {
    validate_table_name(table)?;

    let ddl = format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
          trace_id TEXT,
          span_id TEXT,
          root_question TEXT,
          prompt TEXT,
          completion TEXT,
          topic_list TEXT,
          group_list TEXT,
          violated_metrics TEXT,
          index_content TEXT,
          index_id TEXT,
          context TEXT,
          index_score REAL
        )
        "
    );
    connection
        .execute_batch(&ddl)
        .with_context(|| format!("failed to create output table {table}"))?;
    Ok(())
}

/// Replaces the output table's contents. An empty slice leaves an
/// empty-but-schema-valid table behind.
pub(crate) fn write_output(
    connection: &mut Connection,
    table: &str,
    rows: &[OutputRow],
) -> Result<usize> {
    ensure_output_schema(connection, table)?;

    let tx = connection.transaction()?;
    tx.execute(&format!("DELETE FROM {table}"), [])
        .with_context(|| format!("failed to clear output table {table}"))?;

    {
        let mut statement = tx.prepare(&format!(
            "
            INSERT INTO {table}(
              trace_id, span_id, root_question, prompt, completion,
              topic_list, group_list, violated_metrics,
              index_content, index_id, context, index_score
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "
        ))?;

        for row in rows {
            statement.execute(params![
                row.trace_id,
                row.span_id,
                row.root_question,
                row.prompt,
                row.completion,
                row.topic_list,
                row.group_list,
                row.violated_metrics,
                row.index_content,
                row.index_id,
                row.context,
                row.index_score,
            ])?;
        }
    }

    tx.commit()?;
    Ok(rows.len())
}
