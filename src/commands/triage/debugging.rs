use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::warn;

use crate::labels::LABEL_DELIMITER;
use crate::trace::{RETRIEVAL_SPAN_TYPE, SpanTree};

/// Debugging context reconstructed from one retrieval step of a trace. The
/// span id is the parent index-lookup span's id.
#[derive(Debug, Clone)]
pub(crate) struct DebugSpan {
    pub span_id: String,
    pub index_content: String,
    pub index_id: Option<String>,
    pub prompt: String,
    pub context: String,
    pub index_score: f64,
}

/// Walks a row's span tree and emits one DebugSpan per retrieval step.
/// Structural problems are logged and collapse to an empty result, never a
/// fatal error.
pub(crate) fn extract_debug_spans(trace_id: &str, root_span: &str) -> Vec<DebugSpan> {
    match try_extract(root_span) {
        Ok(spans) => spans,
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                error = %err,
                "failed to extract debugging info, dropping row"
            );
            Vec::new()
        }
    }
}

fn try_extract(root_span: &str) -> Result<Vec<DebugSpan>> {
    let tree = SpanTree::from_json(root_span)?;
    let mut spans = Vec::new();

    for span in tree.iter() {
        if span.span_type != RETRIEVAL_SPAN_TYPE {
            continue;
        }

        let Some(parent_id) = span.parent_id.as_deref() else {
            warn!(span_id = %span.span_id, "retrieval span has no lookup parent, no usable debugging info");
            return Ok(Vec::new());
        };

        let index_span = tree
            .get(parent_id)
            .with_context(|| format!("lookup span {parent_id} not found in trace"))?;
        let index_attributes = index_span.attributes_json()?;
        let inputs_raw = index_attributes
            .get("inputs")
            .and_then(Value::as_str)
            .with_context(|| format!("lookup span {parent_id} attributes missing inputs"))?;
        let inputs: Value = serde_json::from_str(inputs_raw)
            .with_context(|| format!("failed to parse inputs of lookup span {parent_id}"))?;
        let index_content = inputs
            .get("mlindex_content")
            .and_then(Value::as_str)
            .with_context(|| format!("lookup span {parent_id} inputs missing mlindex_content"))?;
        let index_id = index_id_from_content(index_content)?;

        let retrieval = span.attributes_json()?;
        let query = retrieval
            .get("retrieval.query")
            .and_then(Value::as_str)
            .with_context(|| format!("retrieval span {} missing retrieval.query", span.span_id))?;
        let documents_raw = retrieval
            .get("retrieval.documents")
            .and_then(Value::as_str)
            .with_context(|| {
                format!("retrieval span {} missing retrieval.documents", span.span_id)
            })?;
        let documents: Vec<Value> = serde_json::from_str(documents_raw).with_context(|| {
            format!("failed to parse documents of retrieval span {}", span.span_id)
        })?;

        if documents.is_empty() {
            bail!("retrieval span {} has no documents", span.span_id);
        }

        let mut contents = Vec::new();
        let mut max_score = f64::MIN;
        for document in &documents {
            let content = document
                .get("document.content")
                .and_then(Value::as_str)
                .context("retrieved document missing document.content")?;
            let score = document
                .get("document.score")
                .and_then(score_value)
                .context("retrieved document missing document.score")?;

            contents.push(content.to_string());
            max_score = max_score.max(score);
        }

        spans.push(DebugSpan {
            span_id: parent_id.to_string(),
            index_content: index_content.to_string(),
            index_id,
            prompt: query.to_string(),
            context: contents.join(LABEL_DELIMITER),
            index_score: max_score,
        });
    }

    Ok(spans)
}

fn score_value(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
}

/// Index identity fallback inside the index yaml. A `self` block commits to
/// its asset id, present or not; only when `self` is absent does the index
/// name apply. A document without a top-level `index` mapping is an error,
/// which drops the row upstream.
pub(crate) fn index_id_from_content(content: &str) -> Result<Option<String>> {
    let payload: serde_yaml::Value =
        serde_yaml::from_str(content).context("failed to parse mlindex content yaml")?;
    let index = payload
        .get("index")
        .context("mlindex content missing index mapping")?;

    if let Some(self_block) = index.get("self") {
        return Ok(self_block
            .get("asset_id")
            .and_then(serde_yaml::Value::as_str)
            .map(str::to_string));
    }

    if let Some(name) = index.get("index").and_then(serde_yaml::Value::as_str) {
        return Ok(Some(name.to_string()));
    }

    Ok(None)
}
