use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rusqlite::Connection;

use crate::clustering::TopicCluster;
use crate::labels::{LABEL_DELIMITER, LabelSet};

use super::debugging::{extract_debug_spans, index_id_from_content};
use super::grouping::{
    apply_metric_defaults, bad_row_indices, collect_questions, good_row_indices,
    merge_bad_clusters, merge_good_clusters, sample_rows,
};
use super::rows::{OutputRow, TraceRow, load_rows, validate_table_name, write_output};

fn make_row(trace_id: &str, question: &str, fluency: Option<f64>) -> TraceRow {
    let mut scores = BTreeMap::new();
    if let Some(score) = fluency {
        scores.insert("Fluency".to_string(), score);
    }

    TraceRow {
        trace_id: trace_id.to_string(),
        root_question: question.to_string(),
        completion: "answer".to_string(),
        scores,
        root_span: None,
        violated_metrics: LabelSet::new(),
        group_list: LabelSet::new(),
        topic_list: LabelSet::new(),
    }
}

fn asset_yaml() -> String {
    "index:\n  self:\n    asset_id: azureml://indexes/support-docs\n".to_string()
}

fn trace_json(with_parent: bool, mlindex: &str) -> String {
    let lookup_attributes = serde_json::json!({
        "inputs": serde_json::json!({"mlindex_content": mlindex}).to_string(),
    })
    .to_string();

    let documents = serde_json::json!([
        {"document.content": "doc a", "document.score": 0.91},
        {"document.content": "doc b", "document.score": "0.42"}
    ])
    .to_string();
    let retrieval_attributes = serde_json::json!({
        "retrieval.query": "why is my refund slow",
        "retrieval.documents": documents,
    })
    .to_string();

    serde_json::json!({
        "span_id": "root",
        "span_type": "LLM",
        "parent_id": null,
        "attributes": "{}",
        "children": [
            {
                "span_id": "lookup-1",
                "span_type": "Embedding",
                "parent_id": "root",
                "attributes": lookup_attributes,
                "children": [
                    {
                        "span_id": "retrieval-1",
                        "span_type": "Retrieval",
                        "parent_id": if with_parent { serde_json::json!("lookup-1") } else { serde_json::Value::Null },
                        "attributes": retrieval_attributes,
                        "children": []
                    }
                ]
            }
        ]
    })
    .to_string()
}

#[test]
fn fluency_example_assigns_flags_groups_and_topics() {
    let questions = [
        "refund took two weeks",
        "refund still processing",
        "refund never arrived",
        "refund stuck in review",
        "how do i export data",
        "how do i invite a user",
    ];
    let scores = [1.0, 1.0, 1.0, 1.0, 5.0, 5.0];
    let mut rows: Vec<TraceRow> = questions
        .iter()
        .zip(scores)
        .enumerate()
        .map(|(index, (question, score))| make_row(&format!("t{index}"), question, Some(score)))
        .collect();

    apply_metric_defaults(&mut rows, "Fluency", 3.0, 5.0);

    for row in &rows[..4] {
        assert!(row.violated_metrics.contains("Fluency"));
        assert!(row.group_list.contains("Fluency_bad_group_default"));
        assert!(!row.group_list.contains("Fluency_good_group"));
    }
    for row in &rows[4..] {
        assert!(row.violated_metrics.is_empty());
        assert!(row.group_list.contains("Fluency_good_group"));
    }

    let bad = bad_row_indices(&rows, "Fluency", 3.0);
    assert_eq!(bad, vec![0, 1, 2, 3]);
    let good = good_row_indices(&rows, "Fluency", 5.0);
    assert_eq!(good, vec![4, 5]);

    let mut rng = StdRng::seed_from_u64(7);
    let bad_sample = sample_rows(&bad, 4, &mut rng);
    assert_eq!(bad_sample.len(), 4);

    let clusters = vec![TopicCluster {
        label: "slow response".to_string(),
        members: collect_questions(&rows, &bad_sample),
    }];
    merge_bad_clusters(&mut rows, "Fluency", &clusters);

    for row in &rows[..4] {
        assert!(row.topic_list.contains("slow response"));
        assert!(row.group_list.contains("Fluency_bad_group_0_slow response"));
    }
    for row in &rows[4..] {
        assert!(row.topic_list.is_empty());
    }

    let good_clusters = vec![TopicCluster {
        label: "account management".to_string(),
        members: collect_questions(&rows, &good),
    }];
    merge_good_clusters(&mut rows, "Fluency", 5.0, &good_clusters);

    for row in &rows[4..] {
        assert!(row.topic_list.contains("account management"));
        assert!(!row.group_list.encode().contains("account management"));
    }
}

#[test]
fn merge_bad_skips_rows_without_the_violated_metric() {
    let mut rows = vec![
        make_row("t0", "shared question", Some(1.0)),
        make_row("t1", "shared question", Some(4.0)),
    ];
    apply_metric_defaults(&mut rows, "Fluency", 3.0, 5.0);

    let clusters = vec![TopicCluster {
        label: "slow response".to_string(),
        members: vec!["shared question".to_string()],
    }];
    merge_bad_clusters(&mut rows, "Fluency", &clusters);

    assert!(rows[0].topic_list.contains("slow response"));
    assert!(rows[1].topic_list.is_empty());
    assert!(rows[1].group_list.is_empty());
}

#[test]
fn merge_good_requires_the_maximum_score() {
    let mut rows = vec![
        make_row("t0", "shared question", Some(5.0)),
        make_row("t1", "shared question", Some(4.0)),
    ];

    let clusters = vec![TopicCluster {
        label: "billing".to_string(),
        members: vec!["shared question".to_string()],
    }];
    merge_good_clusters(&mut rows, "Fluency", 5.0, &clusters);

    assert!(rows[0].topic_list.contains("billing"));
    assert!(rows[1].topic_list.is_empty());
}

#[test]
fn rows_without_a_score_are_untouched_by_defaults() {
    let mut rows = vec![make_row("t0", "question", None)];
    apply_metric_defaults(&mut rows, "Fluency", 3.0, 5.0);

    assert!(rows[0].violated_metrics.is_empty());
    assert!(rows[0].group_list.is_empty());
}

#[test]
fn sampling_is_capped_and_without_replacement() {
    let indices: Vec<usize> = (0..10).collect();
    let mut rng = StdRng::seed_from_u64(42);

    let all = sample_rows(&indices, 20, &mut rng);
    assert_eq!(all.len(), 10);

    let some = sample_rows(&indices, 3, &mut rng);
    assert_eq!(some.len(), 3);
    let mut unique = some.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 3);
    assert!(some.iter().all(|index| indices.contains(index)));
}

#[test]
fn extract_debug_spans_reads_retrieval_and_lookup_fields() {
    let raw = trace_json(true, &asset_yaml());
    let spans = extract_debug_spans("t0", &raw);

    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.span_id, "lookup-1");
    assert_eq!(span.prompt, "why is my refund slow");
    assert_eq!(span.index_id.as_deref(), Some("azureml://indexes/support-docs"));
    assert_eq!(span.context, format!("doc a{LABEL_DELIMITER}doc b"));
    assert!((span.index_score - 0.91).abs() < 1e-9);
    assert!(span.index_content.contains("asset_id"));
}

#[test]
fn retrieval_span_without_parent_yields_no_spans() {
    let raw = trace_json(false, &asset_yaml());
    let spans = extract_debug_spans("t0", &raw);
    assert!(spans.is_empty());
}

#[test]
fn missing_retrieval_fields_are_recovered_per_row() {
    let retrieval_attributes =
        serde_json::json!({"retrieval.query": "question without documents"}).to_string();
    let lookup_attributes = serde_json::json!({
        "inputs": serde_json::json!({"mlindex_content": asset_yaml()}).to_string(),
    })
    .to_string();
    let raw = serde_json::json!({
        "span_id": "lookup-1",
        "span_type": "Embedding",
        "parent_id": null,
        "attributes": lookup_attributes,
        "children": [
            {
                "span_id": "retrieval-1",
                "span_type": "Retrieval",
                "parent_id": "lookup-1",
                "attributes": retrieval_attributes,
                "children": []
            }
        ]
    })
    .to_string();

    let spans = extract_debug_spans("t0", &raw);
    assert!(spans.is_empty());
}

#[test]
fn unparseable_trace_yields_no_spans() {
    assert!(extract_debug_spans("t0", "not a trace").is_empty());
}

#[test]
fn index_id_fallback_order() {
    let with_asset = "index:\n  self:\n    asset_id: X\n  index: ignored\n";
    assert_eq!(index_id_from_content(with_asset).unwrap().as_deref(), Some("X"));

    // a self block without an asset id wins over a sibling index name
    let self_without_asset = "index:\n  self:\n    kind: faiss\n  index: ignored\n";
    assert_eq!(index_id_from_content(self_without_asset).unwrap(), None);

    let with_name = "index:\n  index: Y\n";
    assert_eq!(index_id_from_content(with_name).unwrap().as_deref(), Some("Y"));

    let with_neither = "index:\n  kind: faiss\n";
    assert_eq!(index_id_from_content(with_neither).unwrap(), None);

    assert!(index_id_from_content("embeddings:\n  kind: none\n").is_err());
    assert!(index_id_from_content(": not yaml :\n-").is_err());
}

#[test]
fn mlindex_without_index_mapping_drops_the_row() {
    let raw = trace_json(true, "embeddings:\n  kind: none\n");
    let spans = extract_debug_spans("t0", &raw);
    assert!(spans.is_empty());
}

#[test]
fn load_rows_reads_dynamic_metric_columns() {
    let connection = Connection::open_in_memory().unwrap();
    connection
        .execute_batch(
            "
            CREATE TABLE scored_traffic (
              trace_id TEXT,
              prompt TEXT,
              completion TEXT,
              Fluency REAL,
              root_span TEXT
            );
            INSERT INTO scored_traffic VALUES('t0', 'q0', 'a0', 1.0, '{}');
            INSERT INTO scored_traffic VALUES('t1', 'q1', 'a1', NULL, NULL);
            INSERT INTO scored_traffic VALUES(NULL, 'q2', 'a2', 5.0, NULL);
            ",
        )
        .unwrap();

    let metrics = vec!["Fluency".to_string(), "Coherence".to_string()];
    let mut warnings = Vec::new();
    let rows = load_rows(
        &connection,
        "scored_traffic",
        "prompt",
        "completion",
        &metrics,
        &mut warnings,
    )
    .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].trace_id, "t0");
    assert_eq!(rows[0].root_question, "q0");
    assert_eq!(rows[0].score("Fluency"), Some(1.0));
    assert_eq!(rows[1].score("Fluency"), None);
    assert!(rows[0].root_span.is_some());

    // one for the missing Coherence column, one for the null trace_id
    assert_eq!(warnings.len(), 2);
}

#[test]
fn load_rows_requires_core_columns() {
    let connection = Connection::open_in_memory().unwrap();
    connection
        .execute_batch("CREATE TABLE scored_traffic (trace_id TEXT, completion TEXT);")
        .unwrap();

    let mut warnings = Vec::new();
    let result = load_rows(
        &connection,
        "scored_traffic",
        "prompt",
        "completion",
        &[],
        &mut warnings,
    );
    assert!(result.is_err());
}

#[test]
fn empty_output_is_schema_valid() {
    let mut connection = Connection::open_in_memory().unwrap();
    let written = write_output(&mut connection, "problem_traffic", &[]).unwrap();
    assert_eq!(written, 0);

    let mut statement = connection
        .prepare(
            "SELECT trace_id, span_id, root_question, prompt, completion,
                    topic_list, group_list, violated_metrics,
                    index_content, index_id, context, index_score
             FROM problem_traffic",
        )
        .unwrap();
    let count = statement.query([]).unwrap().mapped(|_| Ok(())).count();
    assert_eq!(count, 0);
}

#[test]
fn write_output_replaces_previous_contents() {
    let mut connection = Connection::open_in_memory().unwrap();

    let row = OutputRow {
        trace_id: "t0".to_string(),
        span_id: "lookup-1".to_string(),
        root_question: "q0".to_string(),
        prompt: "retrieval query".to_string(),
        completion: "a0".to_string(),
        topic_list: "slow response".to_string(),
        group_list: "Fluency_bad_group_default".to_string(),
        violated_metrics: "Fluency".to_string(),
        index_content: asset_yaml(),
        index_id: None,
        context: "doc a".to_string(),
        index_score: 0.91,
    };
    write_output(&mut connection, "problem_traffic", &[row.clone(), row]).unwrap();

    let count: i64 = connection
        .query_row("SELECT COUNT(*) FROM problem_traffic", [], |sql_row| sql_row.get(0))
        .unwrap();
    assert_eq!(count, 2);

    let index_id: Option<String> = connection
        .query_row("SELECT index_id FROM problem_traffic LIMIT 1", [], |sql_row| {
            sql_row.get(0)
        })
        .unwrap();
    assert_eq!(index_id, None);

    write_output(&mut connection, "problem_traffic", &[]).unwrap();
    let count: i64 = connection
        .query_row("SELECT COUNT(*) FROM problem_traffic", [], |sql_row| sql_row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn table_names_are_validated() {
    assert!(validate_table_name("problem_traffic").is_ok());
    assert!(validate_table_name("scored_traffic2").is_ok());
    assert!(validate_table_name("").is_err());
    assert!(validate_table_name("bad-name").is_err());
    assert!(validate_table_name("x; DROP TABLE y").is_err());
}
