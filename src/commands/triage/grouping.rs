use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::clustering::TopicCluster;
use crate::labels::{bad_group_key, default_bad_group_name, good_group_name};

use super::rows::TraceRow;

fn is_good(score: f64, good_score: f64) -> bool {
    (score - good_score).abs() < f64::EPSILON
}

/// Per-metric label pass: flags violations and assigns the default good/bad
/// group. Rows without a score for the metric are left unchanged.
pub(crate) fn apply_metric_defaults(
    rows: &mut [TraceRow],
    metric: &str,
    threshold: f64,
    good_score: f64,
) {
    for row in rows.iter_mut() {
        let Some(score) = row.score(metric) else {
            continue;
        };

        if score < threshold {
            row.violated_metrics.insert(metric);
            row.group_list.insert(&default_bad_group_name(metric));
        } else if is_good(score, good_score) {
            row.group_list.insert(&good_group_name(metric));
        }
    }
}

pub(crate) fn bad_row_indices(rows: &[TraceRow], metric: &str, threshold: f64) -> Vec<usize> {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| row.score(metric).map(|score| score < threshold).unwrap_or(false))
        .map(|(index, _)| index)
        .collect()
}

pub(crate) fn good_row_indices(rows: &[TraceRow], metric: &str, good_score: f64) -> Vec<usize> {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| {
            row.score(metric)
                .map(|score| is_good(score, good_score))
                .unwrap_or(false)
        })
        .map(|(index, _)| index)
        .collect()
}

/// Uniform sample without replacement, capped at the partition size.
pub(crate) fn sample_rows(indices: &[usize], sample_size: usize, rng: &mut StdRng) -> Vec<usize> {
    indices
        .choose_multiple(rng, sample_size.min(indices.len()))
        .copied()
        .collect()
}

pub(crate) fn collect_questions(rows: &[TraceRow], indices: &[usize]) -> Vec<String> {
    indices
        .iter()
        .map(|index| rows[*index].root_question.clone())
        .collect()
}

/// Folds bad-partition clustering output back onto the full row set: any row
/// whose question appears in a cluster and whose violated set contains the
/// metric picks up the topic and the synthesized group key. Membership in
/// several clusters is additive.
pub(crate) fn merge_bad_clusters(rows: &mut [TraceRow], metric: &str, clusters: &[TopicCluster]) {
    for (cluster_index, cluster) in clusters.iter().enumerate() {
        let group_key = bad_group_key(metric, cluster_index, &cluster.label);
        let members: HashSet<&str> = cluster.members.iter().map(String::as_str).collect();

        for row in rows.iter_mut() {
            if row.violated_metrics.contains(metric)
                && members.contains(row.root_question.as_str())
            {
                row.topic_list.insert(&cluster.label);
                row.group_list.insert(&group_key);
            }
        }
    }
}

/// Good-partition merge assigns topics only, never group keys.
pub(crate) fn merge_good_clusters(
    rows: &mut [TraceRow],
    metric: &str,
    good_score: f64,
    clusters: &[TopicCluster],
) {
    for cluster in clusters {
        let members: HashSet<&str> = cluster.members.iter().map(String::as_str).collect();

        for row in rows.iter_mut() {
            let good = row
                .score(metric)
                .map(|score| is_good(score, good_score))
                .unwrap_or(false);
            if good && members.contains(row.root_question.as_str()) {
                row.topic_list.insert(&cluster.label);
            }
        }
    }
}
