use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::semantic::{
    EMBEDDING_DIM, content_words, cosine_similarity, embed_question, normalize_vector,
};

pub const API_KEY_ENV: &str = "TRAFFIC_TRIAGE_API_KEY";

const CLUSTER_SIMILARITY_FLOOR: f64 = 0.35;
const CLUSTER_KEYWORD_COUNT: usize = 5;
const LABEL_SAMPLE_DOCS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCluster {
    pub label: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LabelerConfig {
    pub endpoint: Option<String>,
    pub deployment: String,
    pub temperature: f64,
    pub timeout: Duration,
    pub retry_max: u32,
    pub retry_backoff: Duration,
}

pub trait TopicLabeler {
    fn label(&self, members: &[String], keywords: &[String]) -> Result<String>;
}

/// Groups question texts into semantic clusters and attaches a short topic
/// label to each. Members are verbatim input strings; downstream merging
/// matches them against rows by exact string equality.
pub struct QueryClusterer {
    min_cluster_size: usize,
    labeler: Box<dyn TopicLabeler>,
}

impl QueryClusterer {
    pub fn new(min_cluster_size: usize, labeler: Box<dyn TopicLabeler>) -> Self {
        Self {
            min_cluster_size,
            labeler,
        }
    }

    pub fn from_config(min_cluster_size: usize, config: &LabelerConfig) -> Result<Self> {
        let labeler: Box<dyn TopicLabeler> = match &config.endpoint {
            Some(endpoint) => Box::new(LlmTopicLabeler::from_env(endpoint, config)?),
            None => Box::new(KeywordTopicLabeler),
        };
        Ok(Self::new(min_cluster_size, labeler))
    }

    pub fn topics(&self, questions: &[String]) -> Result<Vec<TopicCluster>> {
        if questions.is_empty() {
            return Ok(Vec::new());
        }

        let groups = group_by_similarity(questions);
        let dropped = groups
            .iter()
            .filter(|group| group.len() < self.min_cluster_size)
            .count();
        if dropped > 0 {
            info!(
                dropped,
                min_cluster_size = self.min_cluster_size,
                "dropped noise clusters below minimum size"
            );
        }

        let document_frequency = document_frequencies(questions);
        let mut clusters = Vec::new();
        for group in groups
            .into_iter()
            .filter(|group| group.len() >= self.min_cluster_size)
        {
            let members: Vec<String> = group
                .iter()
                .map(|index| questions[*index].clone())
                .collect();
            let keywords = cluster_keywords(&members, &document_frequency, questions.len());
            let label = self.labeler.label(&members, &keywords)?;
            clusters.push(TopicCluster { label, members });
        }

        disambiguate_labels(&mut clusters);
        Ok(clusters)
    }
}

/// Greedy centroid assignment over local embeddings: each question joins the
/// nearest existing cluster above the similarity floor or starts a new one.
fn group_by_similarity(questions: &[String]) -> Vec<Vec<usize>> {
    let embeddings: Vec<Vec<f32>> = questions
        .iter()
        .map(|question| embed_question(question, EMBEDDING_DIM))
        .collect();

    let mut members: Vec<Vec<usize>> = Vec::new();
    let mut centroids: Vec<Vec<f32>> = Vec::new();

    for (index, embedding) in embeddings.iter().enumerate() {
        let mut best: Option<(usize, f64)> = None;
        for (cluster_index, centroid) in centroids.iter().enumerate() {
            let similarity = cosine_similarity(embedding, centroid);
            if best.map(|(_, score)| similarity > score).unwrap_or(true) {
                best = Some((cluster_index, similarity));
            }
        }

        match best {
            Some((cluster_index, similarity)) if similarity >= CLUSTER_SIMILARITY_FLOOR => {
                members[cluster_index].push(index);
                let centroid = &mut centroids[cluster_index];
                for (slot, value) in centroid.iter_mut().zip(embedding.iter()) {
                    *slot += value;
                }
                normalize_vector(centroid);
            }
            _ => {
                members.push(vec![index]);
                centroids.push(embedding.clone());
            }
        }
    }

    members
}

fn document_frequencies(questions: &[String]) -> HashMap<String, usize> {
    let mut frequencies = HashMap::new();
    for question in questions {
        let unique: HashSet<String> = content_words(question).into_iter().collect();
        for word in unique {
            *frequencies.entry(word).or_insert(0) += 1;
        }
    }
    frequencies
}

fn cluster_keywords(
    members: &[String],
    document_frequency: &HashMap<String, usize>,
    total_documents: usize,
) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for member in members {
        let unique: HashSet<String> = content_words(member).into_iter().collect();
        for word in unique {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut scored: Vec<(String, f64)> = counts
        .into_iter()
        .map(|(word, count)| {
            let frequency = document_frequency.get(&word).copied().unwrap_or(1);
            let rarity = (((total_documents + 1) as f64) / ((frequency + 1) as f64)).ln() + 1.0;
            (word, count as f64 * rarity)
        })
        .collect();

    scored.sort_by(|left, right| {
        right
            .1
            .partial_cmp(&left.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.0.cmp(&right.0))
    });
    scored.truncate(CLUSTER_KEYWORD_COUNT);
    scored.into_iter().map(|(word, _)| word).collect()
}

fn disambiguate_labels(clusters: &mut [TopicCluster]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for cluster in clusters.iter_mut() {
        let count = seen
            .entry(cluster.label.clone())
            .and_modify(|value| *value += 1)
            .or_insert(1);
        if *count > 1 {
            cluster.label = format!("{} ({count})", cluster.label);
        }
    }
}

/// Local fallback labeler used when no endpoint is configured: the cluster's
/// most distinguishing terms become the label.
pub struct KeywordTopicLabeler;

impl TopicLabeler for KeywordTopicLabeler {
    fn label(&self, _members: &[String], keywords: &[String]) -> Result<String> {
        let label = keywords
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<String>>()
            .join(" ");
        if label.is_empty() {
            return Ok("unlabeled".to_string());
        }
        Ok(label)
    }
}

/// Labels clusters through an OpenAI-style chat-completions deployment.
pub struct LlmTopicLabeler {
    client: Client,
    endpoint: String,
    deployment: String,
    api_key: String,
    temperature: f64,
    retry_max: u32,
    retry_backoff: Duration,
}

impl LlmTopicLabeler {
    pub fn from_env(endpoint: &str, config: &LabelerConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .with_context(|| format!("{API_KEY_ENV} must be set when a label endpoint is configured"))?;
        Self::new(endpoint, api_key, config)
    }

    pub fn new(endpoint: &str, api_key: String, config: &LabelerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build label http client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            deployment: config.deployment.clone(),
            api_key,
            temperature: config.temperature,
            retry_max: config.retry_max,
            retry_backoff: config.retry_backoff,
        })
    }

    fn request_label(&self, prompt: &str) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.deployment,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": "You produce short topic labels for clusters of user questions."},
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .context("label request failed")?;

        if !response.status().is_success() {
            bail!(
                "label endpoint returned http {}",
                response.status().as_u16()
            );
        }

        let body: ChatCompletionResponse =
            response.json().context("failed to parse label response")?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();

        let label = parse_topic_label(&content);
        if label.is_empty() {
            bail!("label endpoint returned an empty label");
        }
        Ok(label)
    }
}

impl TopicLabeler for LlmTopicLabeler {
    fn label(&self, members: &[String], keywords: &[String]) -> Result<String> {
        let prompt = topic_label_prompt(members, keywords);
        let mut backoff = self.retry_backoff;
        let mut last_error = None;

        for attempt in 0..=self.retry_max {
            if attempt > 0 {
                warn!(attempt, "retrying topic label request");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
            }

            match self.request_label(&prompt) {
                Ok(label) => return Ok(label),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("label request never attempted")))
            .context("topic labeling failed after retries")
    }
}

fn topic_label_prompt(members: &[String], keywords: &[String]) -> String {
    let documents = members
        .iter()
        .take(LABEL_SAMPLE_DOCS)
        .map(|member| format!("- {member}"))
        .collect::<Vec<String>>()
        .join("\n");

    format!(
        "I have a topic that contains the following user questions:\n{documents}\n\n\
         The topic is described by the following keywords: {keywords}\n\n\
         Based on the information above, reply with a short label for this topic in the format:\n\
         topic: <topic label>",
        keywords = keywords.join(", ")
    )
}

fn parse_topic_label(content: &str) -> String {
    let first_line = content
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");
    let trimmed = first_line.trim();
    let value = trimmed
        .strip_prefix("topic:")
        .or_else(|| trimmed.strip_prefix("Topic:"))
        .unwrap_or(trimmed);
    value
        .trim()
        .trim_end_matches('.')
        .trim_matches('"')
        .trim()
        .to_string()
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}
