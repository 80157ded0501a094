use std::collections::BTreeSet;

/// Delimiter used when a label set crosses the storage boundary.
pub const LABEL_DELIMITER: &str = "#<SEP>#";

/// Ordered, deduplicated set of row labels. Membership is the observable
/// property; the delimited string form exists only for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    values: BTreeSet<String>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(encoded: &str) -> Self {
        let values = encoded
            .split(LABEL_DELIMITER)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect();
        Self { values }
    }

    pub fn encode(&self) -> String {
        self.values
            .iter()
            .cloned()
            .collect::<Vec<String>>()
            .join(LABEL_DELIMITER)
    }

    pub fn insert(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        self.values.insert(value.to_string());
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.contains(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

pub fn good_group_name(metric: &str) -> String {
    format!("{metric}_good_group")
}

pub fn default_bad_group_name(metric: &str) -> String {
    format!("{metric}_bad_group_default")
}

pub fn bad_group_key(metric: &str, cluster_index: usize, topic: &str) -> String {
    format!("{metric}_bad_group_{cluster_index}_{topic}")
}
