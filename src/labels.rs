use std::{collections::HashMap, fs, path::Path};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("failed to read class indices: {0}")]
    Io(#[from] std::io::Error),
    #[error("class indices are not a label-to-index JSON object: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("class indices file has no labels")]
    Empty,
    #[error("class indices must cover 0..{count} exactly once, found index {index} for {label:?}")]
    BadIndex {
        label: String,
        index: usize,
        count: usize,
    },
}

/// Class names in the order the classifier emits their scores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabelSet {
    labels: Vec<String>,
}

impl ClassLabelSet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LabelError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parses `{"label": index, ...}`. Position `i` of the result holds the
    /// label mapped to index `i`, so the indices must form `0..n`.
    pub fn from_json(raw: &str) -> Result<Self, LabelError> {
        let indices: HashMap<String, usize> = serde_json::from_str(raw)?;
        if indices.is_empty() {
            return Err(LabelError::Empty);
        }

        let count = indices.len();
        let mut slots: Vec<Option<String>> = vec![None; count];
        for (label, index) in indices {
            match slots.get_mut(index) {
                Some(slot) if slot.is_none() => *slot = Some(label),
                _ => return Err(LabelError::BadIndex { label, index, count }),
            }
        }

        // Every slot is filled: n distinct indices, all below n.
        let labels = slots.into_iter().flatten().collect();
        Ok(ClassLabelSet { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}
