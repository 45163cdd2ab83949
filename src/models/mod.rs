// Model host abstractions shared by the HTTP layer and the BERT implementation
pub mod bert;

use crate::error::{InferenceError, LoadError};
use std::collections::HashMap;

/// A loaded sequence classifier. Implementations are immutable after load and
/// shared across worker threads.
pub trait SequenceClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<Prediction, InferenceError>;

    fn metadata(&self) -> &ModelMetadata;
}

/// Load-time options for a classifier.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub device: String,
    pub max_length: usize,
    pub num_labels: usize,
    /// Overrides the labels found in the model config when non-empty.
    pub labels: Vec<String>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            max_length: 512,
            num_labels: 4,
            labels: Vec::new(),
        }
    }
}

/// Static facts about a loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    pub labels: Vec<String>,
    pub max_length: usize,
    pub device: String,
    pub parameters: usize,
    pub vocab_size: usize,
}

/// Probability distribution over the class set plus the selected class.
/// Only built through [`Prediction::from_probabilities`], so `class_index`
/// always points into `probabilities`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    class_index: usize,
    probabilities: Vec<f32>,
}

impl Prediction {
    /// Picks the argmax of a probability vector. Ties go to the lowest index.
    pub fn from_probabilities(probabilities: Vec<f32>) -> Result<Self, InferenceError> {
        if probabilities.is_empty() {
            return Err(InferenceError::InvalidOutput("no class scores".to_string()));
        }
        if let Some(bad) = probabilities.iter().find(|p| !p.is_finite()) {
            return Err(InferenceError::InvalidOutput(format!(
                "non-finite score {bad}"
            )));
        }

        let mut class_index = 0;
        for (idx, prob) in probabilities.iter().enumerate() {
            if *prob > probabilities[class_index] {
                class_index = idx;
            }
        }

        Ok(Self {
            class_index,
            probabilities,
        })
    }

    pub fn class_index(&self) -> usize {
        self.class_index
    }

    pub fn probabilities(&self) -> &[f32] {
        &self.probabilities
    }

    pub fn confidence(&self) -> f32 {
        self.probabilities[self.class_index]
    }

    pub fn into_probabilities(self) -> Vec<f32> {
        self.probabilities
    }
}

/// Resolves the class labels: explicit labels first, then the config's
/// `id2label` map ordered by index, then plain indices.
pub fn resolve_labels(
    num_labels: usize,
    configured: &[String],
    id2label: Option<&HashMap<String, String>>,
) -> Result<Vec<String>, LoadError> {
    if num_labels == 0 {
        return Err(LoadError::Labels("num_labels must be at least 1".to_string()));
    }

    if !configured.is_empty() {
        if configured.len() != num_labels {
            return Err(LoadError::Labels(format!(
                "{} labels configured but num_labels is {}",
                configured.len(),
                num_labels
            )));
        }
        return Ok(configured.to_vec());
    }

    match id2label {
        Some(map) if !map.is_empty() => {
            if map.len() != num_labels {
                return Err(LoadError::Labels(format!(
                    "model config defines {} labels but num_labels is {}",
                    map.len(),
                    num_labels
                )));
            }
            (0..num_labels)
                .map(|idx| {
                    map.get(&idx.to_string()).cloned().ok_or_else(|| {
                        LoadError::Labels(format!("id2label has no entry for class {idx}"))
                    })
                })
                .collect()
        }
        _ => Ok((0..num_labels).map(|idx| idx.to_string()).collect()),
    }
}
