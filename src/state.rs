// Shared state handed to every request handler
use crate::config::RequestLimits;
use crate::models::SequenceClassifier;
use std::path::PathBuf;
use std::sync::Arc;

/// Built once at startup and never mutated afterwards.
#[derive(Clone)]
pub struct AppState {
    pub classifier: Option<Arc<dyn SequenceClassifier>>,
    pub model_path: PathBuf,
    pub max_length: usize,
    pub limits: RequestLimits,
}

impl AppState {
    pub fn new(
        classifier: Arc<dyn SequenceClassifier>,
        model_path: PathBuf,
        limits: RequestLimits,
    ) -> Self {
        let max_length = classifier.metadata().max_length;
        Self {
            classifier: Some(classifier),
            model_path,
            max_length,
            limits,
        }
    }

    /// State without a model; inference endpoints answer 503.
    pub fn unloaded(model_path: PathBuf, max_length: usize, limits: RequestLimits) -> Self {
        Self {
            classifier: None,
            model_path,
            max_length,
            limits,
        }
    }

    pub fn model_loaded(&self) -> bool {
        self.classifier.is_some()
    }
}
