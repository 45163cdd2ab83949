// Command line / environment configuration
use crate::models::ModelOptions;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "classification_server")]
#[command(about = "HTTP text classification service for a fine-tuned mBERT model", long_about = None)]
pub struct ServerConfig {
    /// Directory holding config.json, the tokenizer files and the weights
    #[arg(long, env = "MODEL_PATH", default_value = "./mbert")]
    pub model_path: PathBuf,

    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Number of HTTP workers (defaults to one per physical core)
    #[arg(long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// auto, cpu, cuda[:N] or metal[:N]
    #[arg(long, env = "DEVICE", default_value = "auto")]
    pub device: String,

    /// Maximum tokens per input, longer inputs are truncated
    #[arg(long, env = "MAX_LENGTH", default_value_t = 512)]
    pub max_length: usize,

    #[arg(long, env = "NUM_LABELS", default_value_t = 4)]
    pub num_labels: usize,

    /// Class labels in index order, overrides id2label from config.json
    #[arg(long, env = "LABELS", value_delimiter = ',')]
    pub labels: Vec<String>,

    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 100)]
    pub max_batch_size: usize,

    #[arg(long, env = "MAX_TEXT_CHARS", default_value_t = 10_000)]
    pub max_text_chars: usize,

    /// Request body cap in bytes; derived from the batch and text limits when unset
    #[arg(long, env = "MAX_BODY_BYTES")]
    pub max_body_bytes: Option<usize>,

    /// Origin allowed to call the API from a browser, may be repeated
    #[arg(long = "cors-origin", env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    pub fn model_options(&self) -> ModelOptions {
        ModelOptions {
            device: self.device.clone(),
            max_length: self.max_length,
            num_labels: self.num_labels,
            labels: self.labels.clone(),
        }
    }

    pub fn limits(&self) -> RequestLimits {
        let limits = RequestLimits::new(self.max_batch_size, self.max_text_chars);
        match self.max_body_bytes {
            Some(max_body_bytes) => RequestLimits {
                max_body_bytes,
                ..limits
            },
            None => limits,
        }
    }
}

// A JSON-escaped char takes at most 12 bytes (a `\uXXXX` surrogate pair).
const MAX_ENCODED_CHAR_BYTES: usize = 12;
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Per-request bounds enforced by the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_batch_size: usize,
    pub max_text_chars: usize,
    pub max_body_bytes: usize,
}

impl RequestLimits {
    /// The body cap admits any batch the item limits accept.
    pub fn new(max_batch_size: usize, max_text_chars: usize) -> Self {
        let max_body_bytes = max_batch_size
            .max(1)
            .saturating_mul(max_text_chars)
            .saturating_mul(MAX_ENCODED_CHAR_BYTES)
            .saturating_add(BODY_OVERHEAD_BYTES);
        Self {
            max_batch_size,
            max_text_chars,
            max_body_bytes,
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self::new(100, 10_000)
    }
}
