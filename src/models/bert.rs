// BERT sequence classifier: backbone + pooler + linear head
use crate::error::{InferenceError, LoadError};
use crate::models::{resolve_labels, ModelMetadata, ModelOptions, Prediction, SequenceClassifier};
use candle::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::bert::BertProcessing;
use tokenizers::{Tokenizer, TruncationParams};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const VOCAB_FILE: &str = "vocab.txt";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const PYTORCH_FILE: &str = "pytorch_model.bin";
const TF_FILE: &str = "tf_model.h5";

// Fine-tuned checkpoints nest the encoder under `bert.`, bare exports do not.
const BACKBONE_PREFIXES: [&str; 2] = ["bert", ""];

/// The subset of a Hugging Face `config.json` the classification head needs.
#[derive(Debug, Deserialize)]
struct HeadConfig {
    hidden_size: usize,
    max_position_embeddings: usize,
    #[serde(default)]
    id2label: Option<HashMap<String, String>>,
}

/// Only consulted when the tokenizer is rebuilt from `vocab.txt`.
#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    do_lower_case: Option<bool>,
}

enum WeightsFile {
    Safetensors(PathBuf),
    Pytorch(PathBuf),
}

pub struct BertClassifier {
    model: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
    metadata: ModelMetadata,
}

impl BertClassifier {
    pub fn load(model_dir: impl AsRef<Path>, options: &ModelOptions) -> Result<Self, LoadError> {
        let model_dir = model_dir.as_ref();
        info!("Loading model from: {}", model_dir.display());

        if !model_dir.is_dir() {
            return Err(LoadError::MissingDirectory(model_dir.to_path_buf()));
        }
        log_directory(model_dir);

        let config_path = require_file(model_dir, CONFIG_FILE)?;
        let raw_config = std::fs::read_to_string(&config_path).map_err(|source| LoadError::Io {
            path: config_path.clone(),
            source,
        })?;
        let parse = |source| LoadError::Config {
            path: config_path.clone(),
            source,
        };
        let bert_config: Config = serde_json::from_str(&raw_config).map_err(parse)?;
        let head_config: HeadConfig = serde_json::from_str(&raw_config).map_err(parse)?;

        let labels = resolve_labels(
            options.num_labels,
            &options.labels,
            head_config.id2label.as_ref(),
        )?;

        let max_length = options.max_length.min(head_config.max_position_embeddings);
        if max_length < options.max_length {
            warn!(
                "max_length {} exceeds the model's {} positions, truncating to {}",
                options.max_length, head_config.max_position_embeddings, max_length
            );
        }
        let tokenizer = load_tokenizer(model_dir, max_length)?;
        info!("Tokenizer loaded successfully");

        let device = parse_device(&options.device)?;
        info!("Using device: {}", device_name(&device));

        let weights = locate_weights(model_dir)?;
        let parameters = count_parameters(&weights)?;
        let vb = match &weights {
            WeightsFile::Safetensors(path) => unsafe {
                VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)?
            },
            WeightsFile::Pytorch(path) => VarBuilder::from_pth(path, DType::F32, &device)?,
        };

        let (model, prefix) = load_backbone(&vb, &bert_config)?;
        let pooler = candle_nn::linear(
            head_config.hidden_size,
            head_config.hidden_size,
            scoped(&vb, prefix).pp("pooler").pp("dense"),
        )?;
        let classifier = candle_nn::linear(
            head_config.hidden_size,
            labels.len(),
            vb.pp("classifier"),
        )?;
        info!(
            "Model loaded successfully ({} labels, {} parameters)",
            labels.len(),
            parameters
        );

        let metadata = ModelMetadata {
            labels,
            max_length,
            device: device_name(&device),
            parameters,
            vocab_size: tokenizer.get_vocab_size(true),
        };

        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            device,
            metadata,
        })
    }

    fn logits(&self, text: &str) -> Result<Tensor, InferenceError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| InferenceError::Tokenization(e.to_string()))?;
        if encoding.get_ids().is_empty() {
            return Err(InferenceError::EmptyInput);
        }

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;

        // one unpadded sequence, every position is attended
        let hidden_states = self.model.forward(&input_ids, &token_type_ids, None)?;
        let cls = hidden_states.i((.., 0))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        Ok(self.classifier.forward(&pooled)?)
    }
}

impl SequenceClassifier for BertClassifier {
    fn classify(&self, text: &str) -> Result<Prediction, InferenceError> {
        if text.trim().is_empty() {
            return Err(InferenceError::EmptyInput);
        }
        let logits = self.logits(text)?;
        let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()?;
        Prediction::from_probabilities(probabilities)
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

/// Maps a device name to a candle device. `auto` prefers CUDA when compiled in.
pub fn parse_device(name: &str) -> Result<Device, LoadError> {
    let name = name.trim().to_lowercase();
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal
                .parse::<usize>()
                .map_err(|_| LoadError::Device(name.clone()))?;
            (kind, ordinal)
        }
        None => (name.as_str(), 0),
    };

    let device = match kind {
        "auto" => Device::cuda_if_available(ordinal),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(ordinal),
        "metal" | "mps" => Device::new_metal(ordinal),
        _ => return Err(LoadError::Device(name.clone())),
    };
    device.map_err(|e| LoadError::Device(format!("{name}: {e}")))
}

pub fn device_name(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
    .to_string()
}

fn log_directory(dir: &Path) {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            debug!("Files in model directory:");
            for entry in entries.flatten() {
                debug!("  {}", entry.file_name().to_string_lossy());
            }
        }
        Err(e) => debug!("Could not list {}: {}", dir.display(), e),
    }
}

fn require_file(dir: &Path, file: &str) -> Result<PathBuf, LoadError> {
    let path = dir.join(file);
    if path.is_file() {
        Ok(path)
    } else {
        Err(LoadError::MissingFile {
            file: file.to_string(),
            dir: dir.to_path_buf(),
        })
    }
}

fn locate_weights(dir: &Path) -> Result<WeightsFile, LoadError> {
    let safetensors = dir.join(SAFETENSORS_FILE);
    if safetensors.is_file() {
        return Ok(WeightsFile::Safetensors(safetensors));
    }
    let pytorch = dir.join(PYTORCH_FILE);
    if pytorch.is_file() {
        return Ok(WeightsFile::Pytorch(pytorch));
    }

    let file = if dir.join(TF_FILE).is_file() {
        format!("{SAFETENSORS_FILE} ({TF_FILE} found; TensorFlow weights must be converted)")
    } else {
        format!("{SAFETENSORS_FILE} or {PYTORCH_FILE}")
    };
    Err(LoadError::MissingFile {
        file,
        dir: dir.to_path_buf(),
    })
}

fn count_parameters(weights: &WeightsFile) -> Result<usize, LoadError> {
    let count: usize = match weights {
        WeightsFile::Safetensors(path) => {
            let tensors = unsafe { candle::safetensors::MmapedSafetensors::new(path)? };
            tensors
                .tensors()
                .iter()
                .map(|(_, view)| view.shape().iter().product::<usize>())
                .sum()
        }
        WeightsFile::Pytorch(path) => candle::pickle::read_pth_tensor_info(path, false, None)?
            .iter()
            .map(|info| info.layout.shape().elem_count())
            .sum(),
    };
    Ok(count)
}

fn load_tokenizer(dir: &Path, max_length: usize) -> Result<Tokenizer, LoadError> {
    let tokenizer_path = dir.join(TOKENIZER_FILE);
    let vocab_path = dir.join(VOCAB_FILE);

    let mut tokenizer = if tokenizer_path.is_file() {
        debug!("Loading tokenizer from {}", TOKENIZER_FILE);
        Tokenizer::from_file(&tokenizer_path).map_err(|e| LoadError::Tokenizer(e.to_string()))?
    } else if vocab_path.is_file() {
        debug!("Building WordPiece tokenizer from {}", VOCAB_FILE);
        wordpiece_tokenizer(&vocab_path, lowercases(dir))?
    } else {
        return Err(LoadError::MissingFile {
            file: format!("{TOKENIZER_FILE} or {VOCAB_FILE}"),
            dir: dir.to_path_buf(),
        });
    };

    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| LoadError::Tokenizer(e.to_string()))?;
    tokenizer.with_padding(None);
    Ok(tokenizer)
}

/// Casing for the vocab.txt fallback. Cased unless tokenizer_config.json says otherwise.
fn lowercases(dir: &Path) -> bool {
    let config = std::fs::read_to_string(dir.join(TOKENIZER_CONFIG_FILE))
        .ok()
        .and_then(|raw| serde_json::from_str::<TokenizerConfig>(&raw).ok())
        .unwrap_or_default();
    match config.do_lower_case {
        Some(lowercase) => lowercase,
        None => {
            warn!(
                "{} does not set do_lower_case, tokenizing {} as cased",
                TOKENIZER_CONFIG_FILE, VOCAB_FILE
            );
            false
        }
    }
}

fn wordpiece_tokenizer(vocab_path: &Path, lowercase: bool) -> Result<Tokenizer, LoadError> {
    let wordpiece = WordPiece::from_file(&vocab_path.to_string_lossy())
        .unk_token("[UNK]".to_string())
        .build()
        .map_err(|e| LoadError::Tokenizer(e.to_string()))?;

    let mut tokenizer = Tokenizer::new(wordpiece);
    let special = |token: &str| {
        tokenizer
            .token_to_id(token)
            .map(|id| (token.to_string(), id))
            .ok_or_else(|| LoadError::Tokenizer(format!("{token} missing from vocabulary")))
    };
    let cls = special("[CLS]")?;
    let sep = special("[SEP]")?;

    tokenizer.with_normalizer(Some(BertNormalizer::new(true, true, None, lowercase)));
    tokenizer.with_pre_tokenizer(Some(BertPreTokenizer));
    tokenizer.with_post_processor(Some(BertProcessing::new(sep, cls)));
    Ok(tokenizer)
}

fn load_backbone(
    vb: &VarBuilder,
    config: &Config,
) -> Result<(BertModel, &'static str), LoadError> {
    let mut errors = Vec::new();
    for prefix in BACKBONE_PREFIXES {
        match BertModel::load(scoped(vb, prefix), config) {
            Ok(model) => {
                debug!("Loaded BERT backbone from '{}'", display_prefix(prefix));
                return Ok((model, prefix));
            }
            Err(e) => errors.push(format!("{}: {}", display_prefix(prefix), e)),
        }
    }
    Err(LoadError::Weights(candle::Error::Msg(format!(
        "no BERT backbone found (tried {})",
        errors.join(" | ")
    ))))
}

fn scoped<'a>(vb: &VarBuilder<'a>, prefix: &str) -> VarBuilder<'a> {
    if prefix.is_empty() {
        vb.clone()
    } else {
        vb.pp(prefix)
    }
}

fn display_prefix(prefix: &str) -> &str {
    if prefix.is_empty() {
        "<root>"
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_names() {
        assert!(matches!(parse_device("cpu"), Ok(Device::Cpu)));
        assert!(matches!(parse_device(" CPU "), Ok(Device::Cpu)));
        assert!(matches!(parse_device("tpu"), Err(LoadError::Device(_))));
        assert!(matches!(parse_device("cuda:x"), Err(LoadError::Device(_))));
    }

    #[test]
    fn auto_device_always_resolves() {
        let device = parse_device("auto").unwrap();
        assert!(matches!(device_name(&device).as_str(), "cpu" | "cuda"));
    }

    #[test]
    fn missing_weights_mentions_tensorflow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TF_FILE), b"").unwrap();
        let err = locate_weights(dir.path()).err().unwrap();
        assert!(err.to_string().contains("TensorFlow"));
    }

    #[test]
    fn vocab_fallback_is_cased_unless_configured() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!lowercases(dir.path()));

        let config_path = dir.path().join(TOKENIZER_CONFIG_FILE);
        std::fs::write(&config_path, r#"{"model_max_length": 512}"#).unwrap();
        assert!(!lowercases(dir.path()));

        std::fs::write(&config_path, r#"{"do_lower_case": true}"#).unwrap();
        assert!(lowercases(dir.path()));

        std::fs::write(&config_path, r#"{"do_lower_case": false}"#).unwrap();
        assert!(!lowercases(dir.path()));
    }

    #[test]
    fn cased_vocab_keeps_capitals_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = dir.path().join(VOCAB_FILE);
        std::fs::write(&vocab, "[PAD]\n[UNK]\n[CLS]\n[SEP]\nhello\nHello").unwrap();

        let cased = wordpiece_tokenizer(&vocab, false).unwrap();
        let ids = cased.encode("Hello", false).unwrap().get_ids().to_vec();
        assert_eq!(ids, vec![5]);

        let uncased = wordpiece_tokenizer(&vocab, true).unwrap();
        let ids = uncased.encode("Hello", false).unwrap().get_ids().to_vec();
        assert_eq!(ids, vec![4]);
    }
}
