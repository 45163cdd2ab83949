// API routes and handlers
use crate::error::ServiceError;
use crate::models::{Prediction, SequenceClassifier};
use crate::state::AppState;
use actix_web::{web, HttpResponse, Resource};
use log::{error, info};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::Arc;

const PREVIEW_CHARS: usize = 50;

/// Registers every route. Unknown paths are handled by [`not_found`], which
/// the caller installs as the app's default service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(resource("/").route(web::get().to(index)))
        .service(resource("/health").route(web::get().to(health)))
        .service(resource("/model_info").route(web::get().to(model_info)))
        .service(resource("/classify").route(web::post().to(classify)))
        .service(resource("/predict").route(web::post().to(classify)))
        .service(resource("/classify/batch").route(web::post().to(classify_batch)))
        .service(resource("/predict_batch").route(web::post().to(classify_batch)));
}

fn resource(path: &str) -> Resource {
    web::resource(path).default_service(web::to(method_not_allowed))
}

pub async fn not_found() -> Result<HttpResponse, ServiceError> {
    Err(ServiceError::NotFound)
}

async fn method_not_allowed() -> Result<HttpResponse, ServiceError> {
    Err(ServiceError::MethodNotAllowed)
}

/// Class index -> probability, serialized as a JSON object keyed by the
/// decimal index in class order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScores(pub Vec<f32>);

impl Serialize for ClassScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (idx, prob) in self.0.iter().enumerate() {
            map.serialize_entry(&idx.to_string(), prob)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct Classification {
    predicted_class: usize,
    label: String,
    confidence_scores: ClassScores,
    max_confidence: f32,
}

impl Classification {
    fn new(prediction: Prediction, labels: &[String]) -> Self {
        let class_index = prediction.class_index();
        let label = labels
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| class_index.to_string());
        Self {
            predicted_class: class_index,
            label,
            max_confidence: prediction.confidence(),
            confidence_scores: ClassScores(prediction.into_probabilities()),
        }
    }
}

#[derive(Serialize)]
struct ClassifyResponse {
    text: String,
    #[serde(flatten)]
    classification: Classification,
    status: &'static str,
}

#[derive(Serialize)]
#[serde(untagged)]
enum BatchItem {
    Classified {
        index: usize,
        text: String,
        #[serde(flatten)]
        classification: Classification,
    },
    Failed {
        index: usize,
        error: &'static str,
    },
}

#[derive(Serialize)]
struct BatchResponse {
    results: Vec<BatchItem>,
    total_processed: usize,
    status: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    device: String,
}

#[derive(Serialize)]
struct ModelInfoResponse {
    model_loaded: bool,
    model_path: String,
    max_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    class_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_parameters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vocab_size: Option<usize>,
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "message": "mBERT Classification API is running"
    }))
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let device = state
        .classifier
        .as_ref()
        .map(|classifier| classifier.metadata().device.clone())
        .unwrap_or_else(|| "unknown".to_string());

    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        model_loaded: state.model_loaded(),
        device,
    })
}

async fn model_info(state: web::Data<AppState>) -> HttpResponse {
    let metadata = state.classifier.as_ref().map(|c| c.metadata().clone());
    HttpResponse::Ok().json(ModelInfoResponse {
        model_loaded: metadata.is_some(),
        model_path: state.model_path.display().to_string(),
        max_length: metadata
            .as_ref()
            .map_or(state.max_length, |m| m.max_length),
        device: metadata.as_ref().map(|m| m.device.clone()),
        model_parameters: metadata.as_ref().map(|m| m.parameters),
        vocab_size: metadata.as_ref().map(|m| m.vocab_size),
        class_names: metadata.map(|m| m.labels),
    })
}

async fn classify(
    state: web::Data<AppState>,
    body: web::Payload,
) -> Result<HttpResponse, ServiceError> {
    let classifier = loaded_classifier(&state)?;
    let body = read_body(body, state.limits.max_body_bytes).await?;
    let payload = parse_object(&body)?;
    let text = validate_text(payload.get("text"), state.limits.max_text_chars)?.to_string();

    info!(
        "Received prediction request for text: {}...",
        preview(&text)
    );

    let input = text.clone();
    let worker = Arc::clone(&classifier);
    let outcome = web::block(move || worker.classify(&input))
        .await
        .map_err(|e| {
            error!("Inference task aborted: {}", e);
            ServiceError::Inference
        })?;
    let prediction = outcome.map_err(|e| {
        error!("Prediction failed: {}", e);
        ServiceError::Inference
    })?;

    let classification = Classification::new(prediction, &classifier.metadata().labels);
    info!(
        "Prediction successful: {} ({:.4})",
        classification.predicted_class, classification.max_confidence
    );

    Ok(HttpResponse::Ok().json(ClassifyResponse {
        text,
        classification,
        status: "success",
    }))
}

async fn classify_batch(
    state: web::Data<AppState>,
    body: web::Payload,
) -> Result<HttpResponse, ServiceError> {
    let classifier = loaded_classifier(&state)?;
    let body = read_body(body, state.limits.max_body_bytes).await?;
    let mut payload = parse_object(&body)?;
    let texts = validate_texts(payload.remove("texts"), state.limits.max_batch_size)?;
    let total = texts.len();
    let max_chars = state.limits.max_text_chars;

    info!("Received batch prediction request for {} texts", total);

    let results = web::block(move || {
        let labels = &classifier.metadata().labels;
        texts
            .into_iter()
            .enumerate()
            .map(|(index, item)| classify_item(classifier.as_ref(), labels, index, item, max_chars))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| {
        error!("Batch inference task aborted: {}", e);
        ServiceError::Inference
    })?;

    let failed = results
        .iter()
        .filter(|item| matches!(item, BatchItem::Failed { .. }))
        .count();
    info!(
        "Batch prediction finished: {} texts, {} item errors",
        total, failed
    );

    Ok(HttpResponse::Ok().json(BatchResponse {
        results,
        total_processed: total,
        status: "success",
    }))
}

fn classify_item(
    classifier: &dyn SequenceClassifier,
    labels: &[String],
    index: usize,
    item: Value,
    max_chars: usize,
) -> BatchItem {
    let text = match item {
        Value::String(text) if !text.trim().is_empty() => text,
        _ => {
            return BatchItem::Failed {
                index,
                error: "Invalid or empty text",
            }
        }
    };
    if text.chars().count() > max_chars {
        return BatchItem::Failed {
            index,
            error: "Text too long",
        };
    }

    match classifier.classify(&text) {
        Ok(prediction) => BatchItem::Classified {
            index,
            text,
            classification: Classification::new(prediction, labels),
        },
        Err(e) => {
            error!("Prediction failed for batch item {}: {}", index, e);
            BatchItem::Failed {
                index,
                error: "Prediction failed",
            }
        }
    }
}

fn loaded_classifier(state: &AppState) -> Result<Arc<dyn SequenceClassifier>, ServiceError> {
    state.classifier.clone().ok_or(ServiceError::ModelNotLoaded)
}

async fn read_body(body: web::Payload, limit: usize) -> Result<web::Bytes, ServiceError> {
    match body.to_bytes_limited(limit).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(_)) => Err(ServiceError::PayloadTooLarge),
        Err(e) => {
            error!("Failed to read request body: {}", e);
            Err(ServiceError::bad_request("Could not read request body"))
        }
    }
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, ServiceError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) if !map.is_empty() => Ok(map),
        _ => Err(ServiceError::bad_request("No JSON data provided")),
    }
}

fn validate_text(value: Option<&Value>, max_chars: usize) -> Result<&str, ServiceError> {
    let text = match value {
        Some(Value::String(text)) if !text.is_empty() => text,
        _ => return Err(ServiceError::bad_request("Invalid or missing text field")),
    };
    if text.trim().is_empty() {
        return Err(ServiceError::bad_request("Empty text provided"));
    }
    if text.chars().count() > max_chars {
        return Err(ServiceError::bad_request(format!(
            "Text too long (max {max_chars} characters)"
        )));
    }
    Ok(text)
}

fn validate_texts(value: Option<Value>, max_batch_size: usize) -> Result<Vec<Value>, ServiceError> {
    let texts = match value {
        Some(Value::Array(texts)) => texts,
        _ => {
            return Err(ServiceError::bad_request(
                "Invalid or missing texts field (should be a list)",
            ))
        }
    };
    if texts.is_empty() {
        return Err(ServiceError::bad_request("Empty texts list provided"));
    }
    if texts.len() > max_batch_size {
        return Err(ServiceError::bad_request(format!(
            "Batch size too large (max {max_batch_size})"
        )));
    }
    Ok(texts)
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(err: ServiceError) -> String {
        err.to_string()
    }

    #[test]
    fn scores_serialize_in_index_order() {
        let scores = ClassScores((0..12).map(|i| i as f32 / 66.0).collect());
        let encoded = serde_json::to_string(&scores).unwrap();
        let first_keys: Vec<&str> = encoded
            .trim_matches(|c| c == '{' || c == '}')
            .split(',')
            .map(|entry| entry.split(':').next().unwrap())
            .collect();
        assert_eq!(first_keys[2], "\"2\"");
        assert_eq!(first_keys[10], "\"10\"");
    }

    #[test]
    fn body_must_be_non_empty_object() {
        let bodies: [&[u8]; 6] = [b"", b"not json", b"[]", b"{}", b"null", b"\"text\""];
        for body in bodies {
            let err = parse_object(body).unwrap_err();
            assert_eq!(message(err), "No JSON data provided");
        }
        assert!(parse_object(br#"{"text": "hi"}"#).is_ok());
    }

    #[test]
    fn text_field_rules() {
        assert_eq!(
            message(validate_text(None, 10).unwrap_err()),
            "Invalid or missing text field"
        );
        assert_eq!(
            message(validate_text(Some(&json!(42)), 10).unwrap_err()),
            "Invalid or missing text field"
        );
        assert_eq!(
            message(validate_text(Some(&json!("")), 10).unwrap_err()),
            "Invalid or missing text field"
        );
        assert_eq!(
            message(validate_text(Some(&json!("  \n\t")), 10).unwrap_err()),
            "Empty text provided"
        );
        assert_eq!(
            message(validate_text(Some(&json!("ééééééééééé")), 10).unwrap_err()),
            "Text too long (max 10 characters)"
        );
        assert_eq!(validate_text(Some(&json!("ééé")), 10).unwrap(), "ééé");
    }

    #[test]
    fn texts_field_rules() {
        assert_eq!(
            message(validate_texts(None, 100).unwrap_err()),
            "Invalid or missing texts field (should be a list)"
        );
        assert_eq!(
            message(validate_texts(Some(json!("hello")), 100).unwrap_err()),
            "Invalid or missing texts field (should be a list)"
        );
        assert_eq!(
            message(validate_texts(Some(json!([])), 100).unwrap_err()),
            "Empty texts list provided"
        );
        assert_eq!(
            message(validate_texts(Some(json!(["a", "b", "c"])), 2).unwrap_err()),
            "Batch size too large (max 2)"
        );
        assert_eq!(validate_texts(Some(json!(["a", "b"])), 2).unwrap().len(), 2);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let text = "ж".repeat(80);
        assert_eq!(preview(&text).chars().count(), PREVIEW_CHARS);
        assert_eq!(preview("short"), "short");
    }
}
