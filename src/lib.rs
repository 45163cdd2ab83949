//! HTTP serving for a fine-tuned multilingual BERT sequence classifier.
//!
//! The model and tokenizer are loaded once at startup into an immutable
//! [`state::AppState`]; the handlers in [`api`] validate requests and run
//! inference on actix's blocking pool.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod state;
