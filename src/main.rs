// Web server entry point
use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use classification_server::api;
use classification_server::config::ServerConfig;
use classification_server::models::bert::BertClassifier;
use classification_server::state::AppState;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = ServerConfig::parse();

    info!("Starting classification server...");
    let classifier = BertClassifier::load(&config.model_path, &config.model_options())
        .map_err(|e| {
            error!(
                "Make sure {} contains config.json, model.safetensors (or pytorch_model.bin) \
                 and tokenizer.json (or vocab.txt)",
                config.model_path.display()
            );
            e
        })
        .context("failed to load model, server will not start")?;

    let state = web::Data::new(AppState::new(
        Arc::new(classifier),
        config.model_path.clone(),
        config.limits(),
    ));
    let origins = config.cors_origins.clone();

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors(&origins))
            .wrap(middleware::Logger::default())
            .configure(api::configure)
            .default_service(web::to(api::not_found))
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }

    info!(
        "Model ready, listening on http://{}:{}",
        config.host, config.port
    );
    server
        .bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
        .run()
        .await?;

    info!("Shutting down...");
    Ok(())
}

// Without configured origins browsers are refused; non-browser clients are unaffected.
fn cors(origins: &[String]) -> Cors {
    origins.iter().fold(
        Cors::default()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_header(header::CONTENT_TYPE)
            .max_age(3600),
        |cors, origin| cors.allowed_origin(origin),
    )
}
