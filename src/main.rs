use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
use config::Config;
mod disease;
mod labels;
use labels::ClassLabelSet;
mod model;
use model::{Classifier, ModelError};
mod prediction;
mod preprocess;
mod routes;
mod state;
use state::AppState;
mod utils;
use utils::ensure_artifact;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;
    info!(
        model = %config.model_path.display(),
        class_indices = %config.class_indices_path.display(),
        input_op = %config.input_op,
        output_op = %config.output_op,
        error_policy = ?config.error_policy,
        body_limit_bytes = config.body_limit_bytes,
        "starting silkworm service v{}",
        env!("CARGO_PKG_VERSION")
    );

    info!("Checking model...");
    let client = reqwest::Client::new();
    let token = config.artifact_token.as_deref();
    ensure_artifact(&client, &config.model_path, config.model_url.as_deref(), token)
        .await
        .context("model artifact unavailable")?;
    ensure_artifact(
        &client,
        &config.class_indices_path,
        config.class_indices_url.as_deref(),
        token,
    )
    .await
    .context("class indices unavailable")?;

    let labels = ClassLabelSet::load(&config.class_indices_path).with_context(|| {
        format!(
            "failed to load class indices from {}",
            config.class_indices_path.display()
        )
    })?;
    let classifier = load_classifier(&config).with_context(|| {
        format!("failed to load model from {}", config.model_path.display())
    })?;
    info!(classes = labels.len(), "model loaded");

    let state = Arc::new(AppState::new(
        classifier,
        labels,
        config.error_policy,
        config.body_limit_bytes,
    ));
    let app = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;
    info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

#[cfg(feature = "tensorflow")]
fn load_classifier(config: &Config) -> Result<Box<dyn Classifier>, ModelError> {
    let classifier =
        model::TfClassifier::load(&config.model_path, &config.input_op, &config.output_op)?;
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "tensorflow"))]
fn load_classifier(_config: &Config) -> Result<Box<dyn Classifier>, ModelError> {
    Err(ModelError::NoBackend)
}
