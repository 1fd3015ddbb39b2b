use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vigil_core::{Annotator, Pipeline, UploadDir};

mod config;
mod engine;
mod routes;

use config::Config;
use engine::Models;
use routes::{AppState, ModelInfo};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");
    let config = Config::from_env();

    let uploads = UploadDir::new(&config.upload_dir);
    uploads.ensure()?;

    let annotator = match &config.font_path {
        Some(path) => Annotator::with_font_file(path)?,
        None => Annotator::new(None),
    };

    // One model set per worker; load them all before serving.
    let mut models = (0..config.workers)
        .map(|_| Models::load(&config))
        .collect::<Result<Vec<_>, _>>()
        .context("loading models")?;
    tracing::info!(workers = models.len(), "models loaded");

    let gallery = {
        let first = &mut models[0];
        Pipeline::load_gallery(
            &config.gallery_dir,
            first.faces.as_mut(),
            first.embedder.as_mut(),
            config.missing_face,
        )
        .with_context(|| format!("loading gallery from {}", config.gallery_dir.display()))?
    };
    if gallery.is_empty() {
        tracing::warn!(
            dir = %config.gallery_dir.display(),
            "gallery is empty; every face will be reported as no match"
        );
    }
    let gallery_size = gallery.len();

    let pipeline = Pipeline::new(Arc::new(gallery), config.match_settings(), annotator)?;
    let engine = engine::spawn_engine(
        Arc::new(pipeline),
        models,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let state = Arc::new(AppState {
        engine,
        uploads,
        gallery_size,
        settings: config.match_settings(),
        models: ModelInfo {
            face_detector: config.scrfd_model_path(),
            face_recognizer: config.arcface_model_path(),
            object_detector: config.object_model_path(),
        },
    });
    let app = routes::create_app(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "vigild ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("vigild shutting down");
        })
        .await?;

    Ok(())
}
