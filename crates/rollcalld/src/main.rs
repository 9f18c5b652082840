use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_attendance::status::CAMERA_FAILED_STATUS;
use rollcall_attendance::{AttendanceEngine, Clock, Config, RecordStore, RedisStore, Registry, SystemClock};
use rollcall_core::{FaceModel, OnnxFaceModel};
use rollcall_hw::{Annotator, Camera};
use tracing_subscriber::EnvFilter;

mod stream;
mod web;

use stream::VideoFeed;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let store = RedisStore::new(&config.redis_url(), config.store_timeout())
        .with_context(|| format!("invalid redis address {}", config.redis_url()))?;
    if let Err(err) = store.ping() {
        tracing::warn!(url = %config.redis_url(), error = %err, "redis unreachable; will retry on demand");
    }
    let store: Arc<dyn RecordStore> = Arc::new(store);

    let model = OnnxFaceModel::load(&config.model_dir)
        .with_context(|| format!("failed to load face models from {}", config.model_dir.display()))?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");
    let model: Arc<dyn FaceModel> = Arc::new(model);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let engine = Arc::new(AttendanceEngine::new(
        store.clone(),
        model.clone(),
        clock.clone(),
        config.recognition(),
        &config.images_dir,
    ));
    let registry = Arc::new(Registry::new(store, model, clock, &config.images_dir));

    let video = match Camera::open_first(&config.camera_indices) {
        Ok((index, camera)) => {
            engine.set_status(format!("Camera initialized at index {index}"));
            let feed = VideoFeed::spawn(camera, engine.clone(), annotator(&config))
                .context("failed to spawn camera worker")?;
            Some(Arc::new(feed))
        }
        Err(err) => {
            tracing::error!(error = %err, "no camera available; video feed disabled");
            engine.set_status(CAMERA_FAILED_STATUS);
            None
        }
    };

    let app = web::router(AppState {
        engine,
        registry,
        video: video.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(video.clone()))
        .await?;

    tracing::info!("rollcalld shutting down");
    if let Some(video) = video {
        tokio::task::spawn_blocking(move || video.shutdown()).await?;
    }
    Ok(())
}

fn annotator(config: &Config) -> Annotator {
    let Some(path) = &config.font_path else {
        tracing::info!("no label font configured; frames get boxes only");
        return Annotator::default();
    };
    match Annotator::with_font_file(path) {
        Ok(annotator) => annotator,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cannot load label font");
            Annotator::default()
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM, ending open video streams so the server
/// can drain.
async fn shutdown_signal(video: Option<Arc<VideoFeed>>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    if let Some(video) = video {
        video.stop();
    }
}
