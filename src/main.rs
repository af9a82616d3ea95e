use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use centinela::capture::{Mp4WriterProvider, RtspSourceProvider, SourceProvider, StreamProfile};
use centinela::config::Config;
use centinela::preview::PreviewController;
use centinela::session::RecordingScheduler;
use centinela::storage::{RecordingState, RetentionManager};
use centinela::{auth, preview, session, storage, AppState, CameraId};
use dotenvy::dotenv;
use gstreamer as gst;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.output_dir)?;
    std::fs::create_dir_all(&config.archive_dir)?;

    gst::init()?;

    let recording_state = RecordingState::new();
    let retention = Arc::new(RetentionManager::new(
        config.output_dir.clone(),
        config.archive_dir.clone(),
        config.max_age,
        recording_state.clone(),
    ));

    // Dos proveedores por cámara: H.264 passthrough para grabar y JPEG para
    // la vista en vivo. Cada open crea su propia conexión RTSP.
    let mut record_sources: HashMap<CameraId, Arc<dyn SourceProvider>> = HashMap::new();
    let mut preview_sources: HashMap<CameraId, Arc<dyn SourceProvider>> = HashMap::new();
    for cam in &config.cameras {
        record_sources.insert(
            cam.id,
            Arc::new(RtspSourceProvider::new(
                cam.id,
                cam.rtsp_url.clone(),
                StreamProfile::Record,
            )),
        );
        preview_sources.insert(
            cam.id,
            Arc::new(RtspSourceProvider::new(
                cam.id,
                cam.rtsp_url.clone(),
                StreamProfile::Preview,
            )),
        );
    }

    let scheduler = RecordingScheduler::spawn(
        &config,
        record_sources,
        Arc::new(Mp4WriterProvider),
        Arc::clone(&retention),
        recording_state.clone(),
    )?;

    if config.auto_start {
        for cam in &config.cameras {
            scheduler.start(cam.id)?;
        }
        log::info!(
            "📹 Grabación automática iniciada en {} cámaras",
            config.cameras.len()
        );
    }

    let preview_controller =
        PreviewController::new(preview_sources, config.open_timeout, config.read_timeout);

    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState {
        config,
        scheduler,
        retention,
        recording_state,
        preview: preview_controller,
    });

    // Ctrl-C: cierre ordenado, cada sesión finaliza su segmento antes de salir
    let shutdown_state = state.clone();
    ctrlc::set_handler(move || {
        log::info!("🛑 Señal de apagado recibida, finalizando segmentos...");
        shutdown_state.scheduler.shutdown();
        std::process::exit(0);
    })?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/status", get(session::get_status))
        .route("/api/cameras/:id/start", post(session::start_camera))
        .route("/api/cameras/:id/stop", post(session::stop_camera))
        .route("/api/cameras/:id/override", post(session::set_override))
        .route("/api/recordings", get(storage::list_recordings))
        .route("/api/recordings/:name/archive", post(storage::archive_recording))
        .route("/api/recordings/:name", delete(storage::delete_recording))
        .route("/api/recordings/:name/download", get(storage::download_recording))
        .route("/api/storage", get(storage::get_storage_info))
        .route("/api/live/:id/mjpeg", get(preview::stream_mjpeg_handler))
        .layer(cors)
        .layer(from_fn_with_state(state.clone(), auth::require_auth_middleware))
        .with_state(state);

    let addr: SocketAddr = listen_addr.parse()?;
    println!("🚀 Centinela escuchando en http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
