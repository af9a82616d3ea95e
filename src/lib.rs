//! Centinela: grabador de seguridad multi-cámara.
//!
//! Captura continua de N cámaras de red a segmentos MP4 acotados en el
//! tiempo, con rotación alineada al reloj, retención por edad, archivado
//! manual y vista en vivo sin interrumpir la grabación.

pub mod auth;
pub mod capture;
pub mod config;
pub mod error;
pub mod preview;
pub mod session;
pub mod storage;

/// Identificador estable de cámara (1..N), inmutable durante el proceso.
pub type CameraId = u32;

/// Estado compartido con la capa HTTP. Todo lo mutable vive detrás de sus
/// propios locks; el planificador es el único dueño de las sesiones.
pub struct AppState {
    pub config: config::Config,
    pub scheduler: session::RecordingScheduler,
    pub retention: std::sync::Arc<storage::RetentionManager>,
    pub recording_state: storage::RecordingState,
    pub preview: preview::PreviewController,
}
