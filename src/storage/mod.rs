//! Módulo de almacenamiento para Centinela.
//!
//! Expone el listado, archivado, borrado manual y descarga de segmentos
//! sobre el directorio de salida, delegando retención y naming a `depends/`.
//! El nombre de archivo es la única identidad persistida de un segmento.

pub mod depends;

pub use depends::naming::{parse_segment_name, segment_file_name, segment_path};
pub use depends::retention::{ReconcileSummary, RetentionManager};

use crate::error::{CentinelaError, Result};
use crate::{AppState, CameraId};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

// Estructura para la respuesta estándar de la API
#[derive(Serialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

/// Registro de archivos en escritura activa. Es el punto de coordinación
/// entre el planificador y la retención/archivado: el rename de un archivo
/// abierto no es portable, así que se decide por estado de sesión.
#[derive(Clone)]
pub struct RecordingState {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RecordingState {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_recording(&self, path: &str) -> bool {
        self.active.lock().unwrap().contains(path)
    }

    pub fn start_recording(&self, path: &str) {
        self.active.lock().unwrap().insert(path.to_string());
    }

    pub fn stop_recording(&self, path: &str) {
        self.active.lock().unwrap().remove(path);
    }
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Un segmento del directorio de salida, con su identidad parseada.
#[derive(Serialize, Clone, Debug)]
pub struct SegmentEntry {
    pub name: String,
    pub camera_id: CameraId,
    pub start: NaiveDateTime,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub recording: bool,
}

/// Lista los segmentos parseables del directorio, ordenados por
/// (inicio, cámara). Los nombres ajenos simplemente no aparecen.
pub fn list_segments(
    output_dir: &std::path::Path,
    recording_state: &RecordingState,
) -> Result<Vec<SegmentEntry>> {
    let mut segments = Vec::new();

    let entries = match fs::read_dir(output_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(CentinelaError::Io(e)),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let (camera_id, start) = match parse_segment_name(&name) {
            Some(parsed) => parsed,
            None => continue,
        };
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let modified = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

        segments.push(SegmentEntry {
            recording: recording_state.is_recording(&path.to_string_lossy()),
            name,
            camera_id,
            start,
            size_bytes: metadata.len(),
            last_modified: DateTime::<Utc>::from(modified),
        });
    }

    segments.sort_by(|a, b| (a.start, a.camera_id).cmp(&(b.start, b.camera_id)));
    Ok(segments)
}

/// GET /api/recordings
pub async fn list_recordings(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<Vec<SegmentEntry>>, CentinelaError> {
    let segments = list_segments(&state.config.output_dir, &state.recording_state)?;
    Ok(Json(segments))
}

/// POST /api/recordings/:name/archive
pub async fn archive_recording(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    if !state.retention.output_dir().join(&name).is_file() {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no existe: {}", name))),
        )
            .into_response();
    }

    match state.retention.archive(&name) {
        Ok(dest) => (
            StatusCode::OK,
            Json(ApiResponse::ok(format!("archivado en {}", dest.display()))),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/recordings/:name — borrado manual, sin mirar la edad.
pub async fn delete_recording(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    if !state.retention.output_dir().join(&name).is_file() {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no existe: {}", name))),
        )
            .into_response();
    }

    match state.retention.delete(&name) {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::ok("archivo eliminado")),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/recordings/:name/download
pub async fn download_recording(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> std::result::Result<Response, StatusCode> {
    // Sin separadores ni traversal: el nombre tiene que ser un segmento plano
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let full_path = state.config.output_dir.join(&name);

    let file = match File::open(&full_path).await {
        Ok(file) => file,
        Err(_) => return Err(StatusCode::NOT_FOUND),
    };

    let stream = ReaderStream::new(file);
    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, "video/mp4".parse().unwrap());
    headers.insert(header::CONTENT_DISPOSITION, "inline".parse().unwrap());
    Ok(resp)
}

#[derive(Serialize)]
pub struct StorageInfo {
    pub storage_path: String,
    pub total_space_bytes: u64,
    pub used_space_bytes: u64,
    pub free_space_bytes: u64,
    pub segment_count: usize,
    pub segment_bytes: u64,
}

pub fn gather_storage_info(state: &AppState) -> Result<StorageInfo> {
    let stats = fs2::statvfs(&state.config.output_dir)?;
    let total = stats.total_space();
    let free = stats.free_space();

    let segments = list_segments(&state.config.output_dir, &state.recording_state)?;
    let segment_bytes = segments.iter().map(|s| s.size_bytes).sum();

    Ok(StorageInfo {
        storage_path: state.config.output_dir.display().to_string(),
        total_space_bytes: total,
        used_space_bytes: total.saturating_sub(free),
        free_space_bytes: free,
        segment_count: segments.len(),
        segment_bytes,
    })
}

/// GET /api/storage
pub async fn get_storage_info(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<StorageInfo>, CentinelaError> {
    Ok(Json(gather_storage_info(&state)?))
}
