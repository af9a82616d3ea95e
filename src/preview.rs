//! Vista en vivo para Centinela.
//!
//! MJPEG multipart independiente del planificador: cada petición abre su
//! propio handle de captura (la grabación nunca espera al preview ni al
//! revés) y lo cierra cuando el cliente se desconecta.

use crate::auth::check_auth;
use crate::capture::SourceProvider;
use crate::error::{CentinelaError, Result};
use crate::{AppState, CameraId};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;

pub struct PreviewController {
    sources: HashMap<CameraId, Arc<dyn SourceProvider>>,
    open_timeout: Duration,
    read_timeout: Duration,
}

impl PreviewController {
    pub fn new(
        sources: HashMap<CameraId, Arc<dyn SourceProvider>>,
        open_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            sources,
            open_timeout,
            read_timeout,
        }
    }

    /// Abre un stream de frames para una cámara. El bucle de lectura corre en
    /// un hilo bloqueante y muere solo cuando el receptor se suelta.
    pub fn open_stream(&self, id: CameraId) -> Result<mpsc::Receiver<Bytes>> {
        let provider = self
            .sources
            .get(&id)
            .cloned()
            .ok_or_else(|| CentinelaError::Config(format!("cámara desconocida: {}", id)))?;

        if !provider.concurrent_open_safe() {
            // la grabación tiene prioridad; no se roba el handle de la sesión
            return Err(CentinelaError::SourceUnavailable(format!(
                "la cámara {} no admite apertura concurrente para preview",
                id
            )));
        }

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let open_timeout = self.open_timeout;
        let read_timeout = self.read_timeout;

        task::spawn_blocking(move || {
            let mut source = match provider.open(open_timeout) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("⚠️ Preview cámara {}: {}", id, e);
                    return;
                }
            };
            loop {
                match source.read_frame(read_timeout) {
                    Ok(frame) => {
                        if tx.blocking_send(frame.data).is_err() {
                            log::debug!("Preview cámara {}: cliente desconectado", id);
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("⚠️ Preview cámara {}: {}", id, e);
                        break;
                    }
                }
            }
            source.close();
        });

        Ok(rx)
    }
}

// Auth helper via query param (?token=) para facilitar VLC y reproductores
#[derive(Deserialize, Default)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// GET /api/live/:id/mjpeg
pub async fn stream_mjpeg_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CameraId>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> std::result::Result<Response, StatusCode> {
    // Auth: acepta header Authorization o query ?token=
    if q.token.as_deref() != Some(&state.config.proxy_token) {
        if check_auth(&headers, &state.config.proxy_token).await.is_err() {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let mut rx = state.preview.open_stream(id).map_err(|e| match e {
        CentinelaError::Config(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    })?;

    // Body multipart/x-mixed-replace con un JPEG por parte
    let boundary = "frame";
    let stream = async_stream::stream! {
        while let Some(jpeg) = rx.recv().await {
            let mut chunk = Vec::with_capacity(jpeg.len() + 128);
            chunk.extend_from_slice(
                format!(
                    "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    boundary,
                    jpeg.len()
                )
                .as_bytes(),
            );
            chunk.extend_from_slice(&jpeg);
            chunk.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, std::io::Error>(Bytes::from(chunk));
        }
    };

    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        format!("multipart/x-mixed-replace; boundary={}", boundary)
            .parse()
            .unwrap(),
    );
    headers.insert(axum::http::header::CACHE_CONTROL, "no-cache".parse().unwrap());
    Ok(resp)
}
