//! Módulo del planificador de grabación para Centinela.
//!
//! `RecordingScheduler` posee una sesión por cámara (hilo + canal de
//! comandos + snapshot de estado) y es el único dueño de escritores de
//! segmento: una cámara, un escritor, nunca dos. Las sesiones son
//! completamente independientes entre sí; un fallo en una no retrasa la
//! rotación de las demás.

pub mod depends;

pub use depends::window::{next_boundary, window_at, SegmentWindow};

use crate::capture::{SourceProvider, WriterProvider};
use crate::config::Config;
use crate::error::{CentinelaError, Result};
use crate::storage::{gather_storage_info, ApiResponse, RecordingState, RetentionManager, StorageInfo};
use crate::{AppState, CameraId};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDateTime;
use depends::runner::{run_session, SessionContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Estado observable de una sesión.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Recording,
}

/// Instantánea de una sesión para la capa de control.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub camera_id: CameraId,
    pub state: SessionState,
    pub manual_override: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_start: Option<NaiveDateTime>,
    pub consecutive_open_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<String>,
}

impl SessionSnapshot {
    fn idle(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            state: SessionState::Idle,
            manual_override: false,
            segment_start: None,
            consecutive_open_failures: 0,
            last_fault: None,
        }
    }
}

/// Comandos entrantes de una sesión. Se consumen sólo en puntos de control
/// del bucle, nunca por preempción.
#[derive(Debug)]
pub enum Command {
    Start,
    Stop,
    SetOverride(bool),
    Shutdown,
}

struct SessionHandle {
    commands: Sender<Command>,
    shared: Arc<Mutex<SessionSnapshot>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct RecordingScheduler {
    sessions: BTreeMap<CameraId, SessionHandle>,
}

impl RecordingScheduler {
    /// Crea una sesión (hilo `camera{N}`) por cámara configurada. Las
    /// sesiones nacen en `Idle` y viven lo que el proceso.
    pub fn spawn(
        config: &Config,
        sources: HashMap<CameraId, Arc<dyn SourceProvider>>,
        writer: Arc<dyn WriterProvider>,
        retention: Arc<RetentionManager>,
        recording_state: RecordingState,
    ) -> Result<Self> {
        let mut sessions = BTreeMap::new();

        for camera in &config.cameras {
            let source = sources.get(&camera.id).cloned().ok_or_else(|| {
                CentinelaError::Config(format!("sin proveedor de fuente para cámara {}", camera.id))
            })?;

            let (tx, rx) = mpsc::channel();
            let shared = Arc::new(Mutex::new(SessionSnapshot::idle(camera.id)));

            let ctx = SessionContext {
                camera_id: camera.id,
                cadence: config.cadence,
                output_dir: config.output_dir.clone(),
                open_timeout: config.open_timeout,
                read_timeout: config.read_timeout,
                backoff: config.backoff.clone(),
                max_open_failures: config.max_open_failures,
                source,
                writer: Arc::clone(&writer),
                retention: Arc::clone(&retention),
                recording_state: recording_state.clone(),
                shared: Arc::clone(&shared),
                commands: rx,
            };

            let thread = std::thread::Builder::new()
                .name(format!("camera{}", camera.id))
                .spawn(move || run_session(ctx))
                .map_err(CentinelaError::Io)?;

            sessions.insert(
                camera.id,
                SessionHandle {
                    commands: tx,
                    shared,
                    thread: Mutex::new(Some(thread)),
                },
            );
        }

        Ok(Self { sessions })
    }

    fn handle(&self, id: CameraId) -> Result<&SessionHandle> {
        self.sessions
            .get(&id)
            .ok_or_else(|| CentinelaError::Config(format!("cámara desconocida: {}", id)))
    }

    fn send(&self, id: CameraId, cmd: Command) -> Result<()> {
        self.handle(id)?.commands.send(cmd).map_err(|_| {
            CentinelaError::Other(format!("la sesión de la cámara {} ya no existe", id))
        })
    }

    /// Idempotente: si la sesión ya está grabando, no hace nada.
    pub fn start(&self, id: CameraId) -> Result<()> {
        if self.handle(id)?.shared.lock().unwrap().state == SessionState::Recording {
            log::debug!("Cámara {}: start ignorado, ya grabando", id);
            return Ok(());
        }
        self.send(id, Command::Start)
    }

    /// Pide el cierre ordenado del segmento en curso y deja la sesión en Idle.
    pub fn stop(&self, id: CameraId) -> Result<()> {
        self.send(id, Command::Stop)
    }

    /// Con override activo, el planificador ignora la frontera automática y
    /// mantiene el segmento abierto hasta que se desactive o llegue un stop.
    pub fn set_manual_override(&self, id: CameraId, active: bool) -> Result<()> {
        self.send(id, Command::SetOverride(active))
    }

    pub fn snapshot(&self, id: CameraId) -> Option<SessionSnapshot> {
        self.sessions
            .get(&id)
            .map(|h| h.shared.lock().unwrap().clone())
    }

    /// Instantáneas de todas las sesiones, ordenadas por cámara.
    pub fn status(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .values()
            .map(|h| h.shared.lock().unwrap().clone())
            .collect()
    }

    /// Cierre ordenado de todas las sesiones: cada una finaliza su escritor
    /// antes de que el hilo termine.
    pub fn shutdown(&self) {
        for (id, handle) in &self.sessions {
            if handle.commands.send(Command::Shutdown).is_err() {
                log::debug!("Cámara {}: sesión ya terminada", id);
            }
        }
        for (id, handle) in &self.sessions {
            if let Some(thread) = handle.thread.lock().unwrap().take() {
                if thread.join().is_err() {
                    log::error!("❌ Cámara {}: el hilo de sesión murió con pánico", id);
                }
            }
        }
        log::info!("🛑 Planificador detenido");
    }
}

#[derive(Deserialize)]
pub struct OverrideBody {
    pub active: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub cameras: Vec<SessionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInfo>,
}

fn unknown_camera(id: CameraId) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(format!("cámara desconocida: {}", id))),
    )
        .into_response()
}

/// POST /api/cameras/:id/start
pub async fn start_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CameraId>,
) -> Response {
    if state.scheduler.snapshot(id).is_none() {
        return unknown_camera(id);
    }
    match state.scheduler.start(id) {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::ok(format!("grabación iniciada en cámara {}", id))),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/cameras/:id/stop
pub async fn stop_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CameraId>,
) -> Response {
    if state.scheduler.snapshot(id).is_none() {
        return unknown_camera(id);
    }
    match state.scheduler.stop(id) {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::ok(format!("grabación detenida en cámara {}", id))),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/cameras/:id/override
pub async fn set_override(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CameraId>,
    Json(body): Json<OverrideBody>,
) -> Response {
    if state.scheduler.snapshot(id).is_none() {
        return unknown_camera(id);
    }
    match state.scheduler.set_manual_override(id, body.active) {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::ok(format!(
                "override {} en cámara {}",
                if body.active { "activado" } else { "desactivado" },
                id
            ))),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let storage = match gather_storage_info(&state) {
        Ok(info) => Some(info),
        Err(e) => {
            log::warn!("⚠️ No se pudo obtener info de almacenamiento: {}", e);
            None
        }
    };
    Json(StatusResponse {
        cameras: state.scheduler.status(),
        storage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSource, Frame, FrameSpec, SegmentWriter};
    use crate::config::CameraConfig;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[derive(Default)]
    struct WriterLog {
        opened: Mutex<Vec<String>>,
        finalized: Mutex<Vec<String>>,
    }

    impl WriterLog {
        fn opened_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
        fn finalized_count(&self) -> usize {
            self.finalized.lock().unwrap().len()
        }
    }

    struct MockWriterProvider {
        log: Arc<WriterLog>,
        fail_open: bool,
    }

    impl WriterProvider for MockWriterProvider {
        fn open(
            &self,
            path: &std::path::Path,
            _spec: &FrameSpec,
        ) -> Result<Box<dyn SegmentWriter>> {
            if self.fail_open {
                return Err(CentinelaError::WriteInitFailed("disco lleno".to_string()));
            }
            let key = path.to_string_lossy().to_string();
            self.log.opened.lock().unwrap().push(key.clone());
            Ok(Box::new(MockWriter {
                log: Arc::clone(&self.log),
                key,
                done: false,
            }))
        }
    }

    struct MockWriter {
        log: Arc<WriterLog>,
        key: String,
        done: bool,
    }

    impl SegmentWriter for MockWriter {
        fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
            Ok(())
        }
        fn finalize(&mut self) -> Result<()> {
            if !self.done {
                self.done = true;
                self.log.finalized.lock().unwrap().push(self.key.clone());
            }
            Ok(())
        }
    }

    struct MockSourceProvider {
        fail: AtomicBool,
        opens: AtomicUsize,
        frame_gap: Duration,
    }

    impl MockSourceProvider {
        fn healthy(frame_gap: Duration) -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                frame_gap,
            })
        }
        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(true),
                opens: AtomicUsize::new(0),
                frame_gap: Duration::from_millis(10),
            })
        }
    }

    impl SourceProvider for MockSourceProvider {
        fn open(&self, _timeout: Duration) -> Result<Box<dyn CaptureSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CentinelaError::SourceUnavailable(
                    "cámara simulada caída".to_string(),
                ));
            }
            Ok(Box::new(MockSource {
                frame_gap: self.frame_gap,
            }))
        }
        fn concurrent_open_safe(&self) -> bool {
            true
        }
    }

    struct MockSource {
        frame_gap: Duration,
    }

    impl CaptureSource for MockSource {
        fn read_frame(&mut self, _timeout: Duration) -> Result<Frame> {
            std::thread::sleep(self.frame_gap);
            Ok(Frame {
                data: Bytes::from_static(b"au"),
                pts_ns: None,
            })
        }
        fn frame_spec(&self) -> FrameSpec {
            FrameSpec::default()
        }
        fn close(&mut self) {}
    }

    struct Rig {
        scheduler: RecordingScheduler,
        writer_log: Arc<WriterLog>,
        _tmp: TempDir,
    }

    fn rig(
        cadence: chrono::Duration,
        sources: Vec<(CameraId, Arc<dyn SourceProvider>)>,
        fail_writer: bool,
    ) -> Rig {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.output_dir = tmp.path().join("out");
        config.archive_dir = tmp.path().join("arch");
        std::fs::create_dir_all(&config.output_dir).unwrap();
        config.cadence = cadence;
        config.read_timeout = Duration::from_millis(100);
        config.open_timeout = Duration::from_millis(100);
        config.backoff = vec![Duration::from_millis(10)];
        config.cameras = sources
            .iter()
            .map(|(id, _)| CameraConfig {
                id: *id,
                rtsp_url: format!("rtsp://test/{}", id),
            })
            .collect();

        let recording_state = RecordingState::new();
        let retention = Arc::new(RetentionManager::new(
            config.output_dir.clone(),
            config.archive_dir.clone(),
            config.max_age,
            recording_state.clone(),
        ));
        let writer_log = Arc::new(WriterLog::default());
        let writer: Arc<dyn WriterProvider> = Arc::new(MockWriterProvider {
            log: Arc::clone(&writer_log),
            fail_open: fail_writer,
        });

        let scheduler = RecordingScheduler::spawn(
            &config,
            sources.into_iter().collect(),
            writer,
            retention,
            recording_state,
        )
        .unwrap();

        Rig {
            scheduler,
            writer_log,
            _tmp: tmp,
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn three_open_failures_degrade_to_idle_without_touching_sibling() {
        let failing = MockSourceProvider::unreachable();
        let healthy = MockSourceProvider::healthy(Duration::from_millis(20));
        let rig = rig(
            chrono::Duration::minutes(10),
            vec![
                (1, healthy.clone() as Arc<dyn SourceProvider>),
                (2, failing.clone() as Arc<dyn SourceProvider>),
            ],
            false,
        );

        rig.scheduler.start(1).unwrap();
        rig.scheduler.start(2).unwrap();

        assert!(wait_until(Duration::from_secs(3), || {
            let snap = rig.scheduler.snapshot(2).unwrap();
            snap.state == SessionState::Idle && snap.last_fault.is_some()
        }));
        assert_eq!(failing.opens.load(Ordering::SeqCst), 3);

        // la cámara 1 sigue grabando como si nada
        let snap1 = rig.scheduler.snapshot(1).unwrap();
        assert_eq!(snap1.state, SessionState::Recording);
        assert!(snap1.last_fault.is_none());
        assert!(rig.writer_log.opened_count() >= 1);

        rig.scheduler.shutdown();
    }

    #[test]
    fn stop_finalizes_the_in_flight_writer() {
        let healthy = MockSourceProvider::healthy(Duration::from_millis(20));
        let rig = rig(
            chrono::Duration::minutes(10),
            vec![(1, healthy as Arc<dyn SourceProvider>)],
            false,
        );

        rig.scheduler.start(1).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            rig.writer_log.opened_count() >= 1
        }));

        rig.scheduler.stop(1).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            rig.scheduler.snapshot(1).unwrap().state == SessionState::Idle
        }));

        let opened = rig.writer_log.opened.lock().unwrap().clone();
        let finalized = rig.writer_log.finalized.lock().unwrap().clone();
        assert_eq!(opened, finalized);

        rig.scheduler.shutdown();
    }

    #[test]
    fn start_is_idempotent_while_recording() {
        let healthy = MockSourceProvider::healthy(Duration::from_millis(20));
        let rig = rig(
            chrono::Duration::minutes(10),
            vec![(1, healthy.clone() as Arc<dyn SourceProvider>)],
            false,
        );

        rig.scheduler.start(1).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            rig.scheduler.snapshot(1).unwrap().state == SessionState::Recording
        }));
        rig.scheduler.start(1).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        assert_eq!(healthy.opens.load(Ordering::SeqCst), 1);
        assert_eq!(rig.writer_log.opened_count(), 1);

        rig.scheduler.shutdown();
    }

    #[test]
    fn boundary_rotates_into_a_new_segment() {
        let healthy = MockSourceProvider::healthy(Duration::from_millis(20));
        let rig = rig(
            chrono::Duration::seconds(1),
            vec![(1, healthy as Arc<dyn SourceProvider>)],
            false,
        );

        rig.scheduler.start(1).unwrap();
        assert!(wait_until(Duration::from_secs(4), || {
            rig.writer_log.opened_count() >= 2
        }));
        // el primero se finalizó al rotar
        assert!(rig.writer_log.finalized_count() >= 1);
        assert_eq!(
            rig.scheduler.snapshot(1).unwrap().state,
            SessionState::Recording
        );

        rig.scheduler.shutdown();
    }

    #[test]
    fn override_holds_segment_open_across_boundaries() {
        let healthy = MockSourceProvider::healthy(Duration::from_millis(20));
        let rig = rig(
            chrono::Duration::seconds(1),
            vec![(1, healthy as Arc<dyn SourceProvider>)],
            false,
        );

        // el override se encola antes del start: la sesión lo aplica primero
        rig.scheduler.set_manual_override(1, true).unwrap();
        rig.scheduler.start(1).unwrap();

        // varias fronteras pasan sin rotación ni finalize
        std::thread::sleep(Duration::from_millis(2500));
        assert_eq!(rig.writer_log.opened_count(), 1);
        assert_eq!(rig.writer_log.finalized_count(), 0);

        // al soltar el override, cierra en el siguiente chequeo y rota
        rig.scheduler.set_manual_override(1, false).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            rig.writer_log.opened_count() >= 2
        }));
        assert!(rig.writer_log.finalized_count() >= 1);

        rig.scheduler.shutdown();
    }

    #[test]
    fn write_init_failure_degrades_without_retry() {
        let healthy = MockSourceProvider::healthy(Duration::from_millis(20));
        let rig = rig(
            chrono::Duration::minutes(10),
            vec![(1, healthy.clone() as Arc<dyn SourceProvider>)],
            true,
        );

        rig.scheduler.start(1).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            let snap = rig.scheduler.snapshot(1).unwrap();
            snap.state == SessionState::Idle && snap.last_fault.is_some()
        }));
        // un único intento: los fallos de escritura no se reintentan solos
        assert_eq!(healthy.opens.load(Ordering::SeqCst), 1);
        let fault = rig.scheduler.snapshot(1).unwrap().last_fault.unwrap();
        assert!(fault.contains("Write init failed"));

        rig.scheduler.shutdown();
    }

    #[test]
    fn unknown_camera_is_rejected() {
        let healthy = MockSourceProvider::healthy(Duration::from_millis(20));
        let rig = rig(
            chrono::Duration::minutes(10),
            vec![(1, healthy as Arc<dyn SourceProvider>)],
            false,
        );
        assert!(rig.scheduler.start(9).is_err());
        assert!(rig.scheduler.snapshot(9).is_none());
        rig.scheduler.shutdown();
    }
}
