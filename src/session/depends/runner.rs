//! Bucle de sesión por cámara.
//!
//! Cada cámara corre este bucle en su propio hilo, sin estado mutable
//! compartido con las demás. Los comandos (start/stop/override) llegan por
//! un canal y se consumen sólo en puntos de control, nunca como
//! interrupciones a mitad de escritura; la latencia de cancelación queda
//! acotada por el timeout de lectura.

use crate::capture::{CaptureSource, SegmentWriter, SourceProvider, WriterProvider};
use crate::session::depends::window::{next_boundary, window_at, SegmentWindow};
use crate::session::{Command, SessionSnapshot, SessionState};
use crate::storage::{segment_path, RecordingState, RetentionManager};
use crate::CameraId;
use chrono::{Local, NaiveDateTime};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct SessionContext {
    pub camera_id: CameraId,
    pub cadence: chrono::Duration,
    pub output_dir: PathBuf,
    pub open_timeout: Duration,
    pub read_timeout: Duration,
    pub backoff: Vec<Duration>,
    pub max_open_failures: u32,
    pub source: Arc<dyn SourceProvider>,
    pub writer: Arc<dyn WriterProvider>,
    pub retention: Arc<RetentionManager>,
    pub recording_state: RecordingState,
    pub shared: Arc<Mutex<SessionSnapshot>>,
    pub commands: Receiver<Command>,
}

impl SessionContext {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn set_state(&self, state: SessionState) {
        self.shared.lock().unwrap().state = state;
    }

    fn set_fault(&self, fault: Option<String>) {
        self.shared.lock().unwrap().last_fault = fault;
    }

    fn set_segment(&self, start: Option<NaiveDateTime>) {
        self.shared.lock().unwrap().segment_start = start;
    }

    fn set_override(&self, active: bool) {
        self.shared.lock().unwrap().manual_override = active;
        log::info!(
            "🔒 Cámara {}: override manual {}",
            self.camera_id,
            if active { "activado" } else { "desactivado" }
        );
    }

    fn override_active(&self) -> bool {
        self.shared.lock().unwrap().manual_override
    }

    fn note_open_failures(&self, count: u32) {
        self.shared.lock().unwrap().consecutive_open_failures = count;
    }
}

/// Resultado de drenar comandos en un punto de control.
enum Flow {
    Continue,
    Stop,
    Shutdown,
}

enum Exit {
    Stopped,
    Fault(String),
    Shutdown,
}

enum Pump {
    Boundary,
    SourceLost(String),
    Stop,
    Shutdown,
    WriteFault(String),
}

fn apply_command(ctx: &SessionContext, cmd: Command) -> Flow {
    match cmd {
        // start sobre una sesión que ya graba es un no-op
        Command::Start => Flow::Continue,
        Command::Stop => Flow::Stop,
        Command::SetOverride(v) => {
            ctx.set_override(v);
            Flow::Continue
        }
        Command::Shutdown => Flow::Shutdown,
    }
}

fn drain_commands(ctx: &SessionContext) -> Flow {
    loop {
        match ctx.commands.try_recv() {
            Ok(cmd) => match apply_command(ctx, cmd) {
                Flow::Continue => continue,
                other => return other,
            },
            Err(TryRecvError::Empty) => return Flow::Continue,
            Err(TryRecvError::Disconnected) => return Flow::Shutdown,
        }
    }
}

/// Espera acotada que sigue atendiendo comandos: el backoff entre aperturas
/// nunca deja sorda a la sesión.
fn wait_commands(ctx: &SessionContext, timeout: Duration) -> Flow {
    match ctx.commands.recv_timeout(timeout) {
        Ok(cmd) => apply_command(ctx, cmd),
        Err(RecvTimeoutError::Timeout) => Flow::Continue,
        Err(RecvTimeoutError::Disconnected) => Flow::Shutdown,
    }
}

/// Punto de entrada del hilo de sesión. Vive lo que el proceso.
pub(crate) fn run_session(ctx: SessionContext) {
    log::info!("🎥 Cámara {}: sesión lista (idle)", ctx.camera_id);
    loop {
        // Idle: suspendido en el canal, sin busy-wait
        let cmd = match ctx.commands.recv() {
            Ok(cmd) => cmd,
            Err(_) => return,
        };
        match cmd {
            Command::Start => {}
            Command::Stop => continue,
            Command::SetOverride(v) => {
                ctx.set_override(v);
                continue;
            }
            Command::Shutdown => return,
        }

        ctx.set_state(SessionState::Recording);
        ctx.set_fault(None);
        log::info!("▶️ Cámara {}: grabación iniciada", ctx.camera_id);

        match run_recording(&ctx) {
            Exit::Stopped => {
                ctx.set_state(SessionState::Idle);
                log::info!("⏹️ Cámara {}: grabación detenida", ctx.camera_id);
            }
            Exit::Fault(msg) => {
                ctx.set_state(SessionState::Idle);
                ctx.set_fault(Some(msg.clone()));
                log::error!(
                    "❌ Cámara {}: sesión degradada a idle: {}",
                    ctx.camera_id,
                    msg
                );
            }
            Exit::Shutdown => {
                ctx.set_state(SessionState::Idle);
                log::info!("🛑 Cámara {}: sesión cerrada", ctx.camera_id);
                return;
            }
        }
    }
}

fn run_recording(ctx: &SessionContext) -> Exit {
    let mut window = window_at(ctx.now(), ctx.cadence);
    let mut open_failures: u32 = 0;
    let mut backoff_idx: usize = 0;

    loop {
        match drain_commands(ctx) {
            Flow::Stop => return Exit::Stopped,
            Flow::Shutdown => return Exit::Shutdown,
            Flow::Continue => {}
        }

        let now = ctx.now();
        if now >= window.end {
            // nueva ventana lógica; el umbral de fallos cuenta por ventana
            window = window_at(now, ctx.cadence);
            open_failures = 0;
            backoff_idx = 0;
        }

        let mut source = match ctx.source.open(ctx.open_timeout) {
            Ok(s) => s,
            Err(e) => {
                open_failures += 1;
                ctx.note_open_failures(open_failures);
                log::warn!(
                    "⚠️ Cámara {}: {} (intento {} de {})",
                    ctx.camera_id,
                    e,
                    open_failures,
                    ctx.max_open_failures
                );
                if open_failures >= ctx.max_open_failures {
                    return Exit::Fault(format!(
                        "cámara inalcanzable: {} aperturas fallidas consecutivas en la ventana {} .. {}",
                        open_failures, window.start, window.end
                    ));
                }
                let delay = ctx
                    .backoff
                    .get(backoff_idx)
                    .or_else(|| ctx.backoff.last())
                    .copied()
                    .unwrap_or(Duration::from_secs(1));
                if backoff_idx + 1 < ctx.backoff.len() {
                    backoff_idx += 1;
                }
                match wait_commands(ctx, delay) {
                    Flow::Stop => return Exit::Stopped,
                    Flow::Shutdown => return Exit::Shutdown,
                    Flow::Continue => {}
                }
                continue;
            }
        };
        open_failures = 0;
        backoff_idx = 0;
        ctx.note_open_failures(0);

        let spec = source.frame_spec();
        let path = segment_path(&ctx.output_dir, ctx.camera_id, window.start);
        let path_key = path.to_string_lossy().to_string();

        let mut writer = match ctx.writer.open(&path, &spec) {
            Ok(w) => w,
            Err(e) => {
                source.close();
                // Sin reintento automático: un fallo de escritura suele ser un
                // problema persistente del entorno, no un corte transitorio.
                return Exit::Fault(e.to_string());
            }
        };

        ctx.recording_state.start_recording(&path_key);
        ctx.set_segment(Some(window.start));
        log::info!("📹 Cámara {}: grabando {}", ctx.camera_id, path.display());

        let outcome = pump_segment(ctx, source.as_mut(), writer.as_mut(), &window);

        // Cierre ordenado SIEMPRE: un segmento parcial (incluso vacío) queda
        // como archivo válido, nunca truncado a mitad de escritura.
        if let Err(e) = writer.finalize() {
            log::error!(
                "❌ Cámara {}: finalize de {} falló: {}",
                ctx.camera_id,
                path.display(),
                e
            );
        }
        drop(writer);
        ctx.recording_state.stop_recording(&path_key);
        ctx.set_segment(None);
        source.close();

        // Retención tras cada cierre: la presión de borrado sigue a la cadencia
        let summary = ctx.retention.reconcile();
        if summary.deleted > 0 || summary.errors > 0 {
            log::info!(
                "🧹 Cámara {}: retención tras cierre: {} borrados, {} errores",
                ctx.camera_id,
                summary.deleted,
                summary.errors
            );
        }

        match outcome {
            Pump::Boundary => {
                // la nueva ventana se calcula en el tope del bucle
            }
            Pump::SourceLost(reason) => {
                log::warn!(
                    "🔁 Cámara {}: {} — se reintenta la apertura",
                    ctx.camera_id,
                    reason
                );
            }
            Pump::Stop => return Exit::Stopped,
            Pump::Shutdown => return Exit::Shutdown,
            Pump::WriteFault(msg) => return Exit::Fault(msg),
        }
    }
}

/// Bombea frames de la fuente al escritor hasta frontera, corte o comando.
fn pump_segment(
    ctx: &SessionContext,
    source: &mut dyn CaptureSource,
    writer: &mut dyn SegmentWriter,
    window: &SegmentWindow,
) -> Pump {
    let mut extension_logged_until = window.end;

    loop {
        match drain_commands(ctx) {
            Flow::Stop => return Pump::Stop,
            Flow::Shutdown => return Pump::Shutdown,
            Flow::Continue => {}
        }

        let now = ctx.now();
        if now >= window.end {
            if ctx.override_active() {
                // la ventana se extiende y se revisa en la siguiente frontera
                if now >= extension_logged_until {
                    extension_logged_until = next_boundary(now, ctx.cadence);
                    log::info!(
                        "🔒 Cámara {}: override activo en la frontera, segmento abierto hasta {}",
                        ctx.camera_id,
                        extension_logged_until
                    );
                }
            } else {
                return Pump::Boundary;
            }
        }

        match source.read_frame(ctx.read_timeout) {
            Ok(frame) => {
                if let Err(e) = writer.write_frame(&frame) {
                    return Pump::WriteFault(format!("escritura de frame fallida: {}", e));
                }
            }
            Err(e) => return Pump::SourceLost(e.to_string()),
        }
    }
}
