//! Módulo de captura para Centinela.
//!
//! Define la frontera entre el planificador y el pipeline de video: el
//! planificador sólo ve fuentes de captura y escritores de segmento como
//! trait objects, nunca internals de stream o de archivo. Las
//! implementaciones reales (GStreamer) viven en `depends/`.

pub mod depends;

pub use depends::mp4::Mp4WriterProvider;
pub use depends::rtsp::{RtspSourceProvider, StreamProfile};

use crate::error::Result;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;

/// Un frame codificado tal como sale de la fuente.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,
    pub pts_ns: Option<u64>,
}

/// Formato de los frames que produce una fuente, como caps de GStreamer.
/// El escritor lo necesita para configurar su entrada sin recodificar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSpec {
    pub caps: String,
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self {
            caps: "video/x-h264,stream-format=byte-stream,alignment=au".to_string(),
        }
    }
}

/// Handle abierto a una cámara. `read_frame` es bloqueante con timeout
/// acotado; un timeout o un corte se reportan como `StreamEnded`.
pub trait CaptureSource: Send {
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame>;
    fn frame_spec(&self) -> FrameSpec;
    fn close(&mut self);
}

/// Fabrica handles de captura para una cámara concreta.
pub trait SourceProvider: Send + Sync {
    /// Abre un handle nuevo. Falla con `SourceUnavailable` si la cámara no
    /// responde dentro del timeout.
    fn open(&self, timeout: Duration) -> Result<Box<dyn CaptureSource>>;

    /// Indica si es seguro abrir un segundo handle a la misma cámara física
    /// (preview concurrente con grabación).
    fn concurrent_open_safe(&self) -> bool;
}

/// Escritor de un segmento acotado. `finalize` es idempotente y siempre
/// seguro de llamar; un segmento parcial finalizado queda reproducible.
pub trait SegmentWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finalize(&mut self) -> Result<()>;
}

/// Fabrica escritores de segmento. Falla con `WriteInitFailed`.
pub trait WriterProvider: Send + Sync {
    fn open(&self, path: &Path, spec: &FrameSpec) -> Result<Box<dyn SegmentWriter>>;
}
