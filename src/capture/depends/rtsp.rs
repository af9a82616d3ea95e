//! Fuente de captura RTSP sobre GStreamer.
//!
//! Dos perfiles de pipeline: grabación (H.264 sin recodificar, alineado a
//! access units) y preview (decodifica y reencodea a JPEG para MJPEG).

use crate::capture::{CaptureSource, Frame, FrameSpec, SourceProvider};
use crate::error::{CentinelaError, Result};
use crate::CameraId;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::time::Duration;

/// Qué rama del pipeline se construye al abrir la fuente.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamProfile {
    /// H.264 passthrough para el escritor de segmentos.
    Record,
    /// Frames JPEG de baja latencia para la vista en vivo.
    Preview,
}

pub struct RtspSourceProvider {
    camera_id: CameraId,
    url: String,
    profile: StreamProfile,
}

impl RtspSourceProvider {
    pub fn new(camera_id: CameraId, url: String, profile: StreamProfile) -> Self {
        Self {
            camera_id,
            url,
            profile,
        }
    }

    fn pipeline_description(&self) -> String {
        match self.profile {
            StreamProfile::Record => format!(
                concat!(
                    "rtspsrc location={} protocols=tcp latency=2000 ! ",
                    "rtph264depay ! h264parse config-interval=-1 ! ",
                    "video/x-h264,stream-format=byte-stream,alignment=au ! ",
                    "queue max-size-buffers=100 max-size-time=5000000000 ! ",
                    "appsink name=frames sync=false max-buffers=64 drop=false"
                ),
                self.url
            ),
            StreamProfile::Preview => format!(
                concat!(
                    "rtspsrc location={} protocols=tcp latency=50 ! ",
                    "rtph264depay ! h264parse ! avdec_h264 ! videoconvert ! videoscale ! ",
                    "video/x-raw,width=1280,height=720 ! ",
                    "queue leaky=downstream max-size-buffers=1 max-size-time=0 max-size-bytes=0 ! ",
                    "jpegenc quality=85 ! ",
                    "appsink name=frames sync=false max-buffers=1 drop=true"
                ),
                self.url
            ),
        }
    }

    fn frame_spec(&self) -> FrameSpec {
        match self.profile {
            StreamProfile::Record => FrameSpec::default(),
            StreamProfile::Preview => FrameSpec {
                caps: "image/jpeg".to_string(),
            },
        }
    }
}

impl SourceProvider for RtspSourceProvider {
    fn open(&self, timeout: Duration) -> Result<Box<dyn CaptureSource>> {
        gst::init().map_err(|e| {
            CentinelaError::SourceUnavailable(format!(
                "cámara {}: GStreamer init: {}",
                self.camera_id, e
            ))
        })?;

        let description = self.pipeline_description();
        let pipeline = gst::parse::launch(&description)
            .map_err(|e| {
                CentinelaError::SourceUnavailable(format!(
                    "cámara {}: no se pudo crear el pipeline: {}",
                    self.camera_id, e
                ))
            })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| {
                CentinelaError::Pipeline(format!(
                    "cámara {}: el launch no produjo un Pipeline",
                    self.camera_id
                ))
            })?;

        let appsink = pipeline
            .by_name("frames")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| {
                CentinelaError::Pipeline(format!(
                    "cámara {}: appsink 'frames' no encontrado",
                    self.camera_id
                ))
            })?;

        if pipeline.set_state(gst::State::Playing).is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CentinelaError::SourceUnavailable(format!(
                "cámara {}: el pipeline no arranca",
                self.camera_id
            )));
        }

        // Espera acotada a que el pipeline llegue a Playing; RTSP caído se
        // detecta aquí en vez de colgar la sesión.
        let wait = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let (change, _, _) = pipeline.state(wait);
        if change.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CentinelaError::SourceUnavailable(format!(
                "cámara {}: sin respuesta RTSP en {:?}",
                self.camera_id, timeout
            )));
        }

        log::info!(
            "🎥 Cámara {}: fuente abierta ({:?})",
            self.camera_id,
            self.profile
        );

        Ok(Box::new(RtspSource {
            camera_id: self.camera_id,
            pipeline,
            appsink,
            spec: self.frame_spec(),
            closed: false,
        }))
    }

    fn concurrent_open_safe(&self) -> bool {
        // Cada open crea su propia conexión RTSP; la cámara sirve varias.
        true
    }
}

pub struct RtspSource {
    camera_id: CameraId,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    spec: FrameSpec,
    closed: bool,
}

impl RtspSource {
    /// Drena el bus buscando errores o EOS acumulados desde la última lectura.
    fn check_bus(&self) -> Result<()> {
        if let Some(bus) = self.pipeline.bus() {
            while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])
            {
                match msg.view() {
                    gst::MessageView::Error(err) => {
                        return Err(CentinelaError::StreamEnded(format!(
                            "cámara {}: error del pipeline: {}",
                            self.camera_id,
                            err.error()
                        )));
                    }
                    gst::MessageView::Eos(_) => {
                        return Err(CentinelaError::StreamEnded(format!(
                            "cámara {}: fin del stream (EOS)",
                            self.camera_id
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl CaptureSource for RtspSource {
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame> {
        self.check_bus()?;

        let wait = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        match self.appsink.try_pull_sample(wait) {
            Some(sample) => {
                let buffer = sample.buffer().ok_or_else(|| {
                    CentinelaError::StreamEnded(format!(
                        "cámara {}: sample sin buffer",
                        self.camera_id
                    ))
                })?;
                let map = buffer.map_readable().map_err(|_| {
                    CentinelaError::StreamEnded(format!(
                        "cámara {}: buffer ilegible",
                        self.camera_id
                    ))
                })?;
                Ok(Frame {
                    data: Bytes::copy_from_slice(map.as_ref()),
                    pts_ns: buffer.pts().map(|t| t.nseconds()),
                })
            }
            None => {
                // Sin sample dentro del timeout: o EOS real o stream parado.
                // En ambos casos el segmento actual se finaliza y se reintenta.
                self.check_bus()?;
                Err(CentinelaError::StreamEnded(format!(
                    "cámara {}: sin frames en {:?}",
                    self.camera_id, timeout
                )))
            }
        }
    }

    fn frame_spec(&self) -> FrameSpec {
        self.spec.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.pipeline.set_state(gst::State::Null);
            log::debug!("Cámara {}: fuente cerrada", self.camera_id);
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.close();
    }
}
