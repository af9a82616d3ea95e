//! Escritor de segmentos MP4 sobre GStreamer.
//!
//! Pipeline `appsrc ! h264parse ! mp4mux ! filesink`. `streamable=true` y
//! fragmentos cortos mantienen el archivo reproducible aunque el proceso
//! muera a mitad de segmento; `finalize` drena el EOS para que mp4mux
//! escriba el moov.

use crate::capture::{Frame, FrameSpec, SegmentWriter, WriterProvider};
use crate::error::{CentinelaError, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::{Path, PathBuf};

const FINALIZE_DRAIN: gst::ClockTime = gst::ClockTime::from_seconds(5);

pub struct Mp4WriterProvider;

impl WriterProvider for Mp4WriterProvider {
    fn open(&self, path: &Path, spec: &FrameSpec) -> Result<Box<dyn SegmentWriter>> {
        gst::init()
            .map_err(|e| CentinelaError::WriteInitFailed(format!("GStreamer init: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CentinelaError::WriteInitFailed(format!(
                    "no se pudo crear {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let caps: gst::Caps = spec.caps.parse().map_err(|e| {
            CentinelaError::WriteInitFailed(format!("caps inválidos '{}': {}", spec.caps, e))
        })?;

        let description = format!(
            concat!(
                "appsrc name=src is-live=true format=time block=true ! ",
                "h264parse config-interval=-1 ! ",
                "mp4mux faststart=false streamable=true fragment-duration=1000 ! ",
                "filesink location=\"{}\" sync=false"
            ),
            path.display()
        );

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| {
                CentinelaError::WriteInitFailed(format!(
                    "no se pudo crear el pipeline de escritura para {}: {}",
                    path.display(),
                    e
                ))
            })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| {
                CentinelaError::WriteInitFailed("el launch no produjo un Pipeline".to_string())
            })?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| {
                CentinelaError::WriteInitFailed("appsrc 'src' no encontrado".to_string())
            })?;
        appsrc.set_caps(Some(&caps));

        if pipeline.set_state(gst::State::Playing).is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CentinelaError::WriteInitFailed(format!(
                "el pipeline de escritura no arranca para {}",
                path.display()
            )));
        }

        // Un filesink que no puede crear el archivo (permisos, disco lleno)
        // falla de forma asíncrona; se detecta aquí antes de aceptar frames.
        if let Some(bus) = pipeline.bus() {
            if let Some(msg) =
                bus.timed_pop_filtered(gst::ClockTime::from_mseconds(200), &[gst::MessageType::Error])
            {
                let detail = match msg.view() {
                    gst::MessageView::Error(err) => err.error().to_string(),
                    _ => "error desconocido".to_string(),
                };
                let _ = pipeline.set_state(gst::State::Null);
                return Err(CentinelaError::WriteInitFailed(format!(
                    "{}: {}",
                    path.display(),
                    detail
                )));
            }
        }

        log::info!("📹 Segmento abierto: {}", path.display());

        Ok(Box::new(Mp4SegmentWriter {
            pipeline,
            appsrc,
            path: path.to_path_buf(),
            finalized: false,
        }))
    }
}

pub struct Mp4SegmentWriter {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    finalized: bool,
}

impl Mp4SegmentWriter {
    fn check_bus(&self) -> Result<()> {
        if let Some(bus) = self.pipeline.bus() {
            while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
                if let gst::MessageView::Error(err) = msg.view() {
                    return Err(CentinelaError::Pipeline(format!(
                        "escritura en {}: {}",
                        self.path.display(),
                        err.error()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl SegmentWriter for Mp4SegmentWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.finalized {
            return Err(CentinelaError::Pipeline(format!(
                "escritura sobre segmento finalizado: {}",
                self.path.display()
            )));
        }
        self.check_bus()?;

        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(r) = buffer.get_mut() {
            r.set_pts(frame.pts_ns.map(gst::ClockTime::from_nseconds));
        }
        self.appsrc.push_buffer(buffer).map_err(|e| {
            CentinelaError::Pipeline(format!(
                "push_buffer en {}: {:?}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let _ = self.appsrc.end_of_stream();

        // Drena hasta EOS (o error) para que el muxer cierre el archivo;
        // acotado para no colgar la sesión si el pipeline ya murió.
        if let Some(bus) = self.pipeline.bus() {
            let _ = bus.timed_pop_filtered(
                FINALIZE_DRAIN,
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
        }
        let _ = self.pipeline.set_state(gst::State::Null);
        log::info!("💾 Segmento finalizado: {}", self.path.display());
        Ok(())
    }
}

impl Drop for Mp4SegmentWriter {
    fn drop(&mut self) {
        // Nunca se abandona un segmento sin cerrar.
        let _ = self.finalize();
    }
}
