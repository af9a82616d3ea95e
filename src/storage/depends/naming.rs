//! Codificación y parseo de nombres de segmento.
//!
//! `camera{N}_{YYYY-MM-DD_HH-MM}.mp4` es la única identidad persistida de un
//! segmento; no hay índice ni base de datos. El parseo ancla en el sufijo de
//! timestamp de ancho fijo, así un token de cámara que contenga `_` nunca
//! puede confundirse con el separador.

use crate::CameraId;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

pub const SEGMENT_EXT: &str = "mp4";
const TS_FORMAT: &str = "%Y-%m-%d_%H-%M";
const TS_LEN: usize = 16; // "YYYY-MM-DD_HH-MM"

/// Nombre de archivo para un segmento, timestamp truncado a minuto.
pub fn segment_file_name(camera: CameraId, start: NaiveDateTime) -> String {
    format!(
        "camera{}_{}.{}",
        camera,
        start.format(TS_FORMAT),
        SEGMENT_EXT
    )
}

pub fn segment_path(dir: &Path, camera: CameraId, start: NaiveDateTime) -> PathBuf {
    dir.join(segment_file_name(camera, start))
}

/// Parseo inverso. Devuelve `None` para cualquier nombre que no sea un
/// segmento válido; el fallo de parseo es un resultado tipado, nunca un
/// panic que tumbe un escaneo de directorio.
pub fn parse_segment_name(name: &str) -> Option<(CameraId, NaiveDateTime)> {
    if !name.is_ascii() {
        return None;
    }
    let stem = name.strip_suffix(&format!(".{}", SEGMENT_EXT))?;
    if stem.len() <= TS_LEN + 1 {
        return None;
    }
    let (head, ts) = stem.split_at(stem.len() - TS_LEN);
    let head = head.strip_suffix('_')?;
    let digits = head.strip_prefix("camera")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let camera: CameraId = digits.parse().ok()?;
    let start = NaiveDateTime::parse_from_str(ts, TS_FORMAT).ok()?;
    Some((camera, start))
}
