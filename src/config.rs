//! Configuración de Centinela.
//!
//! Toda la superficie de configuración vive en una única estructura cargada
//! desde variables de entorno (via `.env` con dotenvy), sin constantes
//! dispersas por el código.

use crate::error::{CentinelaError, Result};
use crate::CameraId;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Descriptor de conexión de una cámara. Inmutable durante la vida del proceso.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub id: CameraId,
    pub rtsp_url: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
    /// Cadencia de rotación de segmentos, anclada a medianoche local.
    pub cadence: chrono::Duration,
    /// Edad máxima de un segmento no archivado antes de ser borrado.
    pub max_age: chrono::Duration,
    /// Timeout por intento de apertura de fuente o escritor.
    pub open_timeout: Duration,
    /// Timeout por lectura de frame; acota la latencia de cancelación.
    pub read_timeout: Duration,
    /// Esperas entre reintentos de apertura. El último valor se repite.
    pub backoff: Vec<Duration>,
    /// Aperturas fallidas consecutivas dentro de una ventana antes de degradar la sesión.
    pub max_open_failures: u32,
    /// Arrancar la grabación de todas las cámaras al iniciar el proceso.
    pub auto_start: bool,
    pub listen_addr: String,
    pub proxy_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            output_dir: PathBuf::from("recordings"),
            archive_dir: PathBuf::from("archive"),
            cadence: chrono::Duration::hours(12),
            max_age: chrono::Duration::days(7),
            open_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
            max_open_failures: 3,
            auto_start: true,
            listen_addr: "0.0.0.0:8080".to_string(),
            proxy_token: String::new(),
        }
    }
}

impl Config {
    /// Carga la configuración desde el entorno. `CAMERA_1_URL`, `CAMERA_2_URL`, ...
    /// se leen en orden hasta la primera ausente; el resto tiene defaults.
    pub fn from_env() -> Result<Self> {
        let mut cameras = Vec::new();
        let mut id: CameraId = 1;
        while let Ok(url) = env::var(format!("CAMERA_{}_URL", id)) {
            cameras.push(CameraConfig { id, rtsp_url: url });
            id += 1;
        }
        if cameras.is_empty() {
            return Err(CentinelaError::Config(
                "no hay cámaras configuradas (se esperaba CAMERA_1_URL)".to_string(),
            ));
        }

        let proxy_token = env::var("PROXY_TOKEN")
            .map_err(|_| CentinelaError::Config("PROXY_TOKEN no definido".to_string()))?;

        let defaults = Config::default();

        let cadence_hours = env_i64("CADENCE_HOURS", 12);
        if cadence_hours < 1 || cadence_hours > 24 {
            return Err(CentinelaError::Config(format!(
                "CADENCE_HOURS fuera de rango (1..24): {}",
                cadence_hours
            )));
        }

        Ok(Config {
            cameras,
            output_dir: PathBuf::from(
                env::var("OUTPUT_DIR").unwrap_or_else(|_| "recordings".to_string()),
            ),
            archive_dir: PathBuf::from(
                env::var("ARCHIVE_DIR").unwrap_or_else(|_| "archive".to_string()),
            ),
            cadence: chrono::Duration::hours(cadence_hours),
            max_age: chrono::Duration::days(env_i64("MAX_AGE_DAYS", 7)),
            open_timeout: Duration::from_secs(env_u64("OPEN_TIMEOUT_SECS", 10)),
            read_timeout: Duration::from_secs(env_u64("READ_TIMEOUT_SECS", 5)),
            backoff: match env::var("BACKOFF_SCHEDULE_SECS") {
                Ok(raw) => parse_backoff(&raw)?,
                Err(_) => defaults.backoff,
            },
            max_open_failures: env_u64("MAX_OPEN_FAILURES", 3) as u32,
            auto_start: env::var("AUTO_START")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            proxy_token,
        })
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parsea una lista "1,5,30" de segundos a esperas de backoff.
pub fn parse_backoff(raw: &str) -> Result<Vec<Duration>> {
    let mut schedule = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let secs: u64 = part.parse().map_err(|_| {
            CentinelaError::Config(format!("BACKOFF_SCHEDULE_SECS inválido: '{}'", part))
        })?;
        schedule.push(Duration::from_secs(secs));
    }
    if schedule.is_empty() {
        return Err(CentinelaError::Config(
            "BACKOFF_SCHEDULE_SECS vacío".to_string(),
        ));
    }
    Ok(schedule)
}
