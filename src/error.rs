//! Tipos de error personalizados para Centinela.
//!
//! Proporciona errores estructurados con contexto de cámara/archivo para
//! que la capa de control pueda mostrar estado accionable.

use std::fmt;

/// Error principal de la aplicación Centinela
#[derive(Debug)]
pub enum CentinelaError {
    /// Errores de configuración
    Config(String),
    /// La cámara no responde al abrir la fuente
    SourceUnavailable(String),
    /// El stream terminó o falló a mitad de lectura
    StreamEnded(String),
    /// No se pudo abrir el escritor de segmento (disco lleno, permisos)
    WriteInitFailed(String),
    /// Fallo al borrar un archivo durante la retención
    RetentionDelete(String),
    /// El archivo está siendo escrito por una sesión activa
    ArchiveConflict(String),
    /// Errores de GStreamer
    Pipeline(String),
    /// Errores de I/O
    Io(std::io::Error),
    /// Errores de parsing
    Parse(String),
    /// Errores genéricos
    Other(String),
}

impl fmt::Display for CentinelaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentinelaError::Config(msg) => write!(f, "Config error: {}", msg),
            CentinelaError::SourceUnavailable(msg) => write!(f, "Source unavailable: {}", msg),
            CentinelaError::StreamEnded(msg) => write!(f, "Stream ended: {}", msg),
            CentinelaError::WriteInitFailed(msg) => write!(f, "Write init failed: {}", msg),
            CentinelaError::RetentionDelete(msg) => write!(f, "Retention delete failed: {}", msg),
            CentinelaError::ArchiveConflict(msg) => write!(f, "Archive conflict: {}", msg),
            CentinelaError::Pipeline(msg) => write!(f, "Pipeline error: {}", msg),
            CentinelaError::Io(err) => write!(f, "IO error: {}", err),
            CentinelaError::Parse(msg) => write!(f, "Parse error: {}", msg),
            CentinelaError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CentinelaError {}

impl From<std::io::Error> for CentinelaError {
    fn from(err: std::io::Error) -> Self {
        CentinelaError::Io(err)
    }
}

impl From<serde_json::Error> for CentinelaError {
    fn from(err: serde_json::Error) -> Self {
        CentinelaError::Parse(format!("JSON error: {}", err))
    }
}

impl From<&str> for CentinelaError {
    fn from(err: &str) -> Self {
        CentinelaError::Other(err.to_string())
    }
}

impl From<String> for CentinelaError {
    fn from(err: String) -> Self {
        CentinelaError::Other(err)
    }
}

impl From<gstreamer::glib::BoolError> for CentinelaError {
    fn from(err: gstreamer::glib::BoolError) -> Self {
        CentinelaError::Pipeline(format!("GStreamer BoolError: {}", err))
    }
}

impl From<gstreamer::StateChangeError> for CentinelaError {
    fn from(err: gstreamer::StateChangeError) -> Self {
        CentinelaError::Pipeline(format!("GStreamer StateChangeError: {:?}", err))
    }
}

impl axum::response::IntoResponse for CentinelaError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            CentinelaError::ArchiveConflict(_) => {
                (axum::http::StatusCode::CONFLICT, self.to_string())
            }
            CentinelaError::Config(_)
            | CentinelaError::Io(_)
            | CentinelaError::WriteInitFailed(_)
            | CentinelaError::RetentionDelete(_) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                self.to_string(),
            ),
            CentinelaError::SourceUnavailable(_)
            | CentinelaError::StreamEnded(_)
            | CentinelaError::Pipeline(_) => {
                (axum::http::StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            CentinelaError::Parse(_) | CentinelaError::Other(_) => {
                (axum::http::StatusCode::BAD_REQUEST, self.to_string())
            }
        };

        axum::response::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(format!(
                "{{\"error\": \"{}\"}}",
                message
            )))
            .unwrap()
    }
}

/// Result type alias para simplificar el código
pub type Result<T> = std::result::Result<T, CentinelaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centinela_error_display() {
        let err = CentinelaError::Config("missing CAMERA_1_URL".to_string());
        assert_eq!(format!("{}", err), "Config error: missing CAMERA_1_URL");

        let err = CentinelaError::ArchiveConflict("camera1_2024-01-01_00-00.mp4".to_string());
        assert_eq!(
            format!("{}", err),
            "Archive conflict: camera1_2024-01-01_00-00.mp4"
        );
    }

    #[test]
    fn test_error_from_conversions() {
        // Test From<String>
        let err: CentinelaError = "generic error".to_string().into();
        assert!(matches!(err, CentinelaError::Other(_)));

        // Test From<&str>
        let err: CentinelaError = "string error".into();
        assert!(matches!(err, CentinelaError::Other(_)));

        // Test From<std::io::Error>
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CentinelaError = io_err.into();
        assert!(matches!(err, CentinelaError::Io(_)));
    }

    #[test]
    fn test_error_is_error_trait() {
        let err = CentinelaError::SourceUnavailable("rtsp://example".to_string());
        let _error: &dyn std::error::Error = &err;
    }
}
