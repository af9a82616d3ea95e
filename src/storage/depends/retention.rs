//! Retención y archivado de segmentos.
//!
//! La edad se calcula sobre el timestamp parseado del nombre, nunca sobre
//! mtime: el mtime no sobrevive copias o movimientos del directorio. Un
//! archivo archivado sale del alcance de la retención de forma permanente
//! porque `reconcile` sólo escanea `output_dir`.

use crate::error::{CentinelaError, Result};
use crate::storage::depends::naming::parse_segment_name;
use crate::storage::RecordingState;
use chrono::{Local, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Resumen de una pasada de reconciliación.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub deleted: usize,
    pub kept: usize,
    pub skipped_unparseable: usize,
    pub errors: usize,
}

pub struct RetentionManager {
    output_dir: PathBuf,
    archive_dir: PathBuf,
    max_age: chrono::Duration,
    recording_state: RecordingState,
    // Serializa pasadas concurrentes sobre el mismo directorio: dos sesiones
    // finalizando a la vez no deben competir por borrar el mismo archivo.
    reconcile_lock: Mutex<()>,
}

impl RetentionManager {
    pub fn new(
        output_dir: PathBuf,
        archive_dir: PathBuf,
        max_age: chrono::Duration,
        recording_state: RecordingState,
    ) -> Self {
        Self {
            output_dir,
            archive_dir,
            max_age,
            recording_state,
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Reconciliación con el reloj real. Se dispara tras cada cierre de
    /// segmento, no con un timer, para que la presión de retención siga a la
    /// cadencia de grabación.
    pub fn reconcile(&self) -> ReconcileSummary {
        self.reconcile_at(Local::now().naive_local())
    }

    /// Best-effort por archivo: un borrado fallido se registra y la pasada
    /// continúa con el resto del directorio.
    pub fn reconcile_at(&self, now: NaiveDateTime) -> ReconcileSummary {
        let _guard = self.reconcile_lock.lock().unwrap();
        let mut summary = ReconcileSummary::default();

        let entries = match fs::read_dir(&self.output_dir) {
            Ok(e) => e,
            Err(e) => {
                log::warn!(
                    "⚠️ Retención: no se pudo leer {}: {}",
                    self.output_dir.display(),
                    e
                );
                summary.errors += 1;
                return summary;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            // Nombres ajenos quedan intactos: nunca se borra a ciegas.
            let (_, start) = match parse_segment_name(&name) {
                Some(parsed) => parsed,
                None => {
                    summary.skipped_unparseable += 1;
                    continue;
                }
            };

            if self.recording_state.is_recording(&path.to_string_lossy()) {
                summary.kept += 1;
                continue;
            }

            if now - start > self.max_age {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        summary.deleted += 1;
                        log::info!("🗑️ Segmento expirado eliminado: {}", name);
                    }
                    Err(e) => {
                        summary.errors += 1;
                        log::warn!(
                            "⚠️ {}",
                            CentinelaError::RetentionDelete(format!("{}: {}", name, e))
                        );
                    }
                }
            } else {
                summary.kept += 1;
            }
        }

        log::debug!(
            "Retención: {} borrados, {} conservados, {} ajenos, {} errores",
            summary.deleted,
            summary.kept,
            summary.skipped_unparseable,
            summary.errors
        );
        summary
    }

    /// Mueve un segmento a `archive_dir`, fuera del alcance de la retención.
    /// Falla con `ArchiveConflict` si una sesión lo está escribiendo: la
    /// coordinación va por estado de sesión, no por locks de filesystem,
    /// porque el rename de archivos abiertos no es portable.
    pub fn archive(&self, name: &str) -> Result<PathBuf> {
        guard_segment_name(name)?;
        let src = self.output_dir.join(name);

        if self.recording_state.is_recording(&src.to_string_lossy()) {
            return Err(CentinelaError::ArchiveConflict(name.to_string()));
        }
        if !src.is_file() {
            return Err(CentinelaError::Other(format!("no existe: {}", name)));
        }

        fs::create_dir_all(&self.archive_dir)?;
        let dest = self.archive_dir.join(name);
        fs::rename(&src, &dest)?;
        log::info!("📦 Segmento archivado: {} -> {}", name, dest.display());
        Ok(dest)
    }

    /// Borrado manual, sin mirar la edad. Igual que `archive`, rechaza
    /// archivos en escritura activa.
    pub fn delete(&self, name: &str) -> Result<()> {
        guard_segment_name(name)?;
        let src = self.output_dir.join(name);

        if self.recording_state.is_recording(&src.to_string_lossy()) {
            return Err(CentinelaError::ArchiveConflict(name.to_string()));
        }
        if !src.is_file() {
            return Err(CentinelaError::Other(format!("no existe: {}", name)));
        }

        fs::remove_file(&src)?;
        log::info!("🗑️ Segmento borrado manualmente: {}", name);
        Ok(())
    }
}

/// Rechaza nombres con separadores o traversal antes de tocar el filesystem.
fn guard_segment_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(CentinelaError::Parse(format!(
            "nombre de segmento inválido: '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::depends::naming::segment_file_name;
    use chrono::{Duration, NaiveDate};
    use std::fs::File;
    use tempfile::TempDir;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn manager(tmp: &TempDir, state: RecordingState) -> RetentionManager {
        RetentionManager::new(
            tmp.path().join("out"),
            tmp.path().join("arch"),
            Duration::days(7),
            state,
        )
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        File::create(&path).unwrap();
        path
    }

    #[test]
    fn deletes_expired_and_keeps_young() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp, RecordingState::new());
        let now = ts(2024, 1, 15, 13, 0);

        let old = touch(mgr.output_dir(), &segment_file_name(1, ts(2024, 1, 1, 0, 0)));
        let young = touch(mgr.output_dir(), &segment_file_name(1, ts(2024, 1, 14, 12, 0)));
        // exactamente max_age no es "> max_age": se conserva
        let edge = touch(mgr.output_dir(), &segment_file_name(2, ts(2024, 1, 8, 13, 0)));

        let summary = mgr.reconcile_at(now);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.kept, 2);
        assert!(!old.exists());
        assert!(young.exists());
        assert!(edge.exists());
    }

    #[test]
    fn unparseable_names_are_never_touched() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp, RecordingState::new());

        let foreign = touch(mgr.output_dir(), "notes.txt");
        let odd = touch(mgr.output_dir(), "cameraX_2024-01-01_00-00.mp4");

        let summary = mgr.reconcile_at(ts(2030, 1, 1, 0, 0));
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.skipped_unparseable, 2);
        assert!(foreign.exists());
        assert!(odd.exists());
    }

    #[test]
    fn active_recording_is_never_deleted() {
        let tmp = TempDir::new().unwrap();
        let state = RecordingState::new();
        let mgr = manager(&tmp, state.clone());

        let active = touch(mgr.output_dir(), &segment_file_name(1, ts(2024, 1, 1, 0, 0)));
        state.start_recording(&active.to_string_lossy());

        let summary = mgr.reconcile_at(ts(2030, 1, 1, 0, 0));
        assert_eq!(summary.deleted, 0);
        assert!(active.exists());

        state.stop_recording(&active.to_string_lossy());
        let summary = mgr.reconcile_at(ts(2030, 1, 1, 0, 0));
        assert_eq!(summary.deleted, 1);
        assert!(!active.exists());
    }

    #[test]
    fn delete_error_does_not_abort_the_pass() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp, RecordingState::new());

        // un directorio con nombre de segmento expirado: remove_file falla
        let stubborn = mgr
            .output_dir()
            .join(segment_file_name(1, ts(2024, 1, 1, 0, 0)));
        fs::create_dir_all(&stubborn).unwrap();
        let old = touch(mgr.output_dir(), &segment_file_name(2, ts(2024, 1, 1, 0, 0)));

        let summary = mgr.reconcile_at(ts(2024, 1, 15, 0, 0));
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.deleted, 1);
        assert!(stubborn.exists());
        assert!(!old.exists());
    }

    #[test]
    fn archive_removes_file_from_retention_scope_forever() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp, RecordingState::new());
        let name = segment_file_name(1, ts(2024, 1, 1, 0, 0));
        touch(mgr.output_dir(), &name);

        let dest = mgr.archive(&name).unwrap();
        assert!(dest.exists());
        assert!(!mgr.output_dir().join(&name).exists());

        // pasadas repetidas con cualquier edad nunca lo tocan
        for _ in 0..3 {
            mgr.reconcile_at(ts(2040, 1, 1, 0, 0));
            assert!(dest.exists());
        }
    }

    #[test]
    fn archive_conflicts_with_active_writer_until_stop() {
        let tmp = TempDir::new().unwrap();
        let state = RecordingState::new();
        let mgr = manager(&tmp, state.clone());
        let name = segment_file_name(1, ts(2024, 1, 1, 0, 0));
        let path = touch(mgr.output_dir(), &name);

        state.start_recording(&path.to_string_lossy());
        let err = mgr.archive(&name).unwrap_err();
        assert!(matches!(err, CentinelaError::ArchiveConflict(_)));
        assert!(path.exists());

        // tras finalizar el segmento, la misma llamada funciona
        state.stop_recording(&path.to_string_lossy());
        assert!(mgr.archive(&name).is_ok());
    }

    #[test]
    fn manual_delete_bypasses_age_but_not_active_writers() {
        let tmp = TempDir::new().unwrap();
        let state = RecordingState::new();
        let mgr = manager(&tmp, state.clone());
        let name = segment_file_name(1, ts(2099, 1, 1, 0, 0));
        let path = touch(mgr.output_dir(), &name);

        state.start_recording(&path.to_string_lossy());
        assert!(matches!(
            mgr.delete(&name),
            Err(CentinelaError::ArchiveConflict(_))
        ));
        state.stop_recording(&path.to_string_lossy());
        mgr.delete(&name).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rejects_traversal_names() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp, RecordingState::new());
        assert!(mgr.archive("../etc/passwd").is_err());
        assert!(mgr.delete("a/b.mp4").is_err());
    }
}
