//! Ventanas de segmento alineadas al reloj de pared.
//!
//! Las fronteras son `medianoche local + k * cadencia`, así un reinicio a
//! mitad de ventana retoma la *misma* ventana lógica en vez de derivar, y
//! los segmentos de todas las cámaras quedan comparables entre sí.

use chrono::{Duration, NaiveDateTime, NaiveTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Ventana activa para el instante `now`: `start` es la última frontera
/// <= now, `end` la siguiente. Si la cadencia no divide el día, la última
/// ventana se trunca en la medianoche siguiente para re-anclar a diario.
pub fn window_at(now: NaiveDateTime, cadence: Duration) -> SegmentWindow {
    let cadence_secs = cadence.num_seconds().max(1);
    let midnight = now.date().and_time(NaiveTime::MIN);
    let elapsed_secs = (now - midnight).num_seconds();
    let periods = elapsed_secs / cadence_secs;

    let start = midnight + Duration::seconds(periods * cadence_secs);
    let next_midnight = midnight + Duration::days(1);
    let mut end = start + Duration::seconds(cadence_secs);
    if end > next_midnight {
        end = next_midnight;
    }
    SegmentWindow { start, end }
}

/// Próxima frontera estrictamente posterior a `after`.
pub fn next_boundary(after: NaiveDateTime, cadence: Duration) -> NaiveDateTime {
    window_at(after, cadence).end
}
