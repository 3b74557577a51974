//! # In-memory earthquake catalog
//!
//! The catalog is the working set of a relocation run: events (hypocenter +
//! origin time), stations, and the phase picks tying them together. It is the
//! in-memory equivalent of the `event.csv` / `station.csv` / `phase.csv`
//! interchange tables (see [`reader`] and [`writer`]).
//!
//! ## Conventions
//!
//! * Geographic coordinates are the single source of truth; local Cartesian
//!   positions are derived on demand with [`crate::geodesy::project`], so the
//!   two can never drift apart.
//! * Depth is in kilometers, positive downward. Station "depth" is
//!   `-elevation / 1000`.
//! * Event ids are stable `u32`s, station ids the `network.station.location`
//!   triplet string.
//!
//! Lookups by unknown id and inserts of non-finite coordinates are programmer
//! errors and fail fast with [`DdError::InvalidInput`].

use std::collections::HashMap;
use std::fmt;

use ahash::RandomState;
use hifitime::Epoch;

use crate::constants::{Degree, EventId, Kilometer, Meter, Seconds, StationId};
use crate::errors::DdError;
use crate::geodesy::Origin;

pub mod reader;
pub mod writer;

/// Seismic phase type carried by a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhaseType {
    P,
    S,
}

impl PhaseType {
    pub fn as_char(self) -> char {
        match self {
            PhaseType::P => 'P',
            PhaseType::S => 'S',
        }
    }

    /// Accepts the bare letter or a phase code starting with it (`Pg`, `Sx`).
    pub fn parse(code: &str) -> Option<PhaseType> {
        match code.chars().next()? {
            'P' | 'p' => Some(PhaseType::P),
            'S' | 's' => Some(PhaseType::S),
            _ => None,
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// How a pick was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Manual,
    Automatic,
    /// Synthesized from neighbouring events rather than picked on a waveform.
    Theoretical,
}

impl EvalMode {
    pub fn parse(s: &str) -> Option<EvalMode> {
        match s {
            "manual" => Some(EvalMode::Manual),
            "automatic" => Some(EvalMode::Automatic),
            "theoretical" => Some(EvalMode::Theoretical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvalMode::Manual => "manual",
            EvalMode::Automatic => "automatic",
            EvalMode::Theoretical => "theoretical",
        }
    }
}

/// One catalog event: hypocenter, origin time and quality metadata.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub time: Epoch,
    pub latitude: Degree,
    pub longitude: Degree,
    pub depth: Kilometer,
    pub magnitude: f64,
    pub horizontal_err: Kilometer,
    pub vertical_err: Kilometer,
    pub rms: Seconds,
}

/// A recording site, immutable over a relocation run.
#[derive(Debug, Clone)]
pub struct Station {
    pub id: StationId,
    pub latitude: Degree,
    pub longitude: Degree,
    pub elevation: Meter,
    pub network: String,
    pub station: String,
    pub location: String,
}

impl Station {
    /// Station depth in the positive-down convention used everywhere else.
    pub fn depth(&self) -> Kilometer {
        -self.elevation / 1000.0
    }
}

/// A phase pick associating one event with one station.
#[derive(Debug, Clone)]
pub struct Phase {
    pub event_id: EventId,
    pub station_id: StationId,
    pub time: Epoch,
    pub lower_uncertainty: Seconds,
    pub upper_uncertainty: Seconds,
    pub phase_type: PhaseType,
    pub eval_mode: EvalMode,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl Phase {
    pub fn uncertainty(&self) -> Seconds {
        0.5 * (self.lower_uncertainty + self.upper_uncertainty)
    }

    /// A-priori pick weight in `[0, 1]`, mapped from the pick uncertainty in
    /// tiers. Theoretical picks are trusted half as much as picked ones.
    pub fn a_priori_weight(&self) -> f64 {
        let unc = self.uncertainty();
        let w = if unc <= 0.025 {
            1.0
        } else if unc <= 0.050 {
            0.8
        } else if unc <= 0.100 {
            0.6
        } else if unc <= 0.200 {
            0.4
        } else if unc <= 0.400 {
            0.2
        } else {
            0.1
        };
        if self.eval_mode == EvalMode::Theoretical {
            w * 0.5
        } else {
            w
        }
    }
}

/// The full working set of a relocation run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    events: HashMap<EventId, Event, RandomState>,
    stations: HashMap<StationId, Station, RandomState>,
    phases: HashMap<EventId, Vec<Phase>, RandomState>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, event: Event) -> Result<(), DdError> {
        if !(event.latitude.is_finite() && event.longitude.is_finite() && event.depth.is_finite())
        {
            return Err(DdError::InvalidInput(format!(
                "non-finite hypocenter for event {}",
                event.id
            )));
        }
        if self.events.contains_key(&event.id) {
            return Err(DdError::InvalidInput(format!(
                "duplicate event id {}",
                event.id
            )));
        }
        self.events.insert(event.id, event);
        Ok(())
    }

    pub fn add_station(&mut self, station: Station) -> Result<(), DdError> {
        if !(station.latitude.is_finite()
            && station.longitude.is_finite()
            && station.elevation.is_finite())
        {
            return Err(DdError::InvalidInput(format!(
                "non-finite location for station {}",
                station.id
            )));
        }
        if self.stations.contains_key(&station.id) {
            return Err(DdError::InvalidInput(format!(
                "duplicate station id {}",
                station.id
            )));
        }
        self.stations.insert(station.id.clone(), station);
        Ok(())
    }

    /// Add a pick. The referenced event and station must already exist.
    pub fn add_phase(&mut self, phase: Phase) -> Result<(), DdError> {
        if !self.events.contains_key(&phase.event_id) {
            return Err(DdError::InvalidInput(format!(
                "phase references unknown event {}",
                phase.event_id
            )));
        }
        if !self.stations.contains_key(&phase.station_id) {
            return Err(DdError::InvalidInput(format!(
                "phase references unknown station {}",
                phase.station_id
            )));
        }
        self.phases.entry(phase.event_id).or_default().push(phase);
        Ok(())
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    pub(crate) fn event_mut(&mut self, id: EventId) -> Option<&mut Event> {
        self.events.get_mut(&id)
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    /// Event ids in ascending order, for deterministic iteration.
    pub fn event_ids_sorted(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.events.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn station(&self, id: &str) -> Option<&Station> {
        self.stations.get(id)
    }

    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.stations.values()
    }

    pub fn phases_of(&self, event: EventId) -> &[Phase] {
        self.phases.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The pick of `event` at `(station, phase_type)`, if any.
    pub fn phase(&self, event: EventId, station: &str, phase_type: PhaseType) -> Option<&Phase> {
        self.phases_of(event)
            .iter()
            .find(|p| p.phase_type == phase_type && p.station_id == station)
    }

    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    pub fn num_stations(&self) -> usize {
        self.stations.len()
    }

    pub fn num_phases(&self) -> usize {
        self.phases.values().map(Vec::len).sum()
    }

    /// Mean hypocenter of all events, the origin of the shared local frame.
    ///
    /// Returns `None` for an empty catalog.
    pub fn centroid(&self) -> Option<Origin> {
        if self.events.is_empty() {
            return None;
        }
        let n = self.events.len() as f64;
        let (mut lat, mut lon, mut depth) = (0.0, 0.0, 0.0);
        for ev in self.events.values() {
            lat += ev.latitude;
            lon += ev.longitude;
            depth += ev.depth;
        }
        Some(Origin {
            latitude: lat / n,
            longitude: lon / n,
            depth: depth / n,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn test_event(id: EventId) -> Event {
        Event {
            id,
            time: Epoch::from_str("2021-06-01T12:00:00 UTC").unwrap(),
            latitude: 46.5,
            longitude: 8.6,
            depth: 7.0,
            magnitude: 2.1,
            horizontal_err: 0.5,
            vertical_err: 0.9,
            rms: 0.12,
        }
    }

    fn test_station(id: &str) -> Station {
        Station {
            id: id.to_string(),
            latitude: 46.6,
            longitude: 8.5,
            elevation: 1450.0,
            network: "CH".into(),
            station: id.split('.').nth(1).unwrap_or("STA").into(),
            location: "".into(),
        }
    }

    fn test_phase(event_id: EventId, station_id: &str, unc: Seconds, mode: EvalMode) -> Phase {
        Phase {
            event_id,
            station_id: station_id.to_string(),
            time: Epoch::from_str("2021-06-01T12:00:03 UTC").unwrap(),
            lower_uncertainty: unc,
            upper_uncertainty: unc,
            phase_type: PhaseType::P,
            eval_mode: mode,
            network: "CH".into(),
            station: "STA".into(),
            location: "".into(),
            channel: "HHZ".into(),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut cat = Catalog::new();
        cat.add_event(test_event(1)).unwrap();
        assert!(matches!(
            cat.add_event(test_event(1)),
            Err(DdError::InvalidInput(_))
        ));

        cat.add_station(test_station("CH.STA.")).unwrap();
        assert!(cat.add_station(test_station("CH.STA.")).is_err());
    }

    #[test]
    fn phase_requires_known_event_and_station() {
        let mut cat = Catalog::new();
        cat.add_event(test_event(1)).unwrap();
        cat.add_station(test_station("CH.STA.")).unwrap();

        assert!(cat
            .add_phase(test_phase(2, "CH.STA.", 0.02, EvalMode::Manual))
            .is_err());
        assert!(cat
            .add_phase(test_phase(1, "CH.XXX.", 0.02, EvalMode::Manual))
            .is_err());
        assert!(cat
            .add_phase(test_phase(1, "CH.STA.", 0.02, EvalMode::Manual))
            .is_ok());
        assert!(cat.phase(1, "CH.STA.", PhaseType::P).is_some());
        assert!(cat.phase(1, "CH.STA.", PhaseType::S).is_none());
    }

    #[test]
    fn pick_weight_tiers() {
        let p = |unc, mode| test_phase(1, "CH.STA.", unc, mode).a_priori_weight();
        assert_eq!(p(0.01, EvalMode::Manual), 1.0);
        assert_eq!(p(0.05, EvalMode::Manual), 0.8);
        assert_eq!(p(0.09, EvalMode::Automatic), 0.6);
        assert_eq!(p(0.15, EvalMode::Manual), 0.4);
        assert_eq!(p(0.3, EvalMode::Manual), 0.2);
        assert_eq!(p(2.0, EvalMode::Manual), 0.1);
        // theoretical picks are halved
        assert_eq!(p(0.01, EvalMode::Theoretical), 0.5);
    }

    #[test]
    fn centroid_is_the_event_mean() {
        let mut cat = Catalog::new();
        let mut ev = test_event(1);
        ev.latitude = 46.0;
        cat.add_event(ev).unwrap();
        let mut ev = test_event(2);
        ev.latitude = 47.0;
        cat.add_event(ev).unwrap();

        let c = cat.centroid().unwrap();
        assert!((c.latitude - 46.5).abs() < 1e-12);
    }
}
