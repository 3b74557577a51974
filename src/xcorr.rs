//! Cross-correlation differential-time cache.
//!
//! The signal-processing side of the system measures, for a pair of events
//! recorded at a common station/phase, the waveform lag and correlation
//! coefficient. This module only stores those results and hands them to the
//! relocator; no correlation is computed here.
//!
//! Entries are keyed by the canonical pair ordering `(min(ev1, ev2),
//! max(ev1, ev2))`; the lag changes sign when the caller's event order is
//! swapped relative to the stored one.

use std::collections::HashMap;

use ahash::RandomState;

use crate::catalog::PhaseType;
use crate::constants::{EventId, Seconds, StationId};

/// One measured lag: positive means the first event's phase arrives late
/// relative to the second, after alignment on the predicted arrivals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XcorrEntry {
    pub lag: Seconds,
    pub coefficient: f64,
}

type Key = (EventId, EventId, StationId, PhaseType);

/// Lag/coefficient pairs produced by the waveform cross-correlation stage.
#[derive(Debug, Clone, Default)]
pub struct XcorrCache {
    entries: HashMap<Key, XcorrEntry, RandomState>,
}

impl XcorrCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a measurement for `(ev1, ev2)` at `(station, phase)`.
    ///
    /// The entry is canonicalized on the ordered event pair; inserting the
    /// swapped pair with a negated lag is the same measurement. A repeated
    /// insert overwrites.
    pub fn insert(
        &mut self,
        ev1: EventId,
        ev2: EventId,
        station: &str,
        phase: PhaseType,
        lag: Seconds,
        coefficient: f64,
    ) {
        let (key, lag) = canonical(ev1, ev2, station, phase, lag);
        self.entries.insert(key, XcorrEntry { lag, coefficient });
    }

    /// The measurement for `(ev1, ev2)`, with the lag oriented to that order.
    pub fn get(
        &self,
        ev1: EventId,
        ev2: EventId,
        station: &str,
        phase: PhaseType,
    ) -> Option<XcorrEntry> {
        let (key, _) = canonical(ev1, ev2, station, phase, 0.0);
        self.entries.get(&key).map(|e| {
            if ev1 <= ev2 {
                *e
            } else {
                XcorrEntry {
                    lag: -e.lag,
                    coefficient: e.coefficient,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn canonical(
    ev1: EventId,
    ev2: EventId,
    station: &str,
    phase: PhaseType,
    lag: Seconds,
) -> (Key, Seconds) {
    if ev1 <= ev2 {
        ((ev1, ev2, station.to_string(), phase), lag)
    } else {
        ((ev2, ev1, station.to_string(), phase), -lag)
    }
}
