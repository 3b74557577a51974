//! # Neighbour selection
//!
//! For every event to relocate, pick the subset of catalog events that makes
//! a well-conditioned double-difference subsystem: nearby, sharing enough
//! well-weighted picks at common stations, and spread homogeneously around
//! the target instead of clumped on its densest side.
//!
//! Spatial homogeneity follows the scheme of Waldhauser (2009): candidates
//! are binned into nested ellipsoidal shells centred on the target (the
//! innermost one a full ellipsoid, each next one a layer of doubled size),
//! and each shell is split into its 8 signed octants. Selection then
//! round-robins across the bins, always taking the best-connected candidate
//! a bin still holds, so no azimuth or depth range can monopolize the
//! neighbour budget.

use std::collections::{BTreeSet, HashMap};

use ahash::RandomState;
use ordered_float::NotNan;
use smallvec::SmallVec;

use crate::catalog::{Catalog, PhaseType};
use crate::constants::{EventId, Kilometer, StationId};
use crate::errors::DdError;
use crate::geodesy::{self, Origin};

/// Tuning of the neighbour selection.
///
/// Distances are kilometers; `-1.0` disables a bound, matching the catalog
/// conventions of the surrounding tooling. Weights refer to the a-priori
/// pick weight in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ClusteringOptions {
    /// Minimum pick weight for a phase to participate.
    pub min_weight: f64,
    /// Minimum ratio of epicentral station distance to 3-D inter-event
    /// distance.
    pub min_es_to_ie_ratio: f64,
    /// Minimum epicentral event-station distance.
    pub min_es_dist: Kilometer,
    /// Maximum epicentral event-station distance (-1 disables).
    pub max_es_dist: Kilometer,
    /// Fewer surviving neighbours than this marks the event as unrelocatable.
    pub min_num_neigh: usize,
    /// Neighbour budget. 0 means "no cap" in nearest-first mode and "one
    /// round-robin round" in ellipsoid mode.
    pub max_num_neigh: usize,
    /// Minimum differential times (P+S) an event pair must share.
    pub min_dt_per_evt: usize,
    /// Keep only this many highest-weighted differential times per pair
    /// (0 disables).
    pub max_dt_per_evt: usize,
    /// Number of concentric ellipsoidal shells; 0 selects nearest-first.
    pub num_ellipsoids: usize,
    /// Semi-major axis of the outermost shell.
    pub max_ellipsoid_size: Kilometer,
    /// Vertical semi-axis as a fraction of the horizontal one.
    pub ellipsoid_vertical_ratio: f64,
    /// Maximum epicentral event-station distance for cross-correlation
    /// observations (-1 disables).
    pub xcorr_max_ev_sta_dist: Kilometer,
    /// Maximum inter-event distance for a candidate pair (-1 disables).
    pub xcorr_max_inter_ev_dist: Kilometer,
}

impl Default for ClusteringOptions {
    fn default() -> Self {
        ClusteringOptions {
            min_weight: 0.0,
            min_es_to_ie_ratio: 0.0,
            min_es_dist: 0.0,
            max_es_dist: -1.0,
            min_num_neigh: 1,
            max_num_neigh: 0,
            min_dt_per_evt: 1,
            max_dt_per_evt: 0,
            num_ellipsoids: 5,
            max_ellipsoid_size: 10.0,
            ellipsoid_vertical_ratio: 0.5,
            xcorr_max_ev_sta_dist: -1.0,
            xcorr_max_inter_ev_dist: -1.0,
        }
    }
}

impl ClusteringOptions {
    pub fn builder() -> ClusteringOptionsBuilder {
        ClusteringOptionsBuilder::default()
    }
}

/// Builder with validation for [`ClusteringOptions`].
#[derive(Debug, Clone, Default)]
pub struct ClusteringOptionsBuilder {
    opts: ClusteringOptions,
}

impl ClusteringOptionsBuilder {
    pub fn min_weight(mut self, v: f64) -> Self {
        self.opts.min_weight = v;
        self
    }

    pub fn min_es_to_ie_ratio(mut self, v: f64) -> Self {
        self.opts.min_es_to_ie_ratio = v;
        self
    }

    pub fn min_es_dist(mut self, v: Kilometer) -> Self {
        self.opts.min_es_dist = v;
        self
    }

    pub fn max_es_dist(mut self, v: Kilometer) -> Self {
        self.opts.max_es_dist = v;
        self
    }

    pub fn min_num_neigh(mut self, v: usize) -> Self {
        self.opts.min_num_neigh = v;
        self
    }

    pub fn max_num_neigh(mut self, v: usize) -> Self {
        self.opts.max_num_neigh = v;
        self
    }

    pub fn min_dt_per_evt(mut self, v: usize) -> Self {
        self.opts.min_dt_per_evt = v;
        self
    }

    pub fn max_dt_per_evt(mut self, v: usize) -> Self {
        self.opts.max_dt_per_evt = v;
        self
    }

    pub fn num_ellipsoids(mut self, v: usize) -> Self {
        self.opts.num_ellipsoids = v;
        self
    }

    pub fn max_ellipsoid_size(mut self, v: Kilometer) -> Self {
        self.opts.max_ellipsoid_size = v;
        self
    }

    pub fn ellipsoid_vertical_ratio(mut self, v: f64) -> Self {
        self.opts.ellipsoid_vertical_ratio = v;
        self
    }

    pub fn xcorr_max_ev_sta_dist(mut self, v: Kilometer) -> Self {
        self.opts.xcorr_max_ev_sta_dist = v;
        self
    }

    pub fn xcorr_max_inter_ev_dist(mut self, v: Kilometer) -> Self {
        self.opts.xcorr_max_inter_ev_dist = v;
        self
    }

    pub fn build(self) -> Result<ClusteringOptions, DdError> {
        let o = &self.opts;
        if !(0.0..=1.0).contains(&o.min_weight) {
            return Err(DdError::InvalidInput(format!(
                "min_weight must be within [0, 1], got {}",
                o.min_weight
            )));
        }
        if o.min_es_to_ie_ratio < 0.0 || !o.min_es_to_ie_ratio.is_finite() {
            return Err(DdError::InvalidInput(
                "min_es_to_ie_ratio must be a finite non-negative value".into(),
            ));
        }
        if o.min_es_dist < 0.0 {
            return Err(DdError::InvalidInput(
                "min_es_dist must be non-negative".into(),
            ));
        }
        if o.min_num_neigh == 0 {
            return Err(DdError::InvalidInput(
                "min_num_neigh must be at least 1".into(),
            ));
        }
        if o.min_dt_per_evt == 0 {
            return Err(DdError::InvalidInput(
                "min_dt_per_evt must be at least 1".into(),
            ));
        }
        if o.num_ellipsoids > 0
            && (!o.max_ellipsoid_size.is_finite() || o.max_ellipsoid_size <= 0.0)
        {
            return Err(DdError::InvalidInput(
                "max_ellipsoid_size must be positive when ellipsoids are enabled".into(),
            ));
        }
        if !o.ellipsoid_vertical_ratio.is_finite() || o.ellipsoid_vertical_ratio <= 0.0 {
            return Err(DdError::InvalidInput(
                "ellipsoid_vertical_ratio must be positive".into(),
            ));
        }
        Ok(self.opts)
    }
}

/// Per-neighbour list of `(station, phase)` pairings that passed filtering.
type MatchedPhases = HashMap<StationId, SmallVec<[PhaseType; 2]>, RandomState>;

/// The neighbour set of one target event.
#[derive(Debug, Clone)]
pub struct Neighbours {
    pub ref_event: EventId,
    /// Selected neighbour ids, ordered for deterministic iteration.
    pub ids: BTreeSet<EventId>,
    phases: HashMap<EventId, MatchedPhases, RandomState>,
}

impl Neighbours {
    pub fn contains(&self, event: EventId) -> bool {
        self.ids.contains(&event)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The vetted `(station, phase)` pairings shared with `neighbour`, in a
    /// deterministic order.
    pub fn matched_phases(&self, neighbour: EventId) -> Vec<(&str, PhaseType)> {
        let Some(by_station) = self.phases.get(&neighbour) else {
            return Vec::new();
        };
        let mut out: Vec<(&str, PhaseType)> = by_station
            .iter()
            .flat_map(|(sta, phases)| phases.iter().map(move |&ph| (sta.as_str(), ph)))
            .collect();
        out.sort_unstable();
        out
    }
}

/// A filtered candidate, carrying what the spatial sampler sorts on.
struct Candidate {
    id: EventId,
    ie_dist: NotNan<f64>,
    n_obs: usize,
    local: nalgebra::Vector3<f64>,
    phases: MatchedPhases,
}

/// Select up to `max_num_neigh` neighbours for `target`.
///
/// Candidates must share at least `min_dt_per_evt` differential times with
/// the target after the weight/distance/ratio filters; the survivors are
/// sampled over ellipsoid quadrants (or nearest-first when
/// `num_ellipsoids == 0`). Too few survivors yield
/// [`DdError::InsufficientNeighbours`], which the driver records and skips.
pub fn select_neighbours(
    catalog: &Catalog,
    target: EventId,
    opts: &ClusteringOptions,
) -> Result<Neighbours, DdError> {
    let target_ev = catalog
        .event(target)
        .ok_or_else(|| DdError::InvalidInput(format!("unknown event id {target}")))?;
    let frame = Origin {
        latitude: target_ev.latitude,
        longitude: target_ev.longitude,
        depth: target_ev.depth,
    };

    let mut candidates: Vec<Candidate> = Vec::new();
    for id in catalog.event_ids_sorted() {
        if id == target {
            continue;
        }
        let cand_ev = catalog.event(id).expect("sorted ids come from the catalog");

        let ie_dist = geodesy::distance_3d(
            target_ev.latitude,
            target_ev.longitude,
            target_ev.depth,
            cand_ev.latitude,
            cand_ev.longitude,
            cand_ev.depth,
        );
        if opts.xcorr_max_inter_ev_dist >= 0.0 && ie_dist > opts.xcorr_max_inter_ev_dist {
            continue;
        }

        // match (station, phase) pairs present on both events
        let mut matched: Vec<(&str, PhaseType, f64)> = Vec::new();
        for ph_t in catalog.phases_of(target) {
            let w_t = ph_t.a_priori_weight();
            if w_t < opts.min_weight {
                continue;
            }
            let Some(ph_c) = catalog.phase(id, &ph_t.station_id, ph_t.phase_type) else {
                continue;
            };
            let w_c = ph_c.a_priori_weight();
            if w_c < opts.min_weight {
                continue;
            }
            let Some(station) = catalog.station(&ph_t.station_id) else {
                continue;
            };

            // the station bounds and the ratio are epicentral quantities
            let es_dist = geodesy::distance_2d(
                target_ev.latitude,
                target_ev.longitude,
                station.latitude,
                station.longitude,
            );
            if es_dist < opts.min_es_dist {
                continue;
            }
            if opts.max_es_dist >= 0.0 && es_dist > opts.max_es_dist {
                continue;
            }
            if opts.min_es_to_ie_ratio > 0.0
                && ie_dist > 0.0
                && es_dist / ie_dist < opts.min_es_to_ie_ratio
            {
                continue;
            }
            matched.push((ph_t.station_id.as_str(), ph_t.phase_type, 0.5 * (w_t + w_c)));
        }

        if matched.len() < opts.min_dt_per_evt {
            continue;
        }
        if opts.max_dt_per_evt > 0 && matched.len() > opts.max_dt_per_evt {
            // keep the highest-weighted pairings, ties broken by identity
            matched.sort_unstable_by(|a, b| {
                b.2.partial_cmp(&a.2)
                    .expect("pick weights are finite")
                    .then_with(|| a.0.cmp(&b.0))
                    .then_with(|| a.1.cmp(&b.1))
            });
            matched.truncate(opts.max_dt_per_evt);
        }

        let mut phases: MatchedPhases = HashMap::default();
        for &(sta, ph, _) in &matched {
            phases.entry(sta.to_string()).or_default().push(ph);
        }

        candidates.push(Candidate {
            id,
            ie_dist: NotNan::new(ie_dist)
                .map_err(|_| DdError::InvalidInput(format!("NaN distance to event {id}")))?,
            n_obs: matched.len(),
            local: geodesy::project(cand_ev.latitude, cand_ev.longitude, cand_ev.depth, &frame),
            phases,
        });
    }

    let selected = if opts.num_ellipsoids == 0 {
        candidates.sort_unstable_by(|a, b| a.ie_dist.cmp(&b.ie_dist).then(a.id.cmp(&b.id)));
        if opts.max_num_neigh > 0 {
            candidates.truncate(opts.max_num_neigh);
        }
        candidates
    } else {
        sample_ellipsoid_quadrants(candidates, opts)
    };

    if selected.len() < opts.min_num_neigh {
        return Err(DdError::InsufficientNeighbours {
            event: target,
            selected: selected.len(),
            required: opts.min_num_neigh,
        });
    }

    let mut ids = BTreeSet::new();
    let mut phases: HashMap<EventId, MatchedPhases, RandomState> = HashMap::default();
    for cand in selected {
        ids.insert(cand.id);
        phases.insert(cand.id, cand.phases);
    }
    Ok(Neighbours {
        ref_event: target,
        ids,
        phases,
    })
}

/// Bin candidates into `num_ellipsoids` shells × 8 octants and round-robin
/// across the bins, best-connected candidate first.
fn sample_ellipsoid_quadrants(
    candidates: Vec<Candidate>,
    opts: &ClusteringOptions,
) -> Vec<Candidate> {
    let n_shells = opts.num_ellipsoids;

    // semi-major axes halve inward: the outermost shell has the full size
    let axes: Vec<f64> = (0..n_shells)
        .map(|i| opts.max_ellipsoid_size / f64::powi(2.0, (n_shells - 1 - i) as i32))
        .collect();

    let inside = |local: &nalgebra::Vector3<f64>, a: f64| -> bool {
        let c = a * opts.ellipsoid_vertical_ratio;
        let (x, y, z) = (local.x / a, local.y / a, local.z / c);
        x * x + y * y + z * z <= 1.0
    };

    let mut bins: Vec<Vec<Candidate>> = (0..n_shells * 8).map(|_| Vec::new()).collect();
    for cand in candidates {
        // first shell the candidate fits in; beyond the outermost it is
        // outside the sampling volume
        let Some(shell) = axes.iter().position(|&a| inside(&cand.local, a)) else {
            continue;
        };
        let octant = usize::from(cand.local.x >= 0.0)
            | usize::from(cand.local.y >= 0.0) << 1
            | usize::from(cand.local.z >= 0.0) << 2;
        bins[shell * 8 + octant].push(cand);
    }

    for bin in &mut bins {
        bin.sort_unstable_by(|a, b| {
            b.n_obs
                .cmp(&a.n_obs)
                .then(a.ie_dist.cmp(&b.ie_dist))
                .then(a.id.cmp(&b.id))
        });
        // picked back-to-front
        bin.reverse();
    }

    let mut selected = Vec::new();
    loop {
        let mut picked_any = false;
        for bin in &mut bins {
            if let Some(cand) = bin.pop() {
                selected.push(cand);
                picked_any = true;
                if opts.max_num_neigh > 0 && selected.len() >= opts.max_num_neigh {
                    return selected;
                }
            }
        }
        // with no budget, a single round takes at most one per bin
        if opts.max_num_neigh == 0 || !picked_any {
            return selected;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use hifitime::Epoch;

    use super::*;
    use crate::catalog::{EvalMode, Event, Phase, Station};
    use crate::constants::KM_PER_DEG;

    fn epoch() -> Epoch {
        Epoch::from_str("2021-06-01T12:00:00 UTC").unwrap()
    }

    fn build_event(id: EventId, lat: f64, lon: f64, depth: f64) -> Event {
        Event {
            id,
            time: epoch(),
            latitude: lat,
            longitude: lon,
            depth,
            magnitude: 1.0,
            horizontal_err: 0.0,
            vertical_err: 0.0,
            rms: 0.0,
        }
    }

    fn build_station(id: &str, lat: f64, lon: f64) -> Station {
        Station {
            id: id.to_string(),
            latitude: lat,
            longitude: lon,
            elevation: 0.0,
            network: "XX".into(),
            station: id.to_string(),
            location: "".into(),
        }
    }

    fn build_phase(event_id: EventId, station_id: &str, unc: f64) -> Phase {
        Phase {
            event_id,
            station_id: station_id.to_string(),
            time: epoch(),
            lower_uncertainty: unc,
            upper_uncertainty: unc,
            phase_type: PhaseType::P,
            eval_mode: EvalMode::Manual,
            network: "XX".into(),
            station: station_id.into(),
            location: "".into(),
            channel: "HHZ".into(),
        }
    }

    /// A target at the origin, stations far away, and candidates placed on a
    /// small ring plus one offset in depth.
    fn ring_catalog() -> Catalog {
        let mut cat = Catalog::new();
        cat.add_event(build_event(0, 0.0, 0.0, 10.0)).unwrap();
        let ring = [
            (1, 0.01, 0.01),
            (2, 0.01, -0.01),
            (3, -0.01, 0.01),
            (4, -0.01, -0.01),
        ];
        for &(id, dlat, dlon) in &ring {
            cat.add_event(build_event(id, dlat, dlon, 10.0)).unwrap();
        }
        cat.add_event(build_event(5, 0.0, 0.0, 11.5)).unwrap();

        for (i, &(slat, slon)) in [(0.5, 0.0), (-0.5, 0.0), (0.0, 0.5), (0.0, -0.5)]
            .iter()
            .enumerate()
        {
            cat.add_station(build_station(&format!("XX.S{i}."), slat, slon))
                .unwrap();
        }
        for ev in 0..=5 {
            for i in 0..4 {
                cat.add_phase(build_phase(ev, &format!("XX.S{i}."), 0.02))
                    .unwrap();
            }
        }
        cat
    }

    #[test]
    fn nearest_first_mode_orders_by_distance() {
        let cat = ring_catalog();
        let opts = ClusteringOptions::builder()
            .num_ellipsoids(0)
            .max_num_neigh(3)
            .build()
            .unwrap();

        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        assert_eq!(neigh.len(), 3);
        // the ring events (~1.6 km) beat the deep one (1.5 km)? The depth
        // offset is 1.5 km, the ring offset ~1.57 km: event 5 is nearest.
        assert!(neigh.contains(5));
    }

    #[test]
    fn quadrant_sampling_spreads_across_octants() {
        let cat = ring_catalog();
        let opts = ClusteringOptions::builder()
            .num_ellipsoids(3)
            .max_ellipsoid_size(5.0)
            .max_num_neigh(4)
            .build()
            .unwrap();

        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        // the four ring events sit in four distinct octants; the budget of 4
        // cannot be spent twice in the same octant
        assert_eq!(neigh.len(), 4);
        let ring_hits = [1u32, 2, 3, 4]
            .iter()
            .filter(|&&id| neigh.contains(id))
            .count();
        assert!(ring_hits >= 3, "ring coverage was {ring_hits}");
    }

    #[test]
    fn zero_budget_takes_one_per_quadrant() {
        let cat = ring_catalog();
        let opts = ClusteringOptions::builder()
            .num_ellipsoids(2)
            .max_ellipsoid_size(5.0)
            .max_num_neigh(0)
            .build()
            .unwrap();

        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        // 5 candidates spread over at most 5 distinct non-empty bins; one
        // round picks each bin at most once
        assert!(neigh.len() <= 2 * 8);
        assert!(!neigh.is_empty());
    }

    #[test]
    fn too_few_matches_is_insufficient() {
        let cat = ring_catalog();
        let opts = ClusteringOptions::builder()
            .min_dt_per_evt(10)
            .build()
            .unwrap();

        match select_neighbours(&cat, 0, &opts) {
            Err(DdError::InsufficientNeighbours {
                event, selected, ..
            }) => {
                assert_eq!(event, 0);
                assert_eq!(selected, 0);
            }
            other => panic!("expected InsufficientNeighbours, got {other:?}"),
        }
    }

    /// Deep events make the epicentral and hypocentral station distances
    /// diverge: the station gates and the ES/IE ratio use the epicentral one.
    #[test]
    fn station_gates_are_epicentral_for_deep_events() {
        let mut cat = Catalog::new();
        cat.add_event(build_event(0, 0.0, 0.0, 30.0)).unwrap();
        cat.add_event(build_event(1, 0.5 / KM_PER_DEG, 0.0, 30.0))
            .unwrap();
        // 5 km and 60 km from the epicenter; ~30.4 km and ~67 km from the
        // hypocenter
        cat.add_station(build_station("XX.NEAR.", 5.0 / KM_PER_DEG, 0.0))
            .unwrap();
        cat.add_station(build_station("XX.FARR.", 60.0 / KM_PER_DEG, 0.0))
            .unwrap();
        for ev in 0..=1 {
            cat.add_phase(build_phase(ev, "XX.NEAR.", 0.02)).unwrap();
            cat.add_phase(build_phase(ev, "XX.FARR.", 0.02)).unwrap();
        }

        // a 10 km cap keeps the 5 km station; measured to the hypocenter
        // both stations would fail and the selection would come up empty
        let opts = ClusteringOptions::builder()
            .num_ellipsoids(0)
            .max_es_dist(10.0)
            .build()
            .unwrap();
        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        assert_eq!(neigh.matched_phases(1), vec![("XX.NEAR.", PhaseType::P)]);

        // the ratio numerator is epicentral too: 5 / 0.5 = 10 fails a cutoff
        // of 30 while 60 / 0.5 passes; the hypocentral ~30.4 / 0.5 would let
        // the near station survive
        let opts = ClusteringOptions::builder()
            .num_ellipsoids(0)
            .min_es_to_ie_ratio(30.0)
            .build()
            .unwrap();
        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        assert_eq!(neigh.matched_phases(1), vec![("XX.FARR.", PhaseType::P)]);
    }

    #[test]
    fn weight_filter_drops_poor_picks() {
        let mut cat = ring_catalog();
        // event 6 only has low-quality picks
        cat.add_event(build_event(6, 0.005, 0.0, 10.0)).unwrap();
        for i in 0..4 {
            cat.add_phase(build_phase(6, &format!("XX.S{i}."), 1.0))
                .unwrap();
        }
        let opts = ClusteringOptions::builder()
            .min_weight(0.5)
            .num_ellipsoids(0)
            .build()
            .unwrap();

        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        assert!(!neigh.contains(6));
        assert!(neigh.contains(1));
    }

    #[test]
    fn matched_phases_are_deterministic() {
        let cat = ring_catalog();
        let opts = ClusteringOptions::default();
        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        let phases = neigh.matched_phases(1);
        assert_eq!(phases.len(), 4);
        let mut sorted = phases.clone();
        sorted.sort_unstable();
        assert_eq!(phases, sorted);
    }

    #[test]
    fn inter_event_distance_bound_applies() {
        let cat = ring_catalog();
        // ring events are ~1.57 km away horizontally, event 5 is 1.5 km deep
        let opts = ClusteringOptions::builder()
            .xcorr_max_inter_ev_dist(1.51)
            .num_ellipsoids(0)
            .build()
            .unwrap();
        let neigh = select_neighbours(&cat, 0, &opts).unwrap();
        assert_eq!(neigh.len(), 1);
        assert!(neigh.contains(5));

        // sanity on the geometry the test relies on
        assert!(KM_PER_DEG * 0.01 * std::f64::consts::SQRT_2 > 1.51);
    }
}
