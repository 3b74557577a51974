//! # Double-difference system assembly and solution
//!
//! This module owns everything between "here are the matched observations of
//! an event cluster" and "here are the hypocentral corrections":
//!
//! * the **observation store**: deduplicated event-pair differential times
//!   plus the per-`(event, station, phase)` travel-time geometry,
//! * the packed [`DdSystem`] container and its matrix-free products,
//! * **robust residual reweighting** (Tukey biweight on the current double
//!   differences),
//! * the [`lsqr`]/[`lsmr`] kernels and the glue that runs them: optional
//!   origin-time constraint rows, Tikhonov damping, column normalization,
//!   and the mapping of the solution back to `(Δlat, Δlon, Δdepth, Δt)` per
//!   event.
//!
//! A [`Solver`] lives for exactly one outer relocation iteration: partial
//! derivatives depend on the current hypocenters, so the driver rebuilds the
//! store from scratch every time around.
//!
//! ## Workflow
//!
//! ```text
//! add_observation(...)          for every event-pair differential time
//! add_observation_params(...)   for every (event, station, phase) involved
//! solve(...)                    build W·G·m = W·d, run LSQR or LSMR
//! event_changes(id)             read the per-event corrections
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

use ahash::RandomState;
use nalgebra::DVector;

use crate::catalog::{Event, PhaseType, Station};
use crate::constants::{Degree, EventId, Kilometer, Seconds, StationId};
use crate::errors::DdError;
use crate::geodesy;

pub mod lsmr;
pub mod lsqr;
pub mod system;

pub use lsmr::lsmr;
pub use lsqr::lsqr;
pub use system::DdSystem;

/// Default relative tolerances handed to the kernels.
pub const DEFAULT_ATOL: f64 = 1e-8;
pub const DEFAULT_BTOL: f64 = 1e-8;
/// Default condition-number limit; DD systems beyond this are treated as
/// singular.
pub const DEFAULT_CONLIM: f64 = 1e8;

/// Which iterative kernel solves the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverType {
    Lsqr,
    #[default]
    Lsmr,
}

/// A matrix exposed only through its forward and transpose products.
pub trait LeastSquaresOperator {
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
    /// `y ← y + A·x`
    fn apply_add(&self, x: &DVector<f64>, y: &mut DVector<f64>);
    /// `x ← x + Aᵀ·y`
    fn apply_transpose_add(&self, y: &DVector<f64>, x: &mut DVector<f64>);
}

/// Why a kernel stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `b = 0`: the zero vector is the exact solution.
    ZeroRhs,
    /// `‖r‖` met the `btol`-based test: `x` solves the system.
    ResidualTolerance,
    /// `‖Aᵀr‖` met the `atol` test: `x` is a least-squares solution.
    GradientTolerance,
    /// The condition-number estimate exceeded `conlim`.
    ConditionLimit,
    /// The iteration cap was reached first; the last iterate is returned.
    IterationCap,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::ZeroRhs => "zero right-hand side",
            StopReason::ResidualTolerance => "residual tolerance reached",
            StopReason::GradientTolerance => "gradient tolerance reached",
            StopReason::ConditionLimit => "condition limit exceeded",
            StopReason::IterationCap => "iteration cap reached",
        };
        f.write_str(s)
    }
}

/// Run statistics of one kernel invocation.
#[derive(Debug, Clone, Copy)]
pub struct SolverStats {
    pub stop: StopReason,
    pub iterations: usize,
    /// The effective cap (`4·n` when the caller passed 0).
    pub iteration_cap: usize,
    pub a_norm: f64,
    pub a_cond: f64,
    pub r_norm: f64,
    pub ar_norm: f64,
    pub x_norm: f64,
}

/// Stable Givens rotation: returns `(c, s, r)` with `c·a + s·b = r`,
/// `-s·a + c·b = 0`.
pub(crate) fn sym_ortho(a: f64, b: f64) -> (f64, f64, f64) {
    if b == 0.0 {
        if a == 0.0 {
            (1.0, 0.0, 0.0)
        } else {
            (a.signum(), 0.0, a.abs())
        }
    } else if a == 0.0 {
        (0.0, b.signum(), b.abs())
    } else if b.abs() > a.abs() {
        let tau = a / b;
        let s = b.signum() / (1.0 + tau * tau).sqrt();
        (s * tau, s, b / s)
    } else {
        let tau = b / a;
        let c = a.signum() / (1.0 + tau * tau).sqrt();
        (c, c * tau, a / c)
    }
}

/// Tukey biweight row weights from the current residuals.
///
/// The cutoff is `alpha · MAD · 4.685` with
/// `MAD = 1.4826 · median(|r − median(r)|)`. `alpha = 0` disables the
/// reweighting (all weights 1). A zero MAD (at least half the residuals
/// identical) degenerates to keeping exactly the rows sitting on the median.
pub fn compute_residual_weights(residuals: &[f64], alpha: f64) -> Vec<f64> {
    if alpha <= 0.0 || residuals.is_empty() {
        return vec![1.0; residuals.len()];
    }

    let med = median_of(residuals.to_vec());
    let mad = 1.4826 * median_of(residuals.iter().map(|r| (r - med).abs()).collect());

    if mad == 0.0 {
        return residuals
            .iter()
            .map(|&r| if r == med { 1.0 } else { 0.0 })
            .collect();
    }

    let cutoff = alpha * mad * 4.685;
    residuals
        .iter()
        .map(|&r| {
            if r.abs() < cutoff {
                let t = r / cutoff;
                (1.0 - t * t).powi(2)
            } else {
                0.0
            }
        })
        .collect()
}

fn median_of(mut values: Vec<f64>) -> f64 {
    values.sort_unstable_by(f64::total_cmp);
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Assigns dense `0..n` indices to externally-keyed ids and remembers the
/// reverse mapping.
#[derive(Debug, Clone)]
struct IdToIndex<T: Eq + Hash + Clone> {
    forward: HashMap<T, usize, RandomState>,
    reverse: Vec<T>,
}

impl<T: Eq + Hash + Clone> Default for IdToIndex<T> {
    fn default() -> Self {
        Self {
            forward: HashMap::default(),
            reverse: Vec::new(),
        }
    }
}

impl<T: Eq + Hash + Clone> IdToIndex<T> {
    fn convert(&mut self, id: &T) -> usize {
        if let Some(&idx) = self.forward.get(id) {
            return idx;
        }
        let idx = self.reverse.len();
        self.forward.insert(id.clone(), idx);
        self.reverse.push(id.clone());
        idx
    }

    fn get(&self, id: &T) -> Option<usize> {
        self.forward.get(id).copied()
    }

    fn len(&self) -> usize {
        self.reverse.len()
    }
}

/// One stored event-pair differential time.
#[derive(Debug, Clone, Copy)]
struct Observation {
    ev1: usize,
    ev2: usize,
    ph_sta: usize,
    diff_time: Seconds,
    a_priori_weight: f64,
    is_xcorr: bool,
}

/// Travel-time geometry of one `(event, station, phase)`, reduced to what the
/// system needs: the travel time, the pick residual, and the partial
/// derivatives of travel time with respect to the local source coordinates.
#[derive(Debug, Clone, Copy)]
struct ObsParams {
    compute_ev_changes: bool,
    travel_time: Seconds,
    residual: Seconds,
    dx: f64,
    dy: f64,
    dz: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct EventEntry {
    latitude: Degree,
    free: bool,
}

/// Hypocentral corrections of one event after a solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventDeltas {
    pub d_lat: Degree,
    pub d_lon: Degree,
    pub d_depth: Kilometer,
    pub d_time: Seconds,
}

/// Usage statistics of one `(event, station, phase)` across a solve.
#[derive(Debug, Clone, Default)]
pub struct ObsStat {
    pub starting_tt_obs: usize,
    pub starting_cc_obs: usize,
    pub final_total_obs: usize,
    pub total_a_priori_weight: f64,
    pub total_final_weight: f64,
    pub total_abs_residual: f64,
    pub peers: BTreeSet<EventId>,
}

type ObsKey = (EventId, EventId, StationId, PhaseType, bool);

/// Observation store and solve driver for one outer iteration.
#[derive(Debug, Default)]
pub struct Solver {
    event_idx: IdToIndex<EventId>,
    ph_sta_idx: IdToIndex<(StationId, PhaseType)>,
    events: Vec<EventEntry>,
    observations: Vec<Observation>,
    seen: std::collections::HashSet<ObsKey, RandomState>,
    obs_params: HashMap<(usize, usize), ObsParams, RandomState>,
    stats: HashMap<(usize, usize), ObsStat, RandomState>,
    deltas: HashMap<usize, EventDeltas, RandomState>,
    event_sq_residuals: HashMap<usize, (f64, usize), RandomState>,
    row_residuals: Vec<f64>,
    missing_travel_times: usize,
}

impl Solver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (deduplicated) observations.
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Observation rows dropped in the last solve for lack of travel times.
    pub fn missing_travel_times(&self) -> usize {
        self.missing_travel_times
    }

    /// Store one differential-time observation between `ev1` and `ev2` at
    /// `(station, phase)`.
    ///
    /// Observations are deduplicated on the unordered event pair: adding the
    /// same pairing twice (in either order) returns `Ok(false)` and keeps
    /// the first entry. Non-finite values and self-pairs are programmer
    /// errors.
    pub fn add_observation(
        &mut self,
        ev1: EventId,
        ev2: EventId,
        station: &str,
        phase: PhaseType,
        diff_time: Seconds,
        a_priori_weight: f64,
        is_xcorr: bool,
    ) -> Result<bool, DdError> {
        if ev1 == ev2 {
            return Err(DdError::InvalidInput(format!(
                "observation pairs event {ev1} with itself"
            )));
        }
        if !diff_time.is_finite() || !a_priori_weight.is_finite() || a_priori_weight < 0.0 {
            return Err(DdError::InvalidInput(format!(
                "non-finite observation for pair ({ev1}, {ev2}) at {station}"
            )));
        }

        let key: ObsKey = (
            ev1.min(ev2),
            ev1.max(ev2),
            station.to_string(),
            phase,
            is_xcorr,
        );
        if !self.seen.insert(key) {
            return Ok(false);
        }

        let e1 = self.convert_event(ev1);
        let e2 = self.convert_event(ev2);
        let ps = self.ph_sta_idx.convert(&(station.to_string(), phase));
        self.observations.push(Observation {
            ev1: e1,
            ev2: e2,
            ph_sta: ps,
            diff_time,
            a_priori_weight,
            is_xcorr,
        });

        for (own, peer) in [(e1, ev2), (e2, ev1)] {
            let stat = self.stats.entry((own, ps)).or_default();
            if is_xcorr {
                stat.starting_cc_obs += 1;
            } else {
                stat.starting_tt_obs += 1;
            }
            stat.peers.insert(peer);
        }
        Ok(true)
    }

    /// Store the travel-time geometry of `(event, station, phase)`.
    ///
    /// `takeoff_azimuth` is degrees clockwise from north, `takeoff_dip`
    /// degrees from horizontal (positive downward); both describe the ray
    /// direction at the source. The partial derivatives are the direction
    /// cosines scaled by `-1/velocity_at_src`: moving the source along the
    /// ray shortens the travel time.
    ///
    /// With `compute_ev_changes == false` the event keeps feeding the
    /// right-hand side but is not a free parameter of the inversion.
    #[allow(clippy::too_many_arguments)]
    pub fn add_observation_params(
        &mut self,
        event: &Event,
        station: &Station,
        phase: PhaseType,
        compute_ev_changes: bool,
        travel_time: Seconds,
        residual: Seconds,
        takeoff_azimuth: Degree,
        takeoff_dip: Degree,
        velocity_at_src: f64,
    ) -> Result<(), DdError> {
        if !travel_time.is_finite()
            || !takeoff_azimuth.is_finite()
            || !takeoff_dip.is_finite()
            || !velocity_at_src.is_finite()
            || velocity_at_src <= 0.0
        {
            return Err(DdError::InvalidInput(format!(
                "non-finite travel-time entry for event {} at {}",
                event.id, station.id
            )));
        }

        let e = self.convert_event(event.id);
        self.events[e].latitude = event.latitude;
        if compute_ev_changes {
            self.events[e].free = true;
        }
        let ps = self
            .ph_sta_idx
            .convert(&(station.id.clone(), phase));

        let az = takeoff_azimuth.to_radians();
        let dip = takeoff_dip.to_radians();
        let (ray_e, ray_n, ray_d) = (
            az.sin() * dip.cos(),
            az.cos() * dip.cos(),
            dip.sin(),
        );
        self.obs_params.insert(
            (e, ps),
            ObsParams {
                compute_ev_changes,
                travel_time,
                residual,
                dx: -ray_e / velocity_at_src,
                dy: -ray_n / velocity_at_src,
                dz: -ray_d / velocity_at_src,
            },
        );
        Ok(())
    }

    /// Build the weighted system and run the selected kernel.
    ///
    /// Follows the outer driver's per-iteration recipe: rows without travel
    /// times on both sides are dropped, optional `Δt` constraint rows are
    /// appended, residual down-weighting (`alpha > 0`) multiplies into the
    /// observation-row weights only, columns are optionally normalized to
    /// unit L2 norm, and the solution is rescaled back before the per-event
    /// deltas are extracted.
    pub fn solve(
        &mut self,
        solver_type: SolverType,
        num_iterations: usize,
        use_tt_constraint: bool,
        damping_factor: f64,
        residual_down_weight: f64,
        normalize: bool,
    ) -> Result<SolverStats, DdError> {
        if !damping_factor.is_finite() || damping_factor < 0.0 {
            return Err(DdError::InvalidInput(format!(
                "invalid damping factor {damping_factor}"
            )));
        }

        // keep only rows with travel-time geometry on both sides
        let usable: Vec<usize> = (0..self.observations.len())
            .filter(|&i| {
                let obs = &self.observations[i];
                self.obs_params.contains_key(&(obs.ev1, obs.ph_sta))
                    && self.obs_params.contains_key(&(obs.ev2, obs.ph_sta))
            })
            .collect();
        self.missing_travel_times = self.observations.len() - usable.len();
        if usable.is_empty() {
            return Err(DdError::SingularSystem(
                "system has no usable observation rows".into(),
            ));
        }

        let n_evts = self.events.len();
        let n_ph_stas = self.ph_sta_idx.len();
        let n_constraints = if use_tt_constraint { n_evts } else { 0 };
        let mut dd = DdSystem::new(usable.len(), n_evts, n_ph_stas, n_constraints);

        for (row, &i) in usable.iter().enumerate() {
            let obs = self.observations[i];
            let p1 = self.obs_params[&(obs.ev1, obs.ph_sta)];
            let p2 = self.obs_params[&(obs.ev2, obs.ph_sta)];

            let d = if obs.is_xcorr {
                obs.diff_time
            } else {
                obs.diff_time - (p1.travel_time - p2.travel_time)
            };

            let e1 = self.pack_side(&mut dd, obs.ev1, obs.ph_sta, &p1);
            let e2 = self.pack_side(&mut dd, obs.ev2, obs.ph_sta, &p2);
            dd.set_obs_row(row, e1, e2, obs.ph_sta as u32, obs.a_priori_weight, d);
        }

        // soft zero-mean prior on the origin-time corrections, weighted at
        // the scale of each event's own observations
        if use_tt_constraint {
            let mut w_sum = vec![0.0f64; n_evts];
            let mut w_cnt = vec![0usize; n_evts];
            for row in 0..dd.n_obs {
                for side in 0..2 {
                    let ev = dd.ev_by_obs[side][row];
                    if ev >= 0 {
                        w_sum[ev as usize] += dd.w[row];
                        w_cnt[ev as usize] += 1;
                    }
                }
            }
            for e in 0..n_evts {
                let w = if w_cnt[e] > 0 {
                    w_sum[e] / w_cnt[e] as f64
                } else {
                    0.0
                };
                dd.set_constraint_row(e, e, w);
            }
        }

        // robust down-weighting from the current double differences
        // (m_prev = 0 in a freshly built system, so d is the residual)
        if residual_down_weight > 0.0 {
            let residuals: Vec<f64> = (0..dd.n_obs).map(|r| dd.d[r]).collect();
            let weights = compute_residual_weights(&residuals, residual_down_weight);
            for (r, w) in weights.iter().enumerate() {
                dd.w[r] *= w;
            }
        }

        if normalize {
            dd.normalize_columns();
        }

        let mut b = DVector::zeros(dd.num_rows());
        for r in 0..dd.num_rows() {
            b[r] = dd.w[r] * dd.d[r];
        }

        let (x, stats) = match solver_type {
            SolverType::Lsqr => lsqr(
                &dd,
                &b,
                damping_factor,
                DEFAULT_ATOL,
                DEFAULT_BTOL,
                DEFAULT_CONLIM,
                num_iterations,
            ),
            SolverType::Lsmr => lsmr(
                &dd,
                &b,
                damping_factor,
                DEFAULT_ATOL,
                DEFAULT_BTOL,
                DEFAULT_CONLIM,
                num_iterations,
            ),
        };

        // physical per-row residuals r = d − G·m, read off before descaling
        let mut am = DVector::zeros(dd.num_rows());
        dd.apply_add(&x, &mut am);
        self.row_residuals = (0..dd.n_obs)
            .map(|r| {
                if dd.w[r] > 0.0 {
                    (b[r] - am[r]) / dd.w[r]
                } else {
                    dd.d[r]
                }
            })
            .collect();

        dd.m = x;
        if normalize {
            dd.denormalize_solution();
        }

        self.load_solutions(&dd, &usable);
        Ok(stats)
    }

    /// The corrections of `event` from the last solve, if it was a free
    /// parameter.
    pub fn event_changes(&self, event: EventId) -> Option<EventDeltas> {
        let idx = self.event_idx.get(&event)?;
        self.deltas.get(&idx).copied()
    }

    /// RMS of the double-difference residuals touching `event` after the
    /// last solve.
    pub fn event_rms(&self, event: EventId) -> Option<f64> {
        let idx = self.event_idx.get(&event)?;
        self.event_sq_residuals
            .get(&idx)
            .map(|&(sum, n)| (sum / n as f64).sqrt())
    }

    /// Usage statistics of `(event, station, phase)` across the last solve.
    pub fn observation_stats(
        &self,
        event: EventId,
        station: &str,
        phase: PhaseType,
    ) -> Option<&ObsStat> {
        let e = self.event_idx.get(&event)?;
        let ps = self.ph_sta_idx.get(&(station.to_string(), phase))?;
        self.stats.get(&(e, ps))
    }

    /// Physical residuals of the observation rows used by the last solve.
    pub fn row_residuals(&self) -> &[f64] {
        &self.row_residuals
    }

    /// The single-event travel-time residual stored for
    /// `(event, station, phase)`, if its geometry was registered.
    pub fn travel_time_residual(
        &self,
        event: EventId,
        station: &str,
        phase: PhaseType,
    ) -> Option<Seconds> {
        let e = self.event_idx.get(&event)?;
        let ps = self.ph_sta_idx.get(&(station.to_string(), phase))?;
        self.obs_params.get(&(e, ps)).map(|p| p.residual)
    }

    fn convert_event(&mut self, id: EventId) -> usize {
        let idx = self.event_idx.convert(&id);
        if idx >= self.events.len() {
            self.events.push(EventEntry::default());
        }
        idx
    }

    fn pack_side(&self, dd: &mut DdSystem, ev: usize, ph_sta: usize, p: &ObsParams) -> i32 {
        if p.compute_ev_changes {
            dd.set_g(ev, ph_sta, p.dx, p.dy, p.dz);
            ev as i32
        } else {
            -1
        }
    }

    fn load_solutions(&mut self, dd: &DdSystem, usable: &[usize]) {
        self.deltas.clear();
        for e in 0..self.events.len() {
            if !self.events[e].free {
                continue;
            }
            let dx = dd.m[e * 4];
            let dy = dd.m[e * 4 + 1];
            let dz = dd.m[e * 4 + 2];
            let dt = dd.m[e * 4 + 3];
            let (d_lat, d_lon) = geodesy::delta_to_degrees(dx, dy, self.events[e].latitude);
            self.deltas.insert(
                e,
                EventDeltas {
                    d_lat,
                    d_lon,
                    d_depth: dz,
                    d_time: dt,
                },
            );
        }

        self.event_sq_residuals.clear();
        for (row, &i) in usable.iter().enumerate() {
            let obs = self.observations[i];
            let r = self.row_residuals[row];
            for e in [obs.ev1, obs.ev2] {
                let entry = self.event_sq_residuals.entry(e).or_insert((0.0, 0));
                entry.0 += r * r;
                entry.1 += 1;
            }
            for e in [obs.ev1, obs.ev2] {
                if let Some(stat) = self.stats.get_mut(&(e, obs.ph_sta)) {
                    stat.final_total_obs += 1;
                    stat.total_a_priori_weight += obs.a_priori_weight;
                    stat.total_final_weight += dd.w[row];
                    stat.total_abs_residual += r.abs();
                }
            }
        }
    }
}
