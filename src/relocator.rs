//! # Relocation driver
//!
//! The outer loop of the double-difference inversion. Each iteration rebuilds
//! the linearization around the current hypocenters:
//!
//! 1. ask the travel-time adapter for times and takeoff geometry of every
//!    `(event, station, phase)` referenced by some observation,
//! 2. assemble the event-pair rows (catalog differential times, plus
//!    cross-correlation lags where available),
//! 3. run LSQR/LSMR with the scheduled damping and residual down-weighting,
//! 4. fold the solution back into latitude/longitude/depth/origin-time
//!    updates.
//!
//! Neighbour sets are selected once, on the starting locations. The loop
//! stops on the iteration budget, on convergence (largest location update
//! below one meter), on a singular system, or when the caller's cancel
//! closure fires. Per-event and per-observation problems never abort the
//! run; they are collected into the [`RelocationReport`] returned alongside
//! the updated catalog.

use std::collections::{BTreeSet, HashMap};

use ahash::RandomState;
use hifitime::Duration;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, PhaseType};
use crate::clustering::{self, ClusteringOptions, Neighbours};
use crate::constants::{EventId, Seconds, StationId, KM_PER_DEG};
use crate::errors::DdError;
use crate::geodesy;
use crate::solver::{EventDeltas, Solver, StopReason};
use crate::ttt::TravelTimeTable;
use crate::xcorr::XcorrCache;

pub use crate::solver::SolverType;

/// Largest per-iteration location update, in km, below which the outer loop
/// is considered converged (1 m).
const CONVERGENCE_SHIFT_KM: f64 = 1e-3;

/// Tuning of the solve stage.
///
/// The damping factor and the residual down-weighting strength are linearly
/// interpolated from their `_start` to their `_end` value across the outer
/// iterations; down-weighting only engages from the second iteration, once
/// residuals reflect the relocated geometry.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub solver: SolverType,
    /// Scale every column of the system to unit L2 norm before solving.
    pub l2_normalization: bool,
    /// Inner (kernel) iteration cap; 0 auto-picks `4·n`.
    pub solver_iterations: usize,
    /// Outer iteration cap.
    pub algo_iterations: usize,
    /// Append per-event rows pinning the origin-time corrections to zero.
    pub tt_constraint: bool,
    pub damping_factor_start: f64,
    pub damping_factor_end: f64,
    pub down_weighting_by_residual_start: f64,
    pub down_weighting_by_residual_end: f64,
    /// A-priori weight multiplier of catalog travel-time-difference rows.
    pub abs_tt_diff_obs_weight: f64,
    /// A-priori weight multiplier of cross-correlation rows.
    pub xcorr_obs_weight: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            solver: SolverType::Lsmr,
            l2_normalization: true,
            solver_iterations: 0,
            algo_iterations: 20,
            tt_constraint: true,
            damping_factor_start: 0.0,
            damping_factor_end: 0.0,
            down_weighting_by_residual_start: 0.0,
            down_weighting_by_residual_end: 0.0,
            abs_tt_diff_obs_weight: 1.0,
            xcorr_obs_weight: 1.0,
        }
    }
}

impl SolverOptions {
    pub fn builder() -> SolverOptionsBuilder {
        SolverOptionsBuilder::default()
    }
}

/// Builder with validation for [`SolverOptions`].
#[derive(Debug, Clone, Default)]
pub struct SolverOptionsBuilder {
    opts: SolverOptions,
}

impl SolverOptionsBuilder {
    pub fn solver(mut self, v: SolverType) -> Self {
        self.opts.solver = v;
        self
    }

    pub fn l2_normalization(mut self, v: bool) -> Self {
        self.opts.l2_normalization = v;
        self
    }

    pub fn solver_iterations(mut self, v: usize) -> Self {
        self.opts.solver_iterations = v;
        self
    }

    pub fn algo_iterations(mut self, v: usize) -> Self {
        self.opts.algo_iterations = v;
        self
    }

    pub fn tt_constraint(mut self, v: bool) -> Self {
        self.opts.tt_constraint = v;
        self
    }

    pub fn damping_factor(mut self, start: f64, end: f64) -> Self {
        self.opts.damping_factor_start = start;
        self.opts.damping_factor_end = end;
        self
    }

    pub fn down_weighting_by_residual(mut self, start: f64, end: f64) -> Self {
        self.opts.down_weighting_by_residual_start = start;
        self.opts.down_weighting_by_residual_end = end;
        self
    }

    pub fn abs_tt_diff_obs_weight(mut self, v: f64) -> Self {
        self.opts.abs_tt_diff_obs_weight = v;
        self
    }

    pub fn xcorr_obs_weight(mut self, v: f64) -> Self {
        self.opts.xcorr_obs_weight = v;
        self
    }

    pub fn build(self) -> Result<SolverOptions, DdError> {
        let o = &self.opts;
        if o.algo_iterations == 0 {
            return Err(DdError::InvalidInput(
                "algo_iterations must be at least 1".into(),
            ));
        }
        for (name, v) in [
            ("damping_factor_start", o.damping_factor_start),
            ("damping_factor_end", o.damping_factor_end),
            ("abs_tt_diff_obs_weight", o.abs_tt_diff_obs_weight),
            ("xcorr_obs_weight", o.xcorr_obs_weight),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(DdError::InvalidInput(format!(
                    "{name} must be finite and non-negative, got {v}"
                )));
            }
        }
        for (name, v) in [
            (
                "down_weighting_by_residual_start",
                o.down_weighting_by_residual_start,
            ),
            (
                "down_weighting_by_residual_end",
                o.down_weighting_by_residual_end,
            ),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(DdError::InvalidInput(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
        }
        Ok(self.opts)
    }
}

/// An event the driver could not relocate, with the reason.
#[derive(Debug)]
pub struct SkippedEvent {
    pub event: EventId,
    pub reason: DdError,
}

/// Statistics of one outer iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationStats {
    pub iteration: usize,
    pub damping: f64,
    pub residual_down_weight: f64,
    pub rows: usize,
    pub solver_iterations: usize,
    pub stop: StopReason,
    /// RMS of the double-difference residuals after the solve, seconds.
    pub residual_rms: Seconds,
}

/// Everything the driver has to say besides the updated catalog.
#[derive(Debug, Default)]
pub struct RelocationReport {
    /// Events that received a correction.
    pub relocated: usize,
    /// Events skipped before the inversion, with reasons.
    pub skipped: Vec<SkippedEvent>,
    /// Observation rows dropped for lack of travel times, summed over
    /// iterations.
    pub missing_travel_times: usize,
    pub iterations: Vec<IterationStats>,
    /// Cumulative corrections per event.
    pub deltas: HashMap<EventId, EventDeltas, RandomState>,
    /// Double-difference residuals of the last solve, seconds.
    pub final_residuals: Vec<Seconds>,
    pub converged: bool,
    pub cancelled: bool,
    /// Set when the outer loop terminated on a singular system.
    pub failure: Option<DdError>,
}

/// Relocate every event of `catalog` against its selected neighbours.
///
/// Convenience wrapper over [`relocate_with_cancel`] with free neighbours
/// and no cancellation.
pub fn relocate(
    catalog: &Catalog,
    clustering_opts: &ClusteringOptions,
    options: &SolverOptions,
    ttt: &dyn TravelTimeTable,
    xcorr: &XcorrCache,
) -> Result<(Catalog, RelocationReport), DdError> {
    relocate_with_cancel(catalog, clustering_opts, options, ttt, xcorr, false, || {
        false
    })
}

/// Full-control entry point of the double-difference relocation.
///
/// Arguments
/// ---------
/// * `catalog`: events, stations and picks to work on (not modified).
/// * `clustering_opts`: neighbour selection tuning.
/// * `options`: solve-stage tuning.
/// * `ttt`: travel-time adapter.
/// * `xcorr`: cross-correlation lags; may be empty.
/// * `keep_neighbours_fixed`: when true, only cluster targets are free
///   parameters and their neighbours stay pinned (single-event style).
/// * `should_cancel`: polled at iteration boundaries; returning true stops
///   the loop after the current iteration's bookkeeping.
///
/// Return
/// ------
/// * The relocated catalog and the run report. Only invalid input aborts
///   with an error; per-event and per-observation problems are reported.
pub fn relocate_with_cancel(
    catalog: &Catalog,
    clustering_opts: &ClusteringOptions,
    options: &SolverOptions,
    ttt: &dyn TravelTimeTable,
    xcorr: &XcorrCache,
    keep_neighbours_fixed: bool,
    mut should_cancel: impl FnMut() -> bool,
) -> Result<(Catalog, RelocationReport), DdError> {
    let mut working = catalog.clone();
    let mut report = RelocationReport::default();

    // neighbour selection on the starting locations
    let mut clusters: HashMap<EventId, Neighbours, RandomState> = HashMap::default();
    for id in catalog.event_ids_sorted() {
        match clustering::select_neighbours(catalog, id, clustering_opts) {
            Ok(neighbours) => {
                clusters.insert(id, neighbours);
            }
            Err(reason @ DdError::InsufficientNeighbours { .. }) => {
                debug!(event = id, "skipping event: {reason}");
                report.skipped.push(SkippedEvent { event: id, reason });
            }
            Err(other) => return Err(other),
        }
    }
    if clusters.is_empty() {
        warn!("no event has enough neighbours; nothing to relocate");
        return Ok((working, report));
    }

    // events allowed to move
    let mut free: BTreeSet<EventId> = clusters.keys().copied().collect();
    if !keep_neighbours_fixed {
        for neighbours in clusters.values() {
            free.extend(neighbours.ids.iter().copied());
        }
    }

    info!(
        events = catalog.num_events(),
        clustered = clusters.len(),
        free = free.len(),
        "starting double-difference relocation"
    );

    for iteration in 0..options.algo_iterations {
        if should_cancel() {
            info!(iteration, "relocation cancelled");
            report.cancelled = true;
            break;
        }

        let damping = schedule(
            options.damping_factor_start,
            options.damping_factor_end,
            iteration,
            options.algo_iterations,
        );
        // down-weighting needs residuals of an already-adjusted geometry
        let alpha = if iteration >= 1 {
            schedule(
                options.down_weighting_by_residual_start,
                options.down_weighting_by_residual_end,
                iteration,
                options.algo_iterations,
            )
        } else {
            0.0
        };

        let mut solver = Solver::new();
        let mut needed: BTreeSet<(EventId, StationId, PhaseType)> = BTreeSet::new();

        for target in clusters.keys().copied().sorted() {
            let cluster = &clusters[&target];
            let target_ev = working
                .event(target)
                .expect("clustered events exist in the catalog");

            for &neigh in &cluster.ids {
                let neigh_ev = working
                    .event(neigh)
                    .expect("neighbours exist in the catalog");

                for (sta, ph) in cluster.matched_phases(neigh) {
                    let (Some(pick_t), Some(pick_n)) =
                        (working.phase(target, sta, ph), working.phase(neigh, sta, ph))
                    else {
                        continue;
                    };

                    let diff_time = ((pick_t.time - target_ev.time)
                        - (pick_n.time - neigh_ev.time))
                        .to_seconds();
                    let weight = 0.5
                        * (pick_t.a_priori_weight() + pick_n.a_priori_weight())
                        * options.abs_tt_diff_obs_weight;
                    solver.add_observation(target, neigh, sta, ph, diff_time, weight, false)?;
                    needed.insert((target, sta.to_string(), ph));
                    needed.insert((neigh, sta.to_string(), ph));

                    if let Some(measurement) = xcorr.get(target, neigh, sta, ph) {
                        // epicentral, like the clustering station bounds
                        let in_range = if clustering_opts.xcorr_max_ev_sta_dist >= 0.0 {
                            working
                                .station(sta)
                                .map(|s| {
                                    geodesy::distance_2d(
                                        target_ev.latitude,
                                        target_ev.longitude,
                                        s.latitude,
                                        s.longitude,
                                    ) <= clustering_opts.xcorr_max_ev_sta_dist
                                })
                                .unwrap_or(false)
                        } else {
                            true
                        };
                        if in_range {
                            solver.add_observation(
                                target,
                                neigh,
                                sta,
                                ph,
                                measurement.lag,
                                measurement.coefficient * options.xcorr_obs_weight,
                                true,
                            )?;
                        }
                    }
                }
            }
        }

        // travel times and takeoff geometry around the current hypocenters
        for (ev_id, sta_id, ph) in &needed {
            let ev = working.event(*ev_id).expect("needed events exist");
            let sta = working
                .station(sta_id)
                .ok_or_else(|| DdError::InvalidInput(format!("unknown station id {sta_id}")))?;
            match ttt.compute(ev, sta, *ph) {
                Ok(tt) => {
                    let residual = working
                        .phase(*ev_id, sta_id, *ph)
                        .map(|p| (p.time - ev.time).to_seconds() - tt.time)
                        .unwrap_or(0.0);
                    solver.add_observation_params(
                        ev,
                        sta,
                        *ph,
                        free.contains(ev_id),
                        tt.time,
                        residual,
                        tt.azimuth,
                        tt.dip,
                        tt.velocity_at_src,
                    )?;
                }
                Err(DdError::MissingTravelTime { .. }) => {
                    debug!(
                        event = *ev_id,
                        station = sta_id.as_str(),
                        phase = %ph,
                        "no travel time; dropping the affected observations"
                    );
                }
                Err(other) => return Err(other),
            }
        }

        let stats = match solver.solve(
            options.solver,
            options.solver_iterations,
            options.tt_constraint,
            damping,
            alpha,
            options.l2_normalization,
        ) {
            Ok(stats) => stats,
            Err(failure @ DdError::SingularSystem(_)) => {
                warn!(iteration, "terminating: {failure}");
                report.failure = Some(failure);
                break;
            }
            Err(other) => return Err(other),
        };
        report.missing_travel_times += solver.missing_travel_times();

        if stats.stop == StopReason::ConditionLimit {
            let failure = DdError::SingularSystem(format!(
                "condition estimate {:.3e} exceeded the limit",
                stats.a_cond
            ));
            warn!(iteration, "terminating: {failure}");
            report.failure = Some(failure);
            break;
        }
        if stats.stop == StopReason::IterationCap {
            debug!(
                iteration,
                inner_iterations = stats.iterations,
                "solver hit the iteration cap; keeping the last iterate"
            );
        }

        // fold the solution back into the catalog
        let mut max_shift_km: f64 = 0.0;
        for &id in &free {
            let Some(d) = solver.event_changes(id) else {
                continue;
            };
            let ev = working.event_mut(id).expect("free events exist");
            ev.latitude += d.d_lat;
            ev.longitude += d.d_lon;
            ev.depth += d.d_depth;
            ev.time += Duration::from_seconds(d.d_time);

            let dx = d.d_lon * KM_PER_DEG * ev.latitude.to_radians().cos();
            let dy = d.d_lat * KM_PER_DEG;
            let shift = (dx * dx + dy * dy + d.d_depth * d.d_depth).sqrt();
            max_shift_km = max_shift_km.max(shift);

            let acc = report.deltas.entry(id).or_insert(EventDeltas {
                d_lat: 0.0,
                d_lon: 0.0,
                d_depth: 0.0,
                d_time: 0.0,
            });
            acc.d_lat += d.d_lat;
            acc.d_lon += d.d_lon;
            acc.d_depth += d.d_depth;
            acc.d_time += d.d_time;
        }
        for &id in &free {
            if let Some(rms) = solver.event_rms(id) {
                if let Some(ev) = working.event_mut(id) {
                    ev.rms = rms;
                }
            }
        }

        let residual_rms = rms_of(solver.row_residuals());
        report.final_residuals = solver.row_residuals().to_vec();
        report.iterations.push(IterationStats {
            iteration,
            damping,
            residual_down_weight: alpha,
            rows: solver.row_residuals().len(),
            solver_iterations: stats.iterations,
            stop: stats.stop,
            residual_rms,
        });
        debug!(
            iteration,
            rows = solver.row_residuals().len(),
            residual_rms,
            max_shift_km,
            stop = %stats.stop,
            "outer iteration done"
        );

        if max_shift_km < CONVERGENCE_SHIFT_KM {
            info!(iteration, "converged: largest update below 1 m");
            report.converged = true;
            break;
        }
    }

    report.relocated = report.deltas.len();
    info!(
        relocated = report.relocated,
        skipped = report.skipped.len(),
        converged = report.converged,
        "relocation finished"
    );
    Ok((working, report))
}

/// Linear `start → end` schedule over the outer iterations.
fn schedule(start: f64, end: f64, iteration: usize, total: usize) -> f64 {
    if total <= 1 {
        start
    } else {
        start + (end - start) * iteration as f64 / (total - 1) as f64
    }
}

fn rms_of(residuals: &[f64]) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn schedule_interpolates_linearly() {
        assert_abs_diff_eq!(schedule(1.0, 0.0, 0, 5), 1.0);
        assert_abs_diff_eq!(schedule(1.0, 0.0, 4, 5), 0.0);
        assert_abs_diff_eq!(schedule(1.0, 0.0, 2, 5), 0.5);
        // a single iteration uses the start value
        assert_abs_diff_eq!(schedule(0.3, 0.9, 0, 1), 0.3);
    }

    #[test]
    fn builder_rejects_invalid_options() {
        assert!(SolverOptions::builder().algo_iterations(0).build().is_err());
        assert!(SolverOptions::builder()
            .damping_factor(-1.0, 0.0)
            .build()
            .is_err());
        assert!(SolverOptions::builder()
            .down_weighting_by_residual(0.5, 1.5)
            .build()
            .is_err());
        assert!(SolverOptions::builder()
            .xcorr_obs_weight(f64::NAN)
            .build()
            .is_err());

        let opts = SolverOptions::builder()
            .solver(SolverType::Lsqr)
            .algo_iterations(5)
            .damping_factor(0.1, 0.01)
            .down_weighting_by_residual(0.2, 0.5)
            .build()
            .unwrap();
        assert_eq!(opts.algo_iterations, 5);
        assert_eq!(opts.solver, SolverType::Lsqr);
    }

    #[test]
    fn rms_of_handles_empty_input() {
        assert_eq!(rms_of(&[]), 0.0);
        assert_abs_diff_eq!(rms_of(&[3.0, 4.0]), (12.5f64).sqrt());
    }
}
