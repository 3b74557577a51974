//! Packed storage for one double-difference system `W·G·m = W·d`
//! (Waldhauser & Ellsworth 2000).
//!
//! `G` holds the partial derivatives of travel time with respect to the
//! hypocentral parameters, `m` the sought changes `(Δx, Δy, Δz, Δt)` per
//! event, `d` the double differences, `W` a diagonal row weight.
//!
//! A DD row touches exactly two events at one station/phase, so `G` is never
//! materialized at `rows × 4·nEvts`. One `(dx, dy, dz, 1)` 4-vector is stored
//! per distinct `(event, phSta)` pair and rows reference it through
//! `(ev_by_obs, ph_sta_by_obs)` indices. An event index of `-1` means "not a
//! free parameter": that side of the row contributes nothing.

use nalgebra::DVector;

use super::LeastSquaresOperator;

/// Sentinel for the unused station index of constraint rows.
const NO_PH_STA: u32 = u32::MAX;

/// One double-difference problem, sized at construction and owned by a single
/// solve call.
#[derive(Debug)]
pub struct DdSystem {
    pub n_obs: usize,
    pub n_evts: usize,
    pub n_ph_stas: usize,
    pub n_tt_constraints: usize,

    /// Row weights, observation rows then constraint rows.
    pub w: Vec<f64>,
    /// `(dx, dy, dz, 1)` per `(event, phSta)`, row-major on events.
    pub g: Vec<[f64; 4]>,
    /// Solution, interleaved `(Δx, Δy, Δz, Δt)` per event.
    pub m: DVector<f64>,
    /// Right-hand side: double differences, then zeros for constraints.
    pub d: DVector<f64>,
    /// Column L2 norms of the weighted system; 1 where a column is empty.
    pub l2n_scaler: Vec<f64>,
    /// Per-row event indices; `-1` drops that side.
    pub ev_by_obs: [Vec<i32>; 2],
    /// Per-row `(station, phase)` index.
    pub ph_sta_by_obs: Vec<u32>,

    /// `1 / l2n_scaler` applied inside the products when normalized.
    col_scale: Vec<f64>,
}

impl DdSystem {
    pub fn new(n_obs: usize, n_evts: usize, n_ph_stas: usize, n_tt_constraints: usize) -> Self {
        let num_rows = n_obs + n_tt_constraints;
        let num_cols = n_evts * 4;
        DdSystem {
            n_obs,
            n_evts,
            n_ph_stas,
            n_tt_constraints,
            w: vec![0.0; num_rows],
            g: vec![[0.0; 4]; n_evts * n_ph_stas],
            m: DVector::zeros(num_cols),
            d: DVector::zeros(num_rows),
            l2n_scaler: vec![1.0; num_cols],
            ev_by_obs: [vec![-1; num_rows], vec![-1; num_rows]],
            ph_sta_by_obs: vec![NO_PH_STA; num_rows],
            col_scale: vec![1.0; num_cols],
        }
    }

    pub fn num_rows(&self) -> usize {
        self.n_obs + self.n_tt_constraints
    }

    pub fn num_cols(&self) -> usize {
        self.n_evts * 4
    }

    /// Store the partial-derivative 4-vector of `(event, ph_sta)`.
    pub fn set_g(&mut self, event: usize, ph_sta: usize, dx: f64, dy: f64, dz: f64) {
        self.g[event * self.n_ph_stas + ph_sta] = [dx, dy, dz, 1.0];
    }

    /// Describe an observation row: weight, rhs and the two event sides.
    pub fn set_obs_row(&mut self, row: usize, ev1: i32, ev2: i32, ph_sta: u32, w: f64, d: f64) {
        debug_assert!(row < self.n_obs);
        self.ev_by_obs[0][row] = ev1;
        self.ev_by_obs[1][row] = ev2;
        self.ph_sta_by_obs[row] = ph_sta;
        self.w[row] = w;
        self.d[row] = d;
    }

    /// Describe the origin-time constraint row of `event`.
    pub fn set_constraint_row(&mut self, constraint: usize, event: usize, w: f64) {
        debug_assert!(constraint < self.n_tt_constraints);
        let row = self.n_obs + constraint;
        self.ev_by_obs[0][row] = event as i32;
        self.ev_by_obs[1][row] = -1;
        self.w[row] = w;
        self.d[row] = 0.0;
    }

    /// Compute the column L2 norms of the weighted system and switch the
    /// products to the normalized matrix `W·G·diag(1/‖col‖)`.
    ///
    /// Empty columns keep a scaler of 1 so the division is always defined.
    pub fn normalize_columns(&mut self) {
        let mut norms = vec![0.0f64; self.num_cols()];
        for row in 0..self.n_obs {
            let ps = self.ph_sta_by_obs[row] as usize;
            for side in 0..2 {
                let ev = self.ev_by_obs[side][row];
                if ev < 0 {
                    continue;
                }
                let e = ev as usize;
                let g = &self.g[e * self.n_ph_stas + ps];
                for k in 0..4 {
                    let a = self.w[row] * g[k];
                    norms[e * 4 + k] += a * a;
                }
            }
        }
        for c in 0..self.n_tt_constraints {
            let row = self.n_obs + c;
            let ev = self.ev_by_obs[0][row];
            if ev >= 0 {
                let a = self.w[row];
                norms[ev as usize * 4 + 3] += a * a;
            }
        }
        for c in 0..self.num_cols() {
            let norm = norms[c].sqrt();
            if norm > 0.0 {
                self.l2n_scaler[c] = norm;
                self.col_scale[c] = 1.0 / norm;
            } else {
                self.l2n_scaler[c] = 1.0;
                self.col_scale[c] = 1.0;
            }
        }
    }

    /// Map the solution of the normalized system back to physical units.
    pub fn denormalize_solution(&mut self) {
        for c in 0..self.num_cols() {
            self.m[c] *= self.col_scale[c];
        }
    }
}

impl LeastSquaresOperator for DdSystem {
    fn nrows(&self) -> usize {
        self.num_rows()
    }

    fn ncols(&self) -> usize {
        self.num_cols()
    }

    // Rows are accumulated in index order; the reduction order inside a row
    // is fixed (side 0 before side 1, k ascending) so results are bitwise
    // reproducible.
    fn apply_add(&self, x: &DVector<f64>, y: &mut DVector<f64>) {
        for row in 0..self.n_obs {
            let ps = self.ph_sta_by_obs[row] as usize;
            let mut acc = 0.0;
            for (side, sign) in [(0usize, 1.0f64), (1, -1.0)] {
                let ev = self.ev_by_obs[side][row];
                if ev < 0 {
                    continue;
                }
                let e = ev as usize;
                let g = &self.g[e * self.n_ph_stas + ps];
                let c0 = e * 4;
                for k in 0..4 {
                    acc += sign * g[k] * self.col_scale[c0 + k] * x[c0 + k];
                }
            }
            y[row] += self.w[row] * acc;
        }
        for c in 0..self.n_tt_constraints {
            let row = self.n_obs + c;
            let ev = self.ev_by_obs[0][row];
            if ev >= 0 {
                let col = ev as usize * 4 + 3;
                y[row] += self.w[row] * self.col_scale[col] * x[col];
            }
        }
    }

    fn apply_transpose_add(&self, y: &DVector<f64>, x: &mut DVector<f64>) {
        for row in 0..self.n_obs {
            let ps = self.ph_sta_by_obs[row] as usize;
            let wy = self.w[row] * y[row];
            for (side, sign) in [(0usize, 1.0f64), (1, -1.0)] {
                let ev = self.ev_by_obs[side][row];
                if ev < 0 {
                    continue;
                }
                let e = ev as usize;
                let g = &self.g[e * self.n_ph_stas + ps];
                let c0 = e * 4;
                for k in 0..4 {
                    x[c0 + k] += sign * g[k] * self.col_scale[c0 + k] * wy;
                }
            }
        }
        for c in 0..self.n_tt_constraints {
            let row = self.n_obs + c;
            let ev = self.ev_by_obs[0][row];
            if ev >= 0 {
                let col = ev as usize * 4 + 3;
                x[col] += self.w[row] * self.col_scale[col] * y[row];
            }
        }
    }
}
