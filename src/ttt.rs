//! Travel-time adapter contract.
//!
//! The relocation driver only ever asks one question of a velocity model:
//! given an event hypocenter, a station and a phase type, what are the travel
//! time, the takeoff geometry and the velocity at the source? Tabular 1-D
//! and gridded 3-D back-ends live outside this crate and plug in through
//! [`TravelTimeTable`]; failures are recoverable and make the driver drop the
//! affected observation.
//!
//! [`HomogeneousModel`] is the one in-crate implementation: straight rays in
//! a uniform half-space, sufficient for synthetic catalogs and tests.

use crate::catalog::{Event, PhaseType, Station};
use crate::constants::{Degree, KmPerSec, Seconds};
use crate::errors::DdError;
use crate::geodesy::{self, Origin};

/// Travel time and takeoff geometry of one ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelTime {
    pub time: Seconds,
    /// Takeoff azimuth at the source, degrees clockwise from north.
    pub azimuth: Degree,
    /// Takeoff dip at the source, degrees from horizontal, positive downward.
    /// A ray leaving toward a surface station has a negative dip.
    pub dip: Degree,
    /// Medium velocity at the source, km/s.
    pub velocity_at_src: KmPerSec,
}

/// The contract between the relocation driver and a velocity model.
pub trait TravelTimeTable {
    /// Travel time from `event` to `station` for `phase`.
    ///
    /// A request outside the model's coverage returns
    /// [`DdError::MissingTravelTime`]; the driver treats that as recoverable.
    fn compute(
        &self,
        event: &Event,
        station: &Station,
        phase: PhaseType,
    ) -> Result<TravelTime, DdError>;
}

/// Uniform half-space with constant P and S velocities.
#[derive(Debug, Clone, Copy)]
pub struct HomogeneousModel {
    pub v_p: KmPerSec,
    pub v_s: KmPerSec,
}

impl Default for HomogeneousModel {
    fn default() -> Self {
        // crustal defaults, vp/vs ~ 1.73
        Self { v_p: 6.0, v_s: 3.46 }
    }
}

impl HomogeneousModel {
    pub fn new(v_p: KmPerSec, v_s: KmPerSec) -> Result<Self, DdError> {
        if !(v_p.is_finite() && v_s.is_finite()) || v_p <= 0.0 || v_s <= 0.0 {
            return Err(DdError::InvalidInput(format!(
                "velocities must be positive, got vp={v_p} vs={v_s}"
            )));
        }
        Ok(Self { v_p, v_s })
    }

    fn velocity(&self, phase: PhaseType) -> KmPerSec {
        match phase {
            PhaseType::P => self.v_p,
            PhaseType::S => self.v_s,
        }
    }
}

impl TravelTimeTable for HomogeneousModel {
    fn compute(
        &self,
        event: &Event,
        station: &Station,
        phase: PhaseType,
    ) -> Result<TravelTime, DdError> {
        let frame = Origin {
            latitude: event.latitude,
            longitude: event.longitude,
            depth: event.depth,
        };
        let ray = geodesy::project(station.latitude, station.longitude, station.depth(), &frame);
        let dist = ray.norm();
        if dist <= f64::EPSILON {
            return Err(DdError::MissingTravelTime {
                event: event.id,
                station: station.id.clone(),
                phase: phase.as_char(),
            });
        }

        let v = self.velocity(phase);
        let azimuth = ray.x.atan2(ray.y).to_degrees().rem_euclid(360.0);
        let dip = (ray.z / dist).asin().to_degrees();

        Ok(TravelTime {
            time: dist / v,
            azimuth,
            dip,
            velocity_at_src: v,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use approx::assert_abs_diff_eq;
    use hifitime::Epoch;

    use super::*;
    use crate::constants::KM_PER_DEG;

    fn event_at(latitude: f64, longitude: f64, depth: f64) -> Event {
        Event {
            id: 1,
            time: Epoch::from_str("2021-06-01T12:00:00 UTC").unwrap(),
            latitude,
            longitude,
            depth,
            magnitude: 0.0,
            horizontal_err: 0.0,
            vertical_err: 0.0,
            rms: 0.0,
        }
    }

    fn station_at(latitude: f64, longitude: f64, elevation: f64) -> Station {
        Station {
            id: "XX.TST.".into(),
            latitude,
            longitude,
            elevation,
            network: "XX".into(),
            station: "TST".into(),
            location: "".into(),
        }
    }

    #[test]
    fn straight_ray_geometry() {
        let model = HomogeneousModel::new(6.0, 3.46).unwrap();
        // event 10 km below a station one degree of latitude to the north
        let ev = event_at(46.0, 8.0, 10.0);
        let sta = station_at(47.0, 8.0, 0.0);

        let tt = model.compute(&ev, &sta, PhaseType::P).unwrap();
        let dist = (KM_PER_DEG * KM_PER_DEG + 100.0).sqrt();
        assert_abs_diff_eq!(tt.time, dist / 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(tt.azimuth, 0.0, epsilon = 1e-9);
        // upgoing ray
        assert!(tt.dip < 0.0);
        assert_abs_diff_eq!(tt.dip, (-10.0 / dist).asin().to_degrees(), epsilon = 1e-9);
        assert_eq!(tt.velocity_at_src, 6.0);
    }

    #[test]
    fn azimuth_points_east_and_s_is_slower() {
        let model = HomogeneousModel::default();
        let ev = event_at(46.0, 8.0, 5.0);
        let sta = station_at(46.0, 8.2, 0.0);

        let p = model.compute(&ev, &sta, PhaseType::P).unwrap();
        let s = model.compute(&ev, &sta, PhaseType::S).unwrap();
        assert_abs_diff_eq!(p.azimuth, 90.0, epsilon = 1e-6);
        assert!(s.time > p.time);
    }

    #[test]
    fn zero_distance_is_a_missing_travel_time() {
        let model = HomogeneousModel::default();
        let ev = event_at(46.0, 8.0, -0.5);
        let sta = station_at(46.0, 8.0, 500.0);
        assert!(matches!(
            model.compute(&ev, &sta, PhaseType::P),
            Err(DdError::MissingTravelTime { .. })
        ));
    }
}
