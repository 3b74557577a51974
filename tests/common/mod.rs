//! Synthetic catalogs for the end-to-end scenarios: events and stations are
//! laid out in a local km frame around (0°, 0°), picks are generated with the
//! homogeneous model from "true" hypocenters that may differ from the catalog
//! ones, optionally with Gaussian pick noise.

use std::str::FromStr;

use hifitime::{Duration, Epoch};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use ddloc::catalog::{Catalog, EvalMode, Event, Phase, PhaseType, Station};
use ddloc::constants::KM_PER_DEG;
use ddloc::geodesy::{self, Origin};
use ddloc::ttt::{HomogeneousModel, TravelTimeTable};

pub fn epoch0() -> Epoch {
    Epoch::from_str("2021-06-01T12:00:00 UTC").unwrap()
}

pub fn km_to_lat(y: f64) -> f64 {
    y / KM_PER_DEG
}

pub fn km_to_lon(x: f64) -> f64 {
    // the frame is centred on the equator, so no latitude scaling
    x / KM_PER_DEG
}

/// Where a relocated event ended up, in the km frame of the scenario.
pub fn located_km(catalog: &Catalog, id: u32) -> Vector3<f64> {
    let ev = catalog.event(id).expect("event exists");
    geodesy::project(ev.latitude, ev.longitude, ev.depth, &Origin::default())
}

/// Scenario description: catalog hypocenters (possibly wrong), the true
/// hypocenters the picks are generated from, and a surface station layout.
pub struct Scenario {
    pub catalog_km: Vec<(f64, f64, f64)>,
    pub true_km: Vec<(f64, f64, f64)>,
    pub stations_km: Vec<(f64, f64)>,
    pub vp: f64,
    pub pick_noise_sigma: f64,
    pub seed: u64,
    /// Per-event shift applied to the whole time base (origin and picks).
    pub time_base_shift: Vec<f64>,
}

impl Scenario {
    pub fn new(
        catalog_km: Vec<(f64, f64, f64)>,
        true_km: Vec<(f64, f64, f64)>,
        stations_km: Vec<(f64, f64)>,
    ) -> Self {
        Scenario {
            catalog_km,
            true_km,
            stations_km,
            vp: 6.0,
            pick_noise_sigma: 0.0,
            seed: 42,
            time_base_shift: Vec::new(),
        }
    }

    pub fn build(&self) -> Catalog {
        assert_eq!(self.catalog_km.len(), self.true_km.len());
        let model = HomogeneousModel::new(self.vp, self.vp / 1.73).unwrap();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0, self.pick_noise_sigma.max(1e-300)).unwrap();

        let mut catalog = Catalog::new();
        for (i, &(x, y)) in self.stations_km.iter().enumerate() {
            catalog
                .add_station(Station {
                    id: format!("XX.S{i:02}."),
                    latitude: km_to_lat(y),
                    longitude: km_to_lon(x),
                    elevation: 0.0,
                    network: "XX".into(),
                    station: format!("S{i:02}"),
                    location: "".into(),
                })
                .unwrap();
        }

        for (i, &(x, y, z)) in self.catalog_km.iter().enumerate() {
            let shift = self.time_base_shift.get(i).copied().unwrap_or(0.0);
            let origin = epoch0() + Duration::from_seconds(60.0 * i as f64 + shift);
            catalog
                .add_event(Event {
                    id: i as u32,
                    time: origin,
                    latitude: km_to_lat(y),
                    longitude: km_to_lon(x),
                    depth: z,
                    magnitude: 1.0,
                    horizontal_err: 0.0,
                    vertical_err: 0.0,
                    rms: 0.0,
                })
                .unwrap();
        }

        for (i, &(tx, ty, tz)) in self.true_km.iter().enumerate() {
            // travel times come from the true hypocenter, not the catalog one
            let true_ev = Event {
                id: i as u32,
                time: epoch0(),
                latitude: km_to_lat(ty),
                longitude: km_to_lon(tx),
                depth: tz,
                magnitude: 0.0,
                horizontal_err: 0.0,
                vertical_err: 0.0,
                rms: 0.0,
            };
            let origin = catalog.event(i as u32).unwrap().time;
            for s in 0..self.stations_km.len() {
                let sta_id = format!("XX.S{s:02}.");
                let station = catalog.station(&sta_id).unwrap().clone();
                let tt = model.compute(&true_ev, &station, PhaseType::P).unwrap();
                let mut pick_time = origin + Duration::from_seconds(tt.time);
                if self.pick_noise_sigma > 0.0 {
                    pick_time += Duration::from_seconds(noise.sample(&mut rng));
                }
                catalog
                    .add_phase(Phase {
                        event_id: i as u32,
                        station_id: sta_id.clone(),
                        time: pick_time,
                        lower_uncertainty: 0.01,
                        upper_uncertainty: 0.01,
                        phase_type: PhaseType::P,
                        eval_mode: EvalMode::Manual,
                        network: "XX".into(),
                        station: format!("S{s:02}"),
                        location: "".into(),
                        channel: "HHZ".into(),
                    })
                    .unwrap();
            }
        }
        catalog
    }
}

/// Uniformly distributed points in a sphere of `radius` km.
pub fn sphere_points(n: usize, radius: f64, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let p = Vector3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        if p.norm_squared() <= 1.0 {
            out.push(p * radius);
        }
    }
    out
}
