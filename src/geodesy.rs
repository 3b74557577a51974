//! Flat-earth geodesy utilities.
//!
//! All hypocentral math in this crate runs in a local Cartesian frame:
//! kilometers east (`x`), north (`y`) and down (`z`), relative to an origin
//! point (usually the catalog centroid). The projection is a flat-earth
//! approximation scaled on the origin latitude, which keeps it exactly
//! invertible and accurate to well below a meter over the few tens of
//! kilometers a double-difference cluster spans.
//!
//! Angles are degrees at the API surface and radians internally.

use nalgebra::Vector3;

use crate::constants::{Degree, Kilometer, KM_PER_DEG};

/// Origin of a local Cartesian frame.
///
/// Depth is in kilometers, positive downward; a station above sea level has
/// a negative depth.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Origin {
    pub latitude: Degree,
    pub longitude: Degree,
    pub depth: Kilometer,
}

/// Project a geographic location into the local frame of `origin`.
///
/// Return
/// ------
/// * Kilometers `(east, north, down)` relative to the origin.
pub fn project(
    latitude: Degree,
    longitude: Degree,
    depth: Kilometer,
    origin: &Origin,
) -> Vector3<f64> {
    let cos_lat = origin.latitude.to_radians().cos();
    Vector3::new(
        (longitude - origin.longitude) * KM_PER_DEG * cos_lat,
        (latitude - origin.latitude) * KM_PER_DEG,
        depth - origin.depth,
    )
}

/// Exact inverse of [`project`].
///
/// Return
/// ------
/// * `(latitude, longitude, depth)` in degrees and kilometers.
pub fn unproject(local: &Vector3<f64>, origin: &Origin) -> (Degree, Degree, Kilometer) {
    let cos_lat = origin.latitude.to_radians().cos();
    (
        origin.latitude + local.y / KM_PER_DEG,
        origin.longitude + local.x / (KM_PER_DEG * cos_lat),
        origin.depth + local.z,
    )
}

/// Convert a local Cartesian shift at `latitude` into geographic deltas.
///
/// Used to fold a solution vector `(Δx, Δy)` back into `(Δlat, Δlon)`.
pub fn delta_to_degrees(dx: Kilometer, dy: Kilometer, latitude: Degree) -> (Degree, Degree) {
    (
        dy / KM_PER_DEG,
        dx / (KM_PER_DEG * latitude.to_radians().cos()),
    )
}

/// Horizontal (epicentral) distance in kilometers between two geographic
/// points, scaled on their mean latitude so the result is symmetric.
pub fn distance_2d(lat1: Degree, lon1: Degree, lat2: Degree, lon2: Degree) -> Kilometer {
    let cos_lat = (0.5 * (lat1 + lat2)).to_radians().cos();
    let dx = (lon2 - lon1) * KM_PER_DEG * cos_lat;
    let dy = (lat2 - lat1) * KM_PER_DEG;
    (dx * dx + dy * dy).sqrt()
}

/// Hypocentral (3-D) distance in kilometers.
pub fn distance_3d(
    lat1: Degree,
    lon1: Degree,
    depth1: Kilometer,
    lat2: Degree,
    lon2: Degree,
    depth2: Kilometer,
) -> Kilometer {
    let dh = distance_2d(lat1, lon1, lat2, lon2);
    let dz = depth2 - depth1;
    (dh * dh + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    const ORIGIN: Origin = Origin {
        latitude: 46.5,
        longitude: 8.6,
        depth: 5.0,
    };

    #[test]
    fn axes_follow_east_north_down() {
        let north = project(46.6, 8.6, 5.0, &ORIGIN);
        assert!(north.y > 0.0 && north.x.abs() < 1e-9 && north.z.abs() < 1e-9);

        let east = project(46.5, 8.7, 5.0, &ORIGIN);
        assert!(east.x > 0.0 && east.y.abs() < 1e-9);

        let deeper = project(46.5, 8.6, 7.5, &ORIGIN);
        assert_abs_diff_eq!(deeper.z, 2.5, epsilon = 1e-12);
    }

    #[test]
    fn roundtrip_is_submillimeter_over_50_km() {
        for &(dlat, dlon, depth) in &[
            (0.45, 0.65, 0.0),
            (-0.45, -0.65, 12.0),
            (0.2, -0.4, 30.0),
            (-0.01, 0.003, 5.2),
        ] {
            let lat = ORIGIN.latitude + dlat;
            let lon = ORIGIN.longitude + dlon;
            let local = project(lat, lon, depth, &ORIGIN);
            let (lat2, lon2, depth2) = unproject(&local, &ORIGIN);
            // 1e-9 degrees is ~0.1 mm on the ground
            assert_abs_diff_eq!(lat, lat2, epsilon = 1e-9);
            assert_abs_diff_eq!(lon, lon2, epsilon = 1e-9);
            assert_abs_diff_eq!(depth, depth2, epsilon = 1e-9);
        }
    }

    #[test]
    fn distances_are_symmetric_and_consistent() {
        let d_ab = distance_2d(46.5, 8.6, 46.9, 8.2);
        let d_ba = distance_2d(46.9, 8.2, 46.5, 8.6);
        assert_abs_diff_eq!(d_ab, d_ba, epsilon = 1e-12);

        // one degree of latitude is ~111.19 km
        assert_abs_diff_eq!(distance_2d(46.0, 8.6, 47.0, 8.6), KM_PER_DEG, epsilon = 1e-9);

        let d3 = distance_3d(46.5, 8.6, 0.0, 46.5, 8.6, 8.0);
        assert_abs_diff_eq!(d3, 8.0, epsilon = 1e-12);
    }

    #[test]
    fn delta_degrees_match_projection() {
        let (dlat, dlon) = delta_to_degrees(1.0, 1.0, ORIGIN.latitude);
        let local = project(
            ORIGIN.latitude + dlat,
            ORIGIN.longitude + dlon,
            ORIGIN.depth,
            &ORIGIN,
        );
        assert_abs_diff_eq!(local.x, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(local.y, 1.0, epsilon = 1e-9);
    }
}
