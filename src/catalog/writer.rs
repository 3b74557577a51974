//! CSV output of a (relocated) catalog, mirroring [`super::reader`].

use std::fmt::Write as _;
use std::fs;

use camino::Utf8Path;

use crate::catalog::reader::{EVENT_HEADER, PHASE_HEADER, STATION_HEADER};
use crate::catalog::Catalog;
use crate::errors::DdError;

/// Write the three interchange tables for `catalog`.
///
/// Rows are emitted in ascending id order so output is reproducible.
pub fn write_catalog(
    catalog: &Catalog,
    event_csv: &Utf8Path,
    station_csv: &Utf8Path,
    phase_csv: &Utf8Path,
) -> Result<(), DdError> {
    let mut out = String::new();
    out.push_str(EVENT_HEADER);
    out.push('\n');
    for id in catalog.event_ids_sorted() {
        let ev = catalog.event(id).expect("sorted ids come from the catalog");
        writeln!(
            out,
            "{},{},{:.6},{:.6},{:.3},{:.2},{:.3},{:.3},{:.4}",
            ev.id,
            ev.time,
            ev.latitude,
            ev.longitude,
            ev.depth,
            ev.magnitude,
            ev.horizontal_err,
            ev.vertical_err,
            ev.rms
        )
        .expect("writing to a String cannot fail");
    }
    fs::write(event_csv, &out)?;

    out.clear();
    out.push_str(STATION_HEADER);
    out.push('\n');
    let mut station_ids: Vec<&str> = catalog.stations().map(|s| s.id.as_str()).collect();
    station_ids.sort_unstable();
    for id in station_ids {
        let sta = catalog.station(id).expect("sorted ids come from the catalog");
        writeln!(
            out,
            "{},{:.6},{:.6},{:.1},{},{},{}",
            sta.id, sta.latitude, sta.longitude, sta.elevation, sta.network, sta.station,
            sta.location
        )
        .expect("writing to a String cannot fail");
    }
    fs::write(station_csv, &out)?;

    out.clear();
    out.push_str(PHASE_HEADER);
    out.push('\n');
    for ev_id in catalog.event_ids_sorted() {
        for ph in catalog.phases_of(ev_id) {
            writeln!(
                out,
                "{},{},{},{:.3},{:.3},{},{},{},{},{},{}",
                ph.event_id,
                ph.station_id,
                ph.time,
                ph.lower_uncertainty,
                ph.upper_uncertainty,
                ph.phase_type,
                ph.network,
                ph.station,
                ph.location,
                ph.channel,
                ph.eval_mode.as_str()
            )
            .expect("writing to a String cannot fail");
        }
    }
    fs::write(phase_csv, &out)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::catalog::reader::read_catalog;

    #[test]
    fn written_catalog_reads_back() {
        let src = read_catalog(
            Utf8Path::new("tests/data/event.csv"),
            Utf8Path::new("tests/data/station.csv"),
            Utf8Path::new("tests/data/phase.csv"),
        )
        .unwrap();

        let dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .expect("temp dir is valid UTF-8")
            .join("ddloc-writer-test");
        std::fs::create_dir_all(&dir).unwrap();
        let ev = dir.join("event.csv");
        let sta = dir.join("station.csv");
        let pha = dir.join("phase.csv");

        write_catalog(&src, &ev, &sta, &pha).unwrap();
        let back = read_catalog(&ev, &sta, &pha).unwrap();

        assert_eq!(back.num_events(), src.num_events());
        assert_eq!(back.num_stations(), src.num_stations());
        assert_eq!(back.num_phases(), src.num_phases());

        let a = src.event(2).unwrap();
        let b = back.event(2).unwrap();
        assert!((a.latitude - b.latitude).abs() < 1e-6);
        assert!((a.time - b.time).to_seconds().abs() < 1e-6);
    }
}
