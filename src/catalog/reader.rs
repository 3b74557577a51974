//! CSV ingest of the catalog interchange tables.
//!
//! Three comma-separated files describe a catalog:
//!
//! * `event.csv`: `id,isotime,latitude,longitude,depth,magnitude,horizontal_err,vertical_err,rms`
//! * `station.csv`: `id,latitude,longitude,elevation,networkCode,stationCode,locationCode`
//! * `phase.csv`: `eventId,stationId,isotime,lowerUncertainty,upperUncertainty,type,networkCode,stationCode,locationCode,channelCode,evalMode`
//!
//! Headers are verified, rows are split on plain commas (the formats carry no
//! free text, so no quoting) and every malformed field is reported with its
//! file and line number.

use std::fs;
use std::str::FromStr;

use camino::Utf8Path;
use hifitime::Epoch;

use crate::catalog::{Catalog, EvalMode, Event, Phase, PhaseType, Station};
use crate::errors::DdError;

pub const EVENT_HEADER: &str =
    "id,isotime,latitude,longitude,depth,magnitude,horizontal_err,vertical_err,rms";
pub const STATION_HEADER: &str =
    "id,latitude,longitude,elevation,networkCode,stationCode,locationCode";
pub const PHASE_HEADER: &str = "eventId,stationId,isotime,lowerUncertainty,upperUncertainty,\
                                type,networkCode,stationCode,locationCode,channelCode,evalMode";

/// Read a complete catalog from its three interchange files.
///
/// Arguments
/// ---------
/// * `event_csv`, `station_csv`, `phase_csv`: paths to the three tables.
///
/// Return
/// ------
/// * The assembled [`Catalog`], or the first parse/consistency error.
pub fn read_catalog(
    event_csv: &Utf8Path,
    station_csv: &Utf8Path,
    phase_csv: &Utf8Path,
) -> Result<Catalog, DdError> {
    let mut catalog = Catalog::new();

    for_each_row(event_csv, EVENT_HEADER, |fields, ctx| {
        catalog.add_event(parse_event(fields, &ctx)?)
    })?;
    for_each_row(station_csv, STATION_HEADER, |fields, ctx| {
        catalog.add_station(parse_station(fields, &ctx)?)
    })?;
    for_each_row(phase_csv, PHASE_HEADER, |fields, ctx| {
        catalog.add_phase(parse_phase(fields, &ctx)?)
    })?;

    Ok(catalog)
}

/// File/line context attached to every parse error.
pub(crate) struct RowContext {
    file: String,
    line: usize,
}

impl RowContext {
    pub(crate) fn error(&self, reason: impl Into<String>) -> DdError {
        DdError::CatalogParse {
            file: self.file.clone(),
            line: self.line,
            reason: reason.into(),
        }
    }
}

fn for_each_row(
    path: &Utf8Path,
    expected_header: &str,
    mut row: impl FnMut(&[&str], RowContext) -> Result<(), DdError>,
) -> Result<(), DdError> {
    let content = fs::read_to_string(path)?;
    let mut lines = content.lines().enumerate();

    match lines.next() {
        Some((_, header)) if normalize(header) == normalize(expected_header) => {}
        Some((_, header)) => {
            return Err(DdError::CatalogParse {
                file: path.to_string(),
                line: 1,
                reason: format!("unexpected header `{header}`"),
            })
        }
        None => {
            return Err(DdError::CatalogParse {
                file: path.to_string(),
                line: 1,
                reason: "empty file".into(),
            })
        }
    }

    let n_cols = expected_header.split(',').count();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let ctx = RowContext {
            file: path.to_string(),
            line: idx + 1,
        };
        if fields.len() != n_cols {
            return Err(ctx.error(format!(
                "expected {n_cols} columns, found {}",
                fields.len()
            )));
        }
        row(&fields, ctx)?;
    }
    Ok(())
}

fn normalize(header: &str) -> String {
    header.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_event(fields: &[&str], ctx: &RowContext) -> Result<Event, DdError> {
    Ok(Event {
        id: parse_num(fields[0], "id", ctx)?,
        time: parse_isotime(fields[1], ctx)?,
        latitude: parse_num(fields[2], "latitude", ctx)?,
        longitude: parse_num(fields[3], "longitude", ctx)?,
        depth: parse_num(fields[4], "depth", ctx)?,
        magnitude: parse_num(fields[5], "magnitude", ctx)?,
        horizontal_err: parse_num(fields[6], "horizontal_err", ctx)?,
        vertical_err: parse_num(fields[7], "vertical_err", ctx)?,
        rms: parse_num(fields[8], "rms", ctx)?,
    })
}

fn parse_station(fields: &[&str], ctx: &RowContext) -> Result<Station, DdError> {
    Ok(Station {
        id: fields[0].to_string(),
        latitude: parse_num(fields[1], "latitude", ctx)?,
        longitude: parse_num(fields[2], "longitude", ctx)?,
        elevation: parse_num(fields[3], "elevation", ctx)?,
        network: fields[4].to_string(),
        station: fields[5].to_string(),
        location: fields[6].to_string(),
    })
}

fn parse_phase(fields: &[&str], ctx: &RowContext) -> Result<Phase, DdError> {
    Ok(Phase {
        event_id: parse_num(fields[0], "eventId", ctx)?,
        station_id: fields[1].to_string(),
        time: parse_isotime(fields[2], ctx)?,
        lower_uncertainty: parse_num(fields[3], "lowerUncertainty", ctx)?,
        upper_uncertainty: parse_num(fields[4], "upperUncertainty", ctx)?,
        phase_type: PhaseType::parse(fields[5])
            .ok_or_else(|| ctx.error(format!("unknown phase type `{}`", fields[5])))?,
        network: fields[6].to_string(),
        station: fields[7].to_string(),
        location: fields[8].to_string(),
        channel: fields[9].to_string(),
        eval_mode: EvalMode::parse(fields[10])
            .ok_or_else(|| ctx.error(format!("unknown evalMode `{}`", fields[10])))?,
    })
}

fn parse_num<T: FromStr>(field: &str, name: &str, ctx: &RowContext) -> Result<T, DdError> {
    field
        .parse::<T>()
        .map_err(|_| ctx.error(format!("cannot parse {name} from `{field}`")))
}

/// Parse an ISO-8601 timestamp, tolerating both the `Z` suffix and hifitime's
/// native ` UTC` spelling.
pub(crate) fn parse_isotime(field: &str, ctx: &RowContext) -> Result<Epoch, DdError> {
    let candidate = if let Some(stripped) = field.strip_suffix('Z') {
        format!("{stripped} UTC")
    } else if field.ends_with("UTC") {
        field.to_string()
    } else {
        format!("{field} UTC")
    };
    Epoch::from_str(&candidate)
        .or_else(|_| Epoch::from_str(field))
        .map_err(|e| ctx.error(format!("cannot parse isotime `{field}`: {e}")))
}
