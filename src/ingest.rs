//! Record parsing for datagram and stop files.
//!
//! ## Datagram records
//!
//! Comma-separated, one ping per line, first line is a header. Only four
//! columns are read:
//!
//! | Index | Content |
//! |-------|---------|
//! | 4 | latitude × 10⁷ |
//! | 5 | longitude × 10⁷ |
//! | 10 | `yyyy-MM-dd HH:mm:ss` (UTC) or epoch milliseconds |
//! | 11 | bus id |
//!
//! Lines with fewer than 12 fields or unparsable coordinates/bus id are
//! dropped. An unparsable timestamp is replaced by the current time.
//!
//! ## Stop records
//!
//! `stopId,planVersionId,shortName,longName,gpsX,gpsY,decimalLong,decimalLatit`
//! with a header line. Names may be double-quoted and contain commas.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{NaiveDateTime, Utc};
use log::{info, warn};

use crate::error::{EngineError, Result};
use crate::{GpsPing, Stop};

/// Fields a datagram line must have.
pub const DATAGRAM_FIELDS: usize = 12;

/// Fields a stop line must have.
pub const STOP_FIELDS: usize = 8;

const COORD_SCALE: f64 = 1e7;
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a datagram timestamp: a datetime if it contains `-`, epoch millis otherwise.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.contains('-') {
        NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
            .ok()
            .map(|dt| dt.and_utc().timestamp_millis())
    } else {
        raw.parse().ok()
    }
}

/// Parse one datagram line.
pub fn parse_datagram_line(line: &str) -> Option<GpsPing> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < DATAGRAM_FIELDS {
        return None;
    }

    let lat = parts[4].trim().parse::<f64>().ok()? / COORD_SCALE;
    let lon = parts[5].trim().parse::<f64>().ok()? / COORD_SCALE;
    let bus_id = parts[11].trim().parse().ok()?;
    let timestamp_ms = parse_timestamp(parts[10]).unwrap_or_else(|| {
        warn!(
            "[Ingest] Unparsable timestamp '{}', using current time",
            parts[10]
        );
        Utc::now().timestamp_millis()
    });

    Some(GpsPing::new(bus_id, lat, lon, timestamp_ms))
}

/// Read datagrams, skipping the header.
///
/// `max_count` limits the number of data lines read (dropped lines count).
pub fn read_datagrams<R: BufRead>(reader: R, max_count: Option<usize>) -> std::io::Result<Vec<GpsPing>> {
    let limit = max_count.filter(|n| *n > 0).unwrap_or(usize::MAX);
    let mut pings = Vec::new();
    let mut dropped = 0usize;

    for line in reader.lines().skip(1).take(limit) {
        match parse_datagram_line(&line?) {
            Some(ping) => pings.push(ping),
            None => dropped += 1,
        }
    }

    info!("[Ingest] Read {} pings ({} lines dropped)", pings.len(), dropped);
    Ok(pings)
}

/// Load a datagram file.
pub fn load_datagrams(path: impl AsRef<Path>, max_count: Option<usize>) -> Result<Vec<GpsPing>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
    read_datagrams(BufReader::new(file), max_count).map_err(|e| EngineError::io(path, e))
}

/// Split a CSV line on commas outside double quotes; quotes are dropped.
fn split_quoted(line: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => values.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    values.push(current);
    values
}

/// Parse one stop line; coordinates come from `decimalLatit`/`decimalLong`.
pub fn parse_stop_line(line: &str) -> Option<Stop> {
    let values = split_quoted(line);
    if values.len() < STOP_FIELDS {
        return None;
    }
    let id = values[0].trim().parse().ok()?;
    let lon = values[6].trim().parse().ok()?;
    let lat = values[7].trim().parse().ok()?;
    Some(Stop::new(id, lat, lon))
}

/// Read stops, skipping the header and malformed rows.
pub fn read_stops<R: BufRead>(reader: R) -> std::io::Result<Vec<Stop>> {
    let mut stops = Vec::new();
    for line in reader.lines().skip(1) {
        let line = line?;
        match parse_stop_line(&line) {
            Some(stop) => stops.push(stop),
            None if line.trim().is_empty() => {}
            None => warn!("[Ingest] Skipping stop line: {}", line),
        }
    }
    info!("[Ingest] Read {} stops", stops.len());
    Ok(stops)
}

/// Load a stop file.
pub fn load_stops(path: impl AsRef<Path>) -> Result<Vec<Stop>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
    read_stops(BufReader::new(file)).map_err(|e| EngineError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = "idx,date,stopId,odometer,lat,lon,lineId,variant,orientation,vehicle,datagramDate,busId";

    fn line(lat: i64, lon: i64, when: &str, bus: u32) -> String {
        format!("1,31-MAY-18,500,1200,{},{},131,0,0,999,{},{}", lat, lon, when, bus)
    }

    #[test]
    fn test_parse_datetime_and_millis() {
        assert_eq!(parse_timestamp("1970-01-01 00:01:00"), Some(60_000));
        assert_eq!(parse_timestamp("1527750000000"), Some(1_527_750_000_000));
        assert_eq!(parse_timestamp("2018-05-31 25:00:00"), None);
        assert_eq!(parse_timestamp("soon"), None);
    }

    #[test]
    fn test_parse_datagram_line() {
        let ping = parse_datagram_line(&line(34_500_000, -765_300_000, "1970-01-01 00:00:10", 42)).unwrap();
        assert_eq!(ping.bus_id, 42);
        assert!((ping.lat - 3.45).abs() < 1e-9);
        assert!((ping.lon + 76.53).abs() < 1e-9);
        assert_eq!(ping.timestamp_ms, 10_000);
    }

    #[test]
    fn test_short_or_bad_lines_dropped() {
        assert_eq!(parse_datagram_line("1,2,3,4,5"), None);
        assert_eq!(parse_datagram_line(""), None);
        assert_eq!(parse_datagram_line("1,d,500,1,abc,-765300000,131,0,0,999,0,1"), None);
        assert_eq!(parse_datagram_line("1,d,500,1,34500000,-765300000,131,0,0,999,0,bus"), None);
    }

    #[test]
    fn test_bad_timestamp_uses_now() {
        let before = Utc::now().timestamp_millis();
        let ping = parse_datagram_line(&line(34_500_000, -765_300_000, "31/05/2018", 1)).unwrap();
        assert!(ping.timestamp_ms >= before);
    }

    #[test]
    fn test_read_datagrams_skips_header_and_limits() {
        let body = [
            HEADER.to_string(),
            line(34_500_000, -765_300_000, "0", 1),
            "garbage".to_string(),
            line(34_515_000, -765_300_000, "60000", 1),
            line(34_530_000, -765_300_000, "120000", 1),
        ]
        .join("\n");

        let all = read_datagrams(Cursor::new(body.clone()), None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].timestamp_ms, 120_000);

        let limited = read_datagrams(Cursor::new(body.clone()), Some(3)).unwrap();
        assert_eq!(limited.len(), 2);

        // 0 means no limit
        assert_eq!(read_datagrams(Cursor::new(body), Some(0)).unwrap().len(), 3);
    }

    #[test]
    fn test_read_stops() {
        let body = "stopId,planVersionId,shortName,longName,gpsX,gpsY,decimalLong,decimalLatit\n\
                    500300,180,\"UNIV\",\"Universidades, Calle 5\",1060000,870000,-76.5320,3.3716\n\
                    bad,row\n\
                    500301,180,CHIP,Chipichape,1061000,871000,-76.5280,3.4760\n";
        let stops = read_stops(Cursor::new(body)).unwrap();
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[0], Stop::new(500300, 3.3716, -76.5320));
        assert_eq!(stops[1].id, 500301);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_stops("/nonexistent/stops.csv").unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
