//! Data models and the line decoder.

use chrono::NaiveDate;
use serde::Serialize;

use crate::errors::{DecodeError, DecodeErrorKind};

/// Column order of the input file
pub const FIELD_NAMES: [&str; 15] = [
    "timestamp",
    "lineId",
    "direction",
    "journeyPatternId",
    "timeFrame",
    "vehicleJourneyId",
    "operator",
    "congestion",
    "longitude",
    "latitude",
    "delay",
    "blockId",
    "vehicleId",
    "stopId",
    "atStop",
];

const TIME_FRAME_FORMAT: &str = "%Y-%m-%d";

/// Store-generated primary key of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RecordId(i64);

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl RecordId {
    /// Get the raw identifier value
    pub fn value(&self) -> i64 {
        self.0
    }
}

/// One decoded telemetry row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    /// Assigned by the sink on persist, `None` before write.
    pub id: Option<RecordId>,
    /// Record timestamp in milliseconds from Unix epoch
    pub timestamp: i64,
    pub line_id: String,
    pub direction: String,
    pub journey_pattern_id: String,
    /// Service day the record belongs to
    pub time_frame: NaiveDate,
    pub vehicle_journey_id: String,
    pub operator: String,
    pub congestion: bool,
    /// Kept as text to preserve the source precision
    pub longitude: String,
    /// Kept as text to preserve the source precision
    pub latitude: String,
    /// Delay in seconds, `None` when the column is empty
    pub delay: Option<f64>,
    pub block_id: String,
    pub vehicle_id: String,
    pub stop_id: String,
    pub at_stop: bool,
}

impl VehicleRecord {
    /// Decode a raw delimited line.
    ///
    /// Commas separate fields; a field in double quotes may contain commas,
    /// and `""` inside quotes is a literal quote.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let fields = tokenize(line)?;
        let fields: Vec<&str> = fields.iter().collect();
        Self::from_fields(&fields)
    }

    /// Build a record from already split fields, in [`FIELD_NAMES`] order.
    pub fn from_fields(fields: &[&str]) -> Result<Self, DecodeError> {
        if fields.len() != FIELD_NAMES.len() {
            return Err(DecodeError::new(
                DecodeErrorKind::MalformedLine,
                format!(
                    "expected {} fields, found {}",
                    FIELD_NAMES.len(),
                    fields.len()
                ),
            ));
        }

        Ok(Self {
            id: None,
            timestamp: parse_timestamp(fields[0])?,
            line_id: fields[1].to_string(),
            direction: fields[2].to_string(),
            journey_pattern_id: fields[3].to_string(),
            time_frame: parse_time_frame(fields[4])?,
            vehicle_journey_id: fields[5].to_string(),
            operator: fields[6].to_string(),
            congestion: parse_flag("congestion", fields[7])?,
            longitude: fields[8].to_string(),
            latitude: fields[9].to_string(),
            delay: parse_delay(fields[10])?,
            block_id: fields[11].to_string(),
            vehicle_id: fields[12].to_string(),
            stop_id: fields[13].to_string(),
            at_stop: parse_flag("atStop", fields[14])?,
        })
    }
}

fn tokenize(line: &str) -> Result<csv::StringRecord, DecodeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());

    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Ok(record),
        // Blank line: a single empty field, which fails the count check
        Ok(false) => Ok(csv::StringRecord::from(vec![""])),
        Err(e) => Err(DecodeError::new(
            DecodeErrorKind::MalformedLine,
            e.to_string(),
        )),
    }
}

fn parse_timestamp(value: &str) -> Result<i64, DecodeError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| DecodeError::field(DecodeErrorKind::InvalidNumber, "timestamp", value))
}

fn parse_time_frame(value: &str) -> Result<NaiveDate, DecodeError> {
    NaiveDate::parse_from_str(value.trim(), TIME_FRAME_FORMAT)
        .map_err(|_| DecodeError::field(DecodeErrorKind::InvalidDate, "timeFrame", value))
}

fn parse_delay(value: &str) -> Result<Option<f64>, DecodeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<f64>() {
        Ok(delay) if delay.is_finite() => Ok(Some(delay)),
        _ => Err(DecodeError::field(
            DecodeErrorKind::InvalidNumber,
            "delay",
            value,
        )),
    }
}

fn parse_flag(field: &str, value: &str) -> Result<bool, DecodeError> {
    let trimmed = value.trim();
    if trimmed == "1" || trimmed.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if trimmed == "0" || trimmed.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(DecodeError::field(
            DecodeErrorKind::InvalidBoolean,
            field,
            value,
        ))
    }
}
