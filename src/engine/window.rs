//! Business-hours and sanity checks for a requested reservation window.
//!
//! Timestamps without an explicit offset are read in the restaurant's local
//! time, given by [`BusinessHours::offset`].

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};

use crate::limits::MAX_SPAN_DURATION_MS;
use crate::model::{HOUR_MS, Ms, Span};

use super::EngineError;

const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub open_hour: u32,
    /// Exclusive upper bound; 24 means midnight at the end of the day.
    pub close_hour: u32,
    pub offset: FixedOffset,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open_hour: 10,
            close_hour: 24,
            offset: Utc.fix(),
        }
    }
}

impl BusinessHours {
    pub fn new(open_hour: u32, close_hour: u32, offset: FixedOffset) -> Result<Self, EngineError> {
        if open_hour >= close_hour || close_hour > 24 {
            return Err(EngineError::validation(format!(
                "invalid business hours {open_hour:02}:00-{close_hour:02}:00"
            )));
        }
        Ok(Self {
            open_hour,
            close_hour,
            offset,
        })
    }

    /// Local midnight at the start of `date`, as unix millis.
    pub fn midnight(&self, date: NaiveDate) -> Ms {
        let local = date.and_time(NaiveTime::default()).and_utc().timestamp_millis();
        local - i64::from(self.offset.local_minus_utc()) * 1000
    }

    /// Opening-to-closing window on `date`.
    pub fn window(&self, date: NaiveDate) -> Span {
        let midnight = self.midnight(date);
        Span::new(
            midnight + i64::from(self.open_hour) * HOUR_MS,
            midnight + i64::from(self.close_hour) * HOUR_MS,
        )
    }
}

/// Accepts `YYYY-MM-DD`, or a full timestamp whose date part is used.
pub fn parse_date(raw: &str) -> Result<NaiveDate, EngineError> {
    let trimmed = raw.trim();
    let day = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| EngineError::validation(format!("invalid date: {raw}")))
}

/// RFC 3339, or a naive local timestamp interpreted at `offset`.
pub fn parse_timestamp(raw: &str, offset: FixedOffset) -> Result<Ms, EngineError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt)
            && let Some(local) = offset.from_local_datetime(&naive).single()
        {
            return Ok(local.timestamp_millis());
        }
    }
    Err(EngineError::validation(format!("invalid timestamp: {raw}")))
}

/// Check an already-parsed window. Pure: `now` is an input.
pub fn validate(
    date: NaiveDate,
    start: Ms,
    end: Ms,
    hours: &BusinessHours,
    now: Ms,
) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::validation("end time must be after start time"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation window too wide"));
    }
    let open = hours.window(date);
    if start < open.start || end > open.end {
        return Err(EngineError::validation(format!(
            "reservation must be within opening hours ({:02}:00-{:02}:00)",
            hours.open_hour, hours.close_hour
        )));
    }
    if start < now {
        return Err(EngineError::validation("reservation cannot start in the past"));
    }
    Ok(Span::new(start, end))
}

/// Full check of raw request fields: presence, parsing, then [`validate`].
pub fn validate_request(
    date: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
    hours: &BusinessHours,
    now: Ms,
) -> Result<(NaiveDate, Span), EngineError> {
    let date = required("date", date)?;
    let start = required("startTime", start)?;
    let end = required("endTime", end)?;

    let date = parse_date(date)?;
    let start = parse_timestamp(start, hours.offset)?;
    let end = parse_timestamp(end, hours.offset)?;
    let span = validate(date, start, end, hours, now)?;
    Ok((date, span))
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, EngineError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(EngineError::validation(format!("missing field: {field}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 5, 1).unwrap()
    }

    fn at(hours: &BusinessHours, h: i64, m: i64) -> Ms {
        hours.midnight(day()) + h * HOUR_MS + m * 60_000
    }

    #[test]
    fn accepts_window_inside_hours() {
        let hours = BusinessHours::default();
        let span = validate(day(), at(&hours, 18, 0), at(&hours, 19, 0), &hours, 0).unwrap();
        assert_eq!(span.duration_ms(), HOUR_MS);
    }

    #[test]
    fn closing_at_midnight_is_inclusive() {
        let hours = BusinessHours::default();
        assert!(validate(day(), at(&hours, 23, 0), at(&hours, 24, 0), &hours, 0).is_ok());
        assert!(validate(day(), at(&hours, 23, 0), at(&hours, 24, 1), &hours, 0).is_err());
    }

    #[test]
    fn rejects_before_opening() {
        let hours = BusinessHours::default();
        let err = validate(day(), at(&hours, 9, 30), at(&hours, 11, 0), &hours, 0).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("opening hours"));
    }

    #[test]
    fn respects_configured_closing_hour() {
        let hours = BusinessHours::new(10, 22, Utc.fix()).unwrap();
        assert!(validate(day(), at(&hours, 21, 0), at(&hours, 22, 0), &hours, 0).is_ok());
        assert!(validate(day(), at(&hours, 21, 0), at(&hours, 22, 30), &hours, 0).is_err());
    }

    #[test]
    fn rejects_end_not_after_start() {
        let hours = BusinessHours::default();
        let t = at(&hours, 18, 0);
        assert!(validate(day(), t, t, &hours, 0).is_err());
        assert!(validate(day(), t, t - 1, &hours, 0).is_err());
    }

    #[test]
    fn rejects_past_start() {
        let hours = BusinessHours::default();
        let start = at(&hours, 18, 0);
        let err = validate(day(), start, start + HOUR_MS, &hours, start + 1).unwrap_err();
        assert!(err.to_string().contains("past"));
        // starting exactly now is allowed
        assert!(validate(day(), start, start + HOUR_MS, &hours, start).is_ok());
    }

    #[test]
    fn rejects_window_on_another_day() {
        let hours = BusinessHours::default();
        let next = day().succ_opt().unwrap();
        let start = hours.midnight(next) + 12 * HOUR_MS;
        assert!(validate(day(), start, start + HOUR_MS, &hours, 0).is_err());
    }

    #[test]
    fn offset_shifts_business_hours() {
        let cet = FixedOffset::east_opt(3600).unwrap();
        let hours = BusinessHours::new(10, 24, cet).unwrap();
        // 10:00 local == 09:00 UTC
        let utc_nine = day().and_hms_opt(9, 0, 0).unwrap().and_utc().timestamp_millis();
        assert_eq!(hours.window(day()).start, utc_nine);
    }

    #[test]
    fn parses_rfc3339_and_naive_timestamps() {
        let utc = Utc.fix();
        let a = parse_timestamp("2030-05-01T18:00:00.000Z", utc).unwrap();
        let b = parse_timestamp("2030-05-01T18:00", utc).unwrap();
        let c = parse_timestamp("2030-05-01 18:00:00", utc).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);

        let plus_two = FixedOffset::east_opt(7200).unwrap();
        let local = parse_timestamp("2030-05-01T20:00", plus_two).unwrap();
        assert_eq!(local, a);
    }

    #[test]
    fn parse_date_accepts_timestamp_prefix() {
        assert_eq!(parse_date("2030-05-01").unwrap(), day());
        assert_eq!(parse_date("2030-05-01T00:00:00.000Z").unwrap(), day());
        assert!(parse_date("01/05/2030").is_err());
    }

    #[test]
    fn request_reports_missing_and_malformed_fields() {
        let hours = BusinessHours::default();
        let err = validate_request(None, Some("2030-05-01T18:00"), Some("2030-05-01T19:00"), &hours, 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "validation failed: missing field: date");

        let err = validate_request(Some("2030-05-01"), Some("  "), Some("2030-05-01T19:00"), &hours, 0)
            .unwrap_err();
        assert!(err.to_string().contains("startTime"));

        let err = validate_request(Some("2030-05-01"), Some("six pm"), Some("2030-05-01T19:00"), &hours, 0)
            .unwrap_err();
        assert!(err.to_string().contains("invalid timestamp"));

        let (date, span) = validate_request(
            Some("2030-05-01"),
            Some("2030-05-01T18:00"),
            Some("2030-05-01T19:00"),
            &hours,
            0,
        )
        .unwrap();
        assert_eq!(date, day());
        assert_eq!(span.duration_ms(), HOUR_MS);
    }

    #[test]
    fn invalid_hours_rejected() {
        assert!(BusinessHours::new(22, 10, Utc.fix()).is_err());
        assert!(BusinessHours::new(10, 25, Utc.fix()).is_err());
    }
}
