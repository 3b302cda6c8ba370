use chrono::{NaiveDate, Utc};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Reservations linked to `table` that collide with `[span.start, span.end)` on `date`.
///
/// A link collides iff its reservation still holds its tables at `now`
/// (CANCELLED and expired PENDING never do), falls on the same date, and
/// overlaps strictly: back-to-back bookings are allowed.
pub fn table_conflicts<F>(
    table: &TableState,
    date: NaiveDate,
    span: &Span,
    now: Ms,
    exclude: Option<Ulid>,
    lookup: F,
) -> Vec<Reservation>
where
    F: Fn(&Ulid) -> Option<Reservation>,
{
    table
        .overlapping(span)
        .filter(|i| Some(i.reservation_id) != exclude)
        .filter_map(|i| lookup(&i.reservation_id))
        .filter(|r| r.date == date && r.holds_tables(now) && r.span.overlaps(span))
        .collect()
}

/// Conflicts across several tables, each reservation reported once.
pub fn find_conflicts<'a, I, F>(
    tables: I,
    date: NaiveDate,
    span: &Span,
    now: Ms,
    exclude: Option<Ulid>,
    lookup: F,
) -> Vec<Reservation>
where
    I: IntoIterator<Item = &'a TableState>,
    F: Fn(&Ulid) -> Option<Reservation>,
{
    let mut found: Vec<Reservation> = Vec::new();
    for table in tables {
        for r in table_conflicts(table, date, span, now, exclude, &lookup) {
            if !found.iter().any(|f| f.id == r.id) {
                found.push(r);
            }
        }
    }
    found.sort_by_key(|r| (r.span.start, r.id));
    found
}

pub(crate) fn check_no_conflict<'a, I, F>(
    tables: I,
    date: NaiveDate,
    span: &Span,
    now: Ms,
    exclude: Option<Ulid>,
    lookup: F,
) -> Result<(), EngineError>
where
    I: IntoIterator<Item = &'a TableState>,
    F: Fn(&Ulid) -> Option<Reservation>,
{
    let conflicts = find_conflicts(tables, date, span, now, exclude, lookup);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict(conflicts.iter().map(|r| r.id).collect()))
    }
}
