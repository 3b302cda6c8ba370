use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds, the only time type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// How long a PENDING reservation's token stays redeemable after creation.
pub const CONFIRMATION_WINDOW_MS: Ms = 15 * MINUTE_MS;

/// Name of the live-update event carried on the publish channel.
pub const UPDATE_EVENT: &str = "reservation:update";

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict half-open overlap: back-to-back spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Floor-plan placement. Opaque to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A table's link to one reservation, over that reservation's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub reservation_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct TableState {
    pub id: Ulid,
    pub label: String,
    pub geometry: Geometry,
    /// Seats. Zero marks a decorative zone that can never be booked.
    pub capacity: u32,
    /// Set when the table is deleted while someone may still hold its Arc.
    pub retired: bool,
    /// Reservation links, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl TableState {
    pub fn new(id: Ulid, label: String, geometry: Geometry, capacity: u32) -> Self {
        Self {
            id,
            label,
            geometry,
            capacity,
            retired: false,
            intervals: Vec::new(),
        }
    }

    pub fn is_bookable(&self) -> bool {
        self.capacity > 0
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, reservation_id: Ulid) -> Option<Interval> {
        let pos = self
            .intervals
            .iter()
            .position(|i| i.reservation_id == reservation_id)?;
        Some(self.intervals.remove(pos))
    }

    /// Drop every link `dead` picks, keeping the rest in order. Returns how
    /// many were dropped.
    pub fn prune_intervals(&mut self, mut dead: impl FnMut(&Interval) -> bool) -> usize {
        let before = self.intervals.len();
        self.intervals.retain(|i| !dead(i));
        before - self.intervals.len()
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn info(&self) -> TableInfo {
        TableInfo {
            id: self.id,
            label: self.label.clone(),
            geometry: self.geometry,
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Token window elapsed while still PENDING.
    Expired,
    /// Explicit admin action.
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub date: NaiveDate,
    pub span: Span,
    /// Sorted, deduplicated.
    pub table_ids: Vec<Ulid>,
    pub status: ReservationStatus,
    pub cancel_reason: Option<CancelReason>,
    pub token: String,
    pub created_at: Ms,
}

impl Reservation {
    pub fn confirm_deadline(&self) -> Ms {
        self.created_at + CONFIRMATION_WINDOW_MS
    }

    /// PENDING past its confirmation window. Exactly at the deadline is still confirmable.
    pub fn is_expired(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Pending && now - self.created_at > CONFIRMATION_WINDOW_MS
    }

    /// Status as other logic must see it: stale PENDING holds read as CANCELLED
    /// even before the sweep has persisted the transition.
    pub fn effective_status(&self, now: Ms) -> ReservationStatus {
        if self.is_expired(now) {
            ReservationStatus::Cancelled
        } else {
            self.status
        }
    }

    /// Whether this reservation blocks its tables over its span.
    pub fn holds_tables(&self, now: Ms) -> bool {
        self.effective_status(now) != ReservationStatus::Cancelled
    }
}

/// Booking request as submitted. Presence of each field is checked by the
/// window validator, not by deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(default)]
    pub table_ids: Vec<Ulid>,
}

/// Admin edit. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub table_ids: Option<Vec<Ulid>>,
    pub status: Option<ReservationStatus>,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TableCreated {
        id: Ulid,
        label: String,
        geometry: Geometry,
        capacity: u32,
    },
    TableDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        name: String,
        email: String,
        date: NaiveDate,
        span: Span,
        table_ids: Vec<Ulid>,
        token: String,
        created_at: Ms,
    },
    ReservationConfirmed {
        id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        reason: CancelReason,
    },
    ReservationUpdated {
        id: Ulid,
        name: String,
        email: String,
        date: NaiveDate,
        span: Span,
        table_ids: Vec<Ulid>,
        status: ReservationStatus,
    },
    ReservationUnlinked {
        id: Ulid,
        table_id: Ulid,
    },
    ReservationDeleted {
        id: Ulid,
    },
}

// ── Read models ──────────────────────────────────────────────────

/// Render unix millis the way browsers serialize dates: RFC 3339, UTC, millisecond precision.
pub fn serialize_ms<S: Serializer>(ms: &Ms, serializer: S) -> Result<S::Ok, S::Error> {
    match DateTime::<Utc>::from_timestamp_millis(*ms) {
        Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => serializer.serialize_i64(*ms),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub id: Ulid,
    pub label: String,
    #[serde(flatten)]
    pub geometry: Geometry,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReservation {
    pub id: Ulid,
    #[serde(serialize_with = "serialize_ms")]
    pub start_time: Ms,
    #[serde(serialize_with = "serialize_ms")]
    pub end_time: Ms,
    pub status: ReservationStatus,
}

/// Per-table read model, recomputed on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableView {
    #[serde(flatten)]
    pub table: TableInfo,
    /// False for decorative zones; such tables are never offered for selection.
    pub bookable: bool,
    pub reserved: bool,
    pub reservations: Vec<TableReservation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub id: Ulid,
    pub label: String,
}

/// Reservation as the admin dashboard sees it. The token is never exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDetail {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub date: NaiveDate,
    #[serde(serialize_with = "serialize_ms")]
    pub start_time: Ms,
    #[serde(serialize_with = "serialize_ms")]
    pub end_time: Ms,
    pub status: ReservationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: Ms,
    pub tables: Vec<TableSummary>,
}

/// Payload of a `reservation:update` publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Update {
    Snapshot(Vec<TableView>),
    Table(TableView),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 5, 1).unwrap()
    }

    fn table() -> TableState {
        TableState::new(Ulid::new(), "T1".into(), Geometry::default(), 4)
    }

    fn link(start: Ms, end: Ms) -> Interval {
        Interval {
            reservation_id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    fn pending(created_at: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            date: date(),
            span: Span::new(1000, 2000),
            table_ids: vec![Ulid::new()],
            status: ReservationStatus::Pending,
            cancel_reason: None,
            token: "tok".into(),
            created_at,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn interval_ordering() {
        let mut t = table();
        t.insert_interval(link(300, 400));
        t.insert_interval(link(100, 200));
        t.insert_interval(link(200, 300));
        assert_eq!(t.intervals[0].span.start, 100);
        assert_eq!(t.intervals[1].span.start, 200);
        assert_eq!(t.intervals[2].span.start, 300);
    }

    #[test]
    fn interval_remove_by_reservation() {
        let mut t = table();
        let l = link(100, 200);
        let rid = l.reservation_id;
        t.insert_interval(l);
        assert!(t.remove_interval(Ulid::new()).is_none());
        assert_eq!(t.remove_interval(rid).map(|i| i.reservation_id), Some(rid));
        assert!(t.intervals.is_empty());
    }

    #[test]
    fn prune_keeps_survivors_sorted() {
        let mut t = table();
        for start in [500, 100, 300, 200, 400] {
            t.insert_interval(link(start, start + 50));
        }
        let pruned = t.prune_intervals(|i| i.span.start % 200 == 0);
        assert_eq!(pruned, 2);
        let starts: Vec<Ms> = t.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 300, 500]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut t = table();
        t.insert_interval(link(100, 200));
        t.insert_interval(link(450, 600));
        t.insert_interval(link(1000, 1100));

        let hits: Vec<_> = t.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut t = table();
        t.insert_interval(link(100, 200));
        assert_eq!(t.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(t.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut t = table();
        t.insert_interval(link(100, 201));
        assert_eq!(t.overlapping(&Span::new(200, 300)).count(), 1);
    }

    #[test]
    fn decorative_zone_not_bookable() {
        let t = TableState::new(Ulid::new(), "Bar".into(), Geometry::default(), 0);
        assert!(!t.is_bookable());
        assert!(table().is_bookable());
    }

    #[test]
    fn expiry_boundary_is_confirmable() {
        let r = pending(0);
        assert!(!r.is_expired(CONFIRMATION_WINDOW_MS));
        assert!(r.is_expired(CONFIRMATION_WINDOW_MS + 1));
        assert_eq!(r.effective_status(CONFIRMATION_WINDOW_MS), ReservationStatus::Pending);
        assert_eq!(
            r.effective_status(16 * MINUTE_MS),
            ReservationStatus::Cancelled
        );
        assert!(!r.holds_tables(16 * MINUTE_MS));
    }

    #[test]
    fn confirmed_never_expires() {
        let mut r = pending(0);
        r.status = ReservationStatus::Confirmed;
        assert!(!r.is_expired(10 * HOUR_MS));
        assert!(r.holds_tables(10 * HOUR_MS));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            date: date(),
            span: Span::new(1000, 2000),
            table_ids: vec![Ulid::new(), Ulid::new()],
            token: "f47ac10b-58cc-4372-a567-0e02b2c3d479".into(),
            created_at: 500,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn table_view_json_shape() {
        let view = TableView {
            table: TableInfo {
                id: Ulid::new(),
                label: "T1".into(),
                geometry: Geometry { x: 10, y: 20, width: 80, height: 80 },
                capacity: 4,
            },
            bookable: true,
            reserved: false,
            reservations: vec![TableReservation {
                id: Ulid::new(),
                start_time: 0,
                end_time: HOUR_MS,
                status: ReservationStatus::Confirmed,
            }],
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["label"], "T1");
        assert_eq!(json["x"], 10);
        assert_eq!(json["width"], 80);
        assert_eq!(json["reserved"], false);
        assert_eq!(json["reservations"][0]["startTime"], "1970-01-01T00:00:00.000Z");
        assert_eq!(json["reservations"][0]["endTime"], "1970-01-01T01:00:00.000Z");
        assert_eq!(json["reservations"][0]["status"], "CONFIRMED");
    }
}
