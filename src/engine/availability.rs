use ulid::Ulid;

use crate::model::*;

// ── Availability Projection ──────────────────────────────────────

/// Which reservations a consumer wants listed per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionPolicy {
    /// Live floor plan: reservations still holding the table that have not ended yet.
    Floor,
    /// Admin dashboard: every linked reservation, cancelled ones included
    /// until their window ends and the link is pruned.
    Dashboard,
}

/// Derive the read model of one table at `now`.
///
/// `reserved` is true iff a reservation holding the table (CONFIRMED, or
/// PENDING inside its confirmation window) covers `now`. Listed statuses
/// are effective statuses, so an expired hold shows as CANCELLED before the
/// sweep persists it.
pub fn project_table<F>(table: &TableState, now: Ms, policy: ProjectionPolicy, lookup: F) -> TableView
where
    F: Fn(&Ulid) -> Option<Reservation>,
{
    let mut reserved = false;
    let mut reservations = Vec::new();

    for interval in &table.intervals {
        let Some(r) = lookup(&interval.reservation_id) else {
            continue;
        };
        let status = r.effective_status(now);
        let holds = status != ReservationStatus::Cancelled;
        if holds && r.span.contains_instant(now) {
            reserved = true;
        }
        let listed = match policy {
            ProjectionPolicy::Floor => holds && r.span.end > now,
            ProjectionPolicy::Dashboard => true,
        };
        if listed {
            reservations.push(TableReservation {
                id: r.id,
                start_time: r.span.start,
                end_time: r.span.end,
                status,
            });
        }
    }

    TableView {
        table: table.info(),
        bookable: table.is_bookable(),
        reserved: reserved && table.is_bookable(),
        reservations,
    }
}

/// Project every table, ordered by label.
pub fn project<'a, I, F>(tables: I, now: Ms, policy: ProjectionPolicy, lookup: F) -> Vec<TableView>
where
    I: IntoIterator<Item = &'a TableState>,
    F: Fn(&Ulid) -> Option<Reservation>,
{
    let mut views: Vec<TableView> = tables
        .into_iter()
        .map(|t| project_table(t, now, policy, &lookup))
        .collect();
    views.sort_by(|a, b| a.table.label.cmp(&b.table.label).then(a.table.id.cmp(&b.table.id)));
    views
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::NaiveDate;

    use super::*;

    const NOON: Ms = 12 * HOUR_MS;

    struct Fixture {
        table: TableState,
        reservations: HashMap<Ulid, Reservation>,
    }

    impl Fixture {
        fn new(capacity: u32) -> Self {
            Self {
                table: TableState::new(Ulid::new(), "T1".into(), Geometry::default(), capacity),
                reservations: HashMap::new(),
            }
        }

        fn add(&mut self, start: Ms, end: Ms, status: ReservationStatus, created_at: Ms) -> Ulid {
            let id = Ulid::new();
            let span = Span::new(start, end);
            self.table.insert_interval(Interval {
                reservation_id: id,
                span,
            });
            self.reservations.insert(
                id,
                Reservation {
                    id,
                    name: "Guest".into(),
                    email: "guest@example.com".into(),
                    date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
                    span,
                    table_ids: vec![self.table.id],
                    status,
                    cancel_reason: None,
                    token: id.to_string(),
                    created_at,
                },
            );
            id
        }

        fn view(&self, now: Ms, policy: ProjectionPolicy) -> TableView {
            project_table(&self.table, now, policy, |id| self.reservations.get(id).cloned())
        }
    }

    #[test]
    fn confirmed_reservation_reserves_only_while_active() {
        let mut f = Fixture::new(4);
        f.add(NOON, NOON + HOUR_MS, ReservationStatus::Confirmed, 0);

        assert!(f.view(NOON + 30 * MINUTE_MS, ProjectionPolicy::Floor).reserved);
        assert!(!f.view(NOON + HOUR_MS + MINUTE_MS, ProjectionPolicy::Floor).reserved);
        assert!(!f.view(NOON - 1, ProjectionPolicy::Floor).reserved);
        // end is exclusive
        assert!(!f.view(NOON + HOUR_MS, ProjectionPolicy::Floor).reserved);
    }

    #[test]
    fn pending_hold_reserves_inside_window_only() {
        let mut f = Fixture::new(4);
        let created = NOON;
        f.add(NOON, NOON + 2 * HOUR_MS, ReservationStatus::Pending, created);

        let inside = f.view(NOON + 10 * MINUTE_MS, ProjectionPolicy::Floor);
        assert!(inside.reserved);
        assert_eq!(inside.reservations[0].status, ReservationStatus::Pending);

        let stale = f.view(NOON + 16 * MINUTE_MS, ProjectionPolicy::Floor);
        assert!(!stale.reserved);
        assert!(stale.reservations.is_empty());
    }

    #[test]
    fn dashboard_lists_every_status() {
        let mut f = Fixture::new(4);
        f.add(NOON, NOON + HOUR_MS, ReservationStatus::Cancelled, 0);
        f.add(NOON + HOUR_MS, NOON + 2 * HOUR_MS, ReservationStatus::Confirmed, 0);
        let expired = f.add(NOON + 2 * HOUR_MS, NOON + 3 * HOUR_MS, ReservationStatus::Pending, 0);

        let now = NOON - HOUR_MS;
        let floor = f.view(now, ProjectionPolicy::Floor);
        assert_eq!(floor.reservations.len(), 1);

        let dash = f.view(now, ProjectionPolicy::Dashboard);
        assert_eq!(dash.reservations.len(), 3);
        let shown = dash.reservations.iter().find(|r| r.id == expired).unwrap();
        assert_eq!(shown.status, ReservationStatus::Cancelled);
    }

    #[test]
    fn floor_drops_finished_reservations() {
        let mut f = Fixture::new(4);
        f.add(NOON, NOON + HOUR_MS, ReservationStatus::Confirmed, 0);
        f.add(NOON + 3 * HOUR_MS, NOON + 4 * HOUR_MS, ReservationStatus::Confirmed, 0);

        let view = f.view(NOON + 2 * HOUR_MS, ProjectionPolicy::Floor);
        assert_eq!(view.reservations.len(), 1);
        assert_eq!(view.reservations[0].start_time, NOON + 3 * HOUR_MS);
    }

    #[test]
    fn decorative_zone_never_bookable() {
        let f = Fixture::new(0);
        let view = f.view(NOON, ProjectionPolicy::Floor);
        assert!(!view.bookable);
        assert!(!view.reserved);
    }

    #[test]
    fn project_orders_by_label() {
        let b = TableState::new(Ulid::new(), "B".into(), Geometry::default(), 2);
        let a = TableState::new(Ulid::new(), "A".into(), Geometry::default(), 2);
        let views = project([&b, &a], 0, ProjectionPolicy::Floor, |_| None);
        assert_eq!(views[0].table.label, "A");
        assert_eq!(views[1].table.label, "B");
    }
}
