use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{ProjectionPolicy, project, project_table};
use super::conflict;
use super::{Engine, EngineError, normalize_ids};

/// Dashboard listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub date: Option<NaiveDate>,
    /// When false, reservations that already ended are left out.
    pub include_past: bool,
}

fn detail(r: &Reservation, labels: &HashMap<Ulid, String>, now: Ms) -> ReservationDetail {
    let status = r.effective_status(now);
    let cancel_reason = match (status, r.cancel_reason) {
        (ReservationStatus::Cancelled, None) => Some(CancelReason::Expired),
        (_, reason) => reason,
    };
    ReservationDetail {
        id: r.id,
        name: r.name.clone(),
        email: r.email.clone(),
        date: r.date,
        start_time: r.span.start,
        end_time: r.span.end,
        status,
        cancel_reason,
        created_at: r.created_at,
        tables: r
            .table_ids
            .iter()
            .map(|id| TableSummary {
                id: *id,
                label: labels.get(id).cloned().unwrap_or_default(),
            })
            .collect(),
    }
}

impl Engine {
    pub fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Holding reservations on any of `table_ids` that overlap `span` on `date`.
    pub async fn find_conflicts(
        &self,
        table_ids: &[Ulid],
        date: NaiveDate,
        span: &Span,
        now: Ms,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut guards = Vec::new();
        for id in normalize_ids(table_ids) {
            let table = self.get_table(&id).ok_or_else(|| EngineError::table_not_found(id))?;
            guards.push(table.read_owned().await);
        }
        Ok(conflict::find_conflicts(
            guards.iter().map(|g| &**g),
            date,
            span,
            now,
            None,
            |id| self.reservation(id),
        ))
    }

    pub async fn table_view(&self, id: Ulid, now: Ms, policy: ProjectionPolicy) -> Result<TableView, EngineError> {
        let table = self.get_table(&id).ok_or_else(|| EngineError::table_not_found(id))?;
        let guard = table.read().await;
        if guard.retired {
            return Err(EngineError::table_not_found(id));
        }
        Ok(project_table(&guard, now, policy, |rid| self.reservation(rid)))
    }

    /// Every table projected at `now`, ordered by label.
    pub async fn list_tables(&self, now: Ms, policy: ProjectionPolicy) -> Vec<TableView> {
        let mut ids: Vec<Ulid> = self.tables.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(table) = self.get_table(id) {
                guards.push(table.read_owned().await);
            }
        }
        project(
            guards.iter().filter(|g| !g.retired).map(|g| &**g),
            now,
            policy,
            |rid| self.reservation(rid),
        )
    }

    /// Full floor-plan publication payload.
    pub async fn snapshot(&self, now: Ms) -> Update {
        Update::Snapshot(self.list_tables(now, ProjectionPolicy::Floor).await)
    }

    async fn table_labels(&self) -> HashMap<Ulid, String> {
        let tables: Vec<_> = self.tables.iter().map(|e| e.value().clone()).collect();
        let mut labels = HashMap::with_capacity(tables.len());
        for table in tables {
            let guard = table.read().await;
            labels.insert(guard.id, guard.label.clone());
        }
        labels
    }

    pub async fn get_reservation(&self, id: Ulid, now: Ms) -> Result<ReservationDetail, EngineError> {
        let r = self.reservation(&id).ok_or_else(|| EngineError::reservation_not_found(id))?;
        let labels = self.table_labels().await;
        Ok(detail(&r, &labels, now))
    }

    /// Dashboard listing: newest date first, then by start time. Statuses are
    /// effective, so stale holds already read as CANCELLED.
    pub async fn list_reservations(&self, filter: ReservationFilter, now: Ms) -> Vec<ReservationDetail> {
        let mut records: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| filter.date.is_none_or(|d| e.date == d))
            .filter(|e| filter.include_past || e.span.end > now)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(a.span.start.cmp(&b.span.start))
                .then(a.id.cmp(&b.id))
        });

        let labels = self.table_labels().await;
        records.iter().map(|r| detail(r, &labels, now)).collect()
    }
}
