use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, error, info};
use ulid::Ulid;
use uuid::Uuid;

use crate::limits::*;
use crate::mailer::Message;
use crate::model::*;
use crate::notify::Channel;
use crate::observability as obs;
use crate::wal::checkpoint_events;

use super::conflict::{check_no_conflict, now_ms};
use super::window::{parse_date, parse_timestamp, validate, validate_request};
use super::{Engine, EngineError, LockedTables, WalCommand, normalize_ids};

/// Result of redeeming a confirmation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmStatus {
    Confirmed,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub status: ConfirmStatus,
    pub reservation: Reservation,
}

/// What clearing a table's reservation links did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableUnlinkOutcome {
    /// Reservations that kept at least one other table.
    pub unlinked: usize,
    /// Reservations left with no tables, removed entirely.
    pub deleted: usize,
}

fn required_text(field: &str, value: Option<&str>, max_len: usize) -> Result<String, EngineError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::validation(format!("missing field: {field}")))?;
    if value.len() > max_len {
        return Err(EngineError::validation(format!("{field} too long")));
    }
    Ok(value.to_string())
}

fn check_email(email: &str) -> Result<(), EngineError> {
    let well_formed = !email.contains(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if well_formed {
        Ok(())
    } else {
        Err(EngineError::validation(format!("invalid email: {email}")))
    }
}

fn check_table_ids(ids: &[Ulid]) -> Result<Vec<Ulid>, EngineError> {
    if ids.is_empty() {
        return Err(EngineError::validation("missing field: tableIds"));
    }
    let ids = normalize_ids(ids);
    if ids.len() > MAX_TABLES_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many tables in one reservation"));
    }
    Ok(ids)
}

/// Tables must have seats and room for another live link. Cancelled or
/// finished reservations do not count against the cap.
pub(super) fn check_bookable<'a, F>(
    tables: impl IntoIterator<Item = &'a TableState>,
    now: Ms,
    lookup: F,
) -> Result<(), EngineError>
where
    F: Fn(&Ulid) -> Option<Reservation>,
{
    for t in tables {
        if !t.is_bookable() {
            return Err(EngineError::validation(format!("table {} is not bookable", t.label)));
        }
        if t.intervals.len() < MAX_INTERVALS_PER_TABLE {
            continue;
        }
        let live = t
            .intervals
            .iter()
            .filter(|i| lookup(&i.reservation_id).is_some_and(|r| r.holds_tables(now) && r.span.end > now))
            .count();
        if live >= MAX_INTERVALS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many reservations on table"));
        }
    }
    Ok(())
}

/// A link that can never matter again: its record is gone, or it was
/// cancelled and its window is over.
fn is_dead_link(record: Option<Reservation>, now: Ms) -> bool {
    record.is_none_or(|r| r.status == ReservationStatus::Cancelled && r.span.end <= now)
}

/// PENDING may go anywhere; CONFIRMED only stays or cancels; CANCELLED is final.
fn check_transition(from: ReservationStatus, to: ReservationStatus) -> Result<(), EngineError> {
    use ReservationStatus::*;
    match (from, to) {
        (Pending, _) | (Confirmed, Confirmed) | (Confirmed, Cancelled) => Ok(()),
        _ => Err(EngineError::InvalidTransition { from, to }),
    }
}

impl Engine {
    // ── Tables ───────────────────────────────────────────

    pub async fn create_table(
        &self,
        id: Ulid,
        label: &str,
        geometry: Geometry,
        capacity: u32,
    ) -> Result<TableInfo, EngineError> {
        let label = required_text("label", Some(label), MAX_LABEL_LEN)?;
        let provisioning = self.provisioning.lock().await;
        if self.tables.len() >= MAX_TABLES {
            return Err(EngineError::LimitExceeded("too many tables"));
        }
        if self.tables.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::TableCreated {
            id,
            label: label.clone(),
            geometry,
            capacity,
        };
        self.wal_append(&event).await?;
        let ts = TableState::new(id, label, geometry, capacity);
        let info = ts.info();
        self.tables.insert(id, Arc::new(RwLock::new(ts)));
        drop(provisioning);

        info!(%id, label = %info.label, capacity, "table created");
        self.publish_tables(&[id], now_ms()).await;
        Ok(info)
    }

    /// Remove a table. Its reservations are unlinked, and any left without
    /// tables are deleted.
    pub async fn delete_table(&self, id: Ulid, now: Ms) -> Result<TableUnlinkOutcome, EngineError> {
        let provisioning = self.provisioning.lock().await;
        let mut locked = self.lock_tables(&[id]).await?;
        let outcome = self.clear_table(&mut locked, id).await?;

        self.wal_append(&Event::TableDeleted { id }).await?;
        if let Some(t) = locked.get_mut(&id) {
            t.retired = true;
        }
        self.tables.remove(&id);
        drop(locked);
        drop(provisioning);

        info!(%id, unlinked = outcome.unlinked, deleted = outcome.deleted, "table deleted");
        let hub = self.dispatcher.hub();
        hub.remove(Channel::Table(id));
        hub.send(Channel::Floor, &self.snapshot(now).await);
        Ok(outcome)
    }

    /// Drop every reservation link of one table. Caller holds that table's lock;
    /// a reservation whose only table is this one is deleted outright.
    ///
    /// Links are read from the records, which still name the table after its
    /// dead interval was pruned.
    async fn clear_table(&self, locked: &mut LockedTables, table_id: Ulid) -> Result<TableUnlinkOutcome, EngineError> {
        let mut linked: Vec<Ulid> = self
            .reservations
            .iter()
            .filter(|r| r.table_ids.contains(&table_id))
            .map(|r| *r.key())
            .collect();
        linked.sort();

        let mut outcome = TableUnlinkOutcome::default();
        for rid in linked {
            let Some(r) = self.reservation(&rid) else {
                continue;
            };
            let orphaned = r.table_ids.iter().all(|t| *t == table_id);
            let event = if orphaned {
                Event::ReservationDeleted { id: rid }
            } else {
                Event::ReservationUnlinked { id: rid, table_id }
            };
            self.persist_and_apply(locked, &event).await?;
            if orphaned {
                outcome.deleted += 1;
            } else {
                outcome.unlinked += 1;
            }
        }
        Ok(outcome)
    }

    // ── Reservations ─────────────────────────────────────

    /// Validate, check conflicts and insert as PENDING, all under write locks
    /// on the requested tables. The confirmation message and the publish go
    /// out after the locks are released.
    pub async fn create_reservation(&self, request: ReservationRequest, now: Ms) -> Result<Reservation, EngineError> {
        let name = required_text("name", request.name.as_deref(), MAX_NAME_LEN)?;
        let email = required_text("email", request.email.as_deref(), MAX_EMAIL_LEN)?;
        check_email(&email)?;
        let (date, span) = validate_request(
            request.date.as_deref(),
            request.start_time.as_deref(),
            request.end_time.as_deref(),
            &self.hours,
            now,
        )?;
        let table_ids = check_table_ids(&request.table_ids)?;

        let mut locked = self.lock_tables(&table_ids).await?;
        check_bookable(locked.select(&table_ids), now, |id| self.reservation(id))?;
        if let Err(e) = check_no_conflict(locked.select(&table_ids), date, &span, now, None, |id| self.reservation(id)) {
            metrics::counter!(obs::CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let reservation = Reservation {
            id: Ulid::new(),
            name,
            email,
            date,
            span,
            table_ids,
            status: ReservationStatus::Pending,
            cancel_reason: None,
            token: self.fresh_token(),
            created_at: now,
        };
        let event = Event::ReservationCreated {
            id: reservation.id,
            name: reservation.name.clone(),
            email: reservation.email.clone(),
            date,
            span,
            table_ids: reservation.table_ids.clone(),
            token: reservation.token.clone(),
            created_at: now,
        };
        self.persist_and_apply(&mut locked, &event).await?;
        drop(locked);

        info!(id = %reservation.id, tables = reservation.table_ids.len(), "reservation created");
        metrics::counter!(obs::RESERVATIONS_CREATED_TOTAL).increment(1);
        let url = self.dispatcher.confirmation_url(&reservation.token);
        self.dispatcher
            .send_message(Message::confirmation(&reservation.email, &url));
        self.publish_tables(&reservation.table_ids, now).await;
        Ok(reservation)
    }

    fn fresh_token(&self) -> String {
        loop {
            let token = Uuid::new_v4().to_string();
            if !self.tokens.contains_key(&token) {
                return token;
            }
        }
    }

    /// Redeem a confirmation token. Compare-and-swap on PENDING: a token that
    /// already reached a terminal state reports that state and does nothing.
    pub async fn confirm(&self, token: &str, now: Ms) -> Result<ConfirmOutcome, EngineError> {
        let id = self
            .tokens
            .get(token.trim())
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::NotFound("reservation for token".into()))?;
        let (mut reservation, mut locked) = self.lock_reservation(id, &[]).await?;

        let (status, event) = match reservation.status {
            ReservationStatus::Pending if reservation.is_expired(now) => (
                ConfirmStatus::Expired,
                Some(Event::ReservationCancelled {
                    id,
                    reason: CancelReason::Expired,
                }),
            ),
            ReservationStatus::Pending => (ConfirmStatus::Confirmed, Some(Event::ReservationConfirmed { id })),
            ReservationStatus::Confirmed => (ConfirmStatus::Confirmed, None),
            ReservationStatus::Cancelled => match reservation.cancel_reason {
                Some(CancelReason::Expired) => (ConfirmStatus::Expired, None),
                _ => (ConfirmStatus::Cancelled, None),
            },
        };

        let Some(event) = event else {
            return Ok(ConfirmOutcome { status, reservation });
        };
        self.persist_and_apply(&mut locked, &event).await?;
        drop(locked);

        if status == ConfirmStatus::Confirmed {
            reservation.status = ReservationStatus::Confirmed;
            info!(%id, "reservation confirmed");
            metrics::counter!(obs::RESERVATIONS_CONFIRMED_TOTAL).increment(1);
        } else {
            reservation.status = ReservationStatus::Cancelled;
            reservation.cancel_reason = Some(CancelReason::Expired);
            info!(%id, "confirmation window elapsed, reservation expired");
            metrics::counter!(obs::RESERVATIONS_EXPIRED_TOTAL).increment(1);
        }
        self.publish_tables(&reservation.table_ids, now).await;
        Ok(ConfirmOutcome { status, reservation })
    }

    /// Admin cancel. Idempotent: cancelling a cancelled reservation changes
    /// nothing and sends nothing.
    pub async fn cancel(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let (mut reservation, mut locked) = self.lock_reservation(id, &[]).await?;
        if reservation.status == ReservationStatus::Cancelled {
            return Ok(reservation);
        }

        let event = Event::ReservationCancelled {
            id,
            reason: CancelReason::Admin,
        };
        self.persist_and_apply(&mut locked, &event).await?;
        drop(locked);

        reservation.status = ReservationStatus::Cancelled;
        reservation.cancel_reason = Some(CancelReason::Admin);
        info!(%id, "reservation cancelled");
        metrics::counter!(obs::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        self.dispatcher
            .send_message(Message::cancellation(&reservation.email, id));
        self.publish_tables(&reservation.table_ids, now).await;
        Ok(reservation)
    }

    /// Admin edit. Any change of date, time or tables is re-validated and
    /// re-checked for conflicts, ignoring the reservation itself.
    pub async fn update(&self, id: Ulid, patch: ReservationPatch, now: Ms) -> Result<Reservation, EngineError> {
        let new_tables = patch.table_ids.as_deref().map(check_table_ids).transpose()?;
        let name = patch
            .name
            .as_deref()
            .map(|n| required_text("name", Some(n), MAX_NAME_LEN))
            .transpose()?;
        let email = patch
            .email
            .as_deref()
            .map(|e| required_text("email", Some(e), MAX_EMAIL_LEN))
            .transpose()?;
        if let Some(email) = &email {
            check_email(email)?;
        }
        let date = patch.date.as_deref().map(parse_date).transpose()?;
        let start = patch
            .start_time
            .as_deref()
            .map(|s| parse_timestamp(s, self.hours.offset))
            .transpose()?;
        let end = patch
            .end_time
            .as_deref()
            .map(|s| parse_timestamp(s, self.hours.offset))
            .transpose()?;

        let extra = new_tables.clone().unwrap_or_default();
        let (current, mut locked) = self.lock_reservation(id, &extra).await?;

        let from = current.effective_status(now);
        let to = patch.status.unwrap_or(from);
        check_transition(from, to)?;

        let table_ids = new_tables.unwrap_or_else(|| current.table_ids.clone());
        let date = date.unwrap_or(current.date);
        let start = start.unwrap_or(current.span.start);
        let end = end.unwrap_or(current.span.end);
        let window_changed = date != current.date || start != current.span.start || end != current.span.end;
        let tables_changed = table_ids != current.table_ids;

        let span = if window_changed {
            validate(date, start, end, &self.hours, now)?
        } else {
            current.span
        };
        if tables_changed {
            check_bookable(locked.select(&table_ids), now, |rid| self.reservation(rid))?;
        }
        if (window_changed || tables_changed) && to != ReservationStatus::Cancelled {
            let lookup = |rid: &Ulid| self.reservation(rid);
            if let Err(e) = check_no_conflict(locked.select(&table_ids), date, &span, now, Some(id), lookup) {
                metrics::counter!(obs::CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
        }

        let cancelling = to == ReservationStatus::Cancelled && current.status != ReservationStatus::Cancelled;
        let updated = Reservation {
            name: name.unwrap_or_else(|| current.name.clone()),
            email: email.unwrap_or_else(|| current.email.clone()),
            date,
            span,
            table_ids,
            status: to,
            cancel_reason: if cancelling {
                Some(CancelReason::Admin)
            } else {
                current.cancel_reason
            },
            ..current.clone()
        };
        if updated == current {
            return Ok(current);
        }

        let event = Event::ReservationUpdated {
            id,
            name: updated.name.clone(),
            email: updated.email.clone(),
            date,
            span,
            table_ids: updated.table_ids.clone(),
            status: to,
        };
        self.persist_and_apply(&mut locked, &event).await?;
        drop(locked);

        info!(%id, status = %to, "reservation updated");
        if cancelling {
            metrics::counter!(obs::RESERVATIONS_CANCELLED_TOTAL).increment(1);
            self.dispatcher
                .send_message(Message::cancellation(&updated.email, id));
        } else if from == ReservationStatus::Pending && to == ReservationStatus::Confirmed {
            metrics::counter!(obs::RESERVATIONS_CONFIRMED_TOTAL).increment(1);
        }
        let mut touched = current.table_ids;
        touched.extend_from_slice(&updated.table_ids);
        self.publish_tables(&touched, now).await;
        Ok(updated)
    }

    pub async fn delete_reservation(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let (reservation, mut locked) = self.lock_reservation(id, &[]).await?;
        self.persist_and_apply(&mut locked, &Event::ReservationDeleted { id })
            .await?;
        drop(locked);

        info!(%id, "reservation deleted");
        self.publish_tables(&reservation.table_ids, now).await;
        Ok(reservation)
    }

    /// Unlink every reservation from one table, deleting those left with no tables.
    pub async fn delete_by_table(&self, table_id: Ulid, now: Ms) -> Result<TableUnlinkOutcome, EngineError> {
        let mut locked = self.lock_tables(&[table_id]).await?;
        let outcome = self.clear_table(&mut locked, table_id).await?;
        drop(locked);

        info!(%table_id, unlinked = outcome.unlinked, deleted = outcome.deleted, "table reservations cleared");
        self.publish_tables(&[table_id], now).await;
        Ok(outcome)
    }

    /// Persist CANCELLED for every PENDING reservation past its window.
    /// Each transition is re-checked under the reservation's locks, so a
    /// confirm that got there first wins.
    pub async fn sweep_expired(&self, now: Ms) -> usize {
        let candidates: Vec<Ulid> = self
            .reservations
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| *e.key())
            .collect();

        let mut swept = 0;
        for id in candidates {
            let (reservation, mut locked) = match self.lock_reservation(id, &[]).await {
                Ok(found) => found,
                Err(e) => {
                    debug!("sweep skip {id}: {e}");
                    continue;
                }
            };
            if !reservation.is_expired(now) {
                debug!(%id, "sweep lost race to confirmation");
                continue;
            }
            let event = Event::ReservationCancelled {
                id,
                reason: CancelReason::Expired,
            };
            if let Err(e) = self.persist_and_apply(&mut locked, &event).await {
                error!(%id, "sweep failed to persist expiry: {e}");
                continue;
            }
            drop(locked);

            swept += 1;
            metrics::counter!(obs::RESERVATIONS_EXPIRED_TOTAL).increment(1);
            self.publish_tables(&reservation.table_ids, now).await;
        }
        if swept > 0 {
            info!(swept, "expired stale pending reservations");
        }
        let pruned = self.prune_links(now).await;
        if pruned > 0 {
            debug!(pruned, "dropped dead table links");
        }
        swept
    }

    /// Remove table links of deleted reservations and of cancelled ones whose
    /// window has ended. The records stay for the dashboard listing.
    pub async fn prune_links(&self, now: Ms) -> usize {
        let mut ids: Vec<Ulid> = self.tables.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut pruned = 0;
        for id in ids {
            let Ok(mut locked) = self.lock_tables(&[id]).await else {
                continue;
            };
            if let Some(table) = locked.get_mut(&id) {
                pruned += table.prune_intervals(|i| is_dead_link(self.reservation(&i.reservation_id), now));
            }
        }
        pruned
    }

    /// Replay-time prune: nothing else can hold the locks yet.
    pub(super) fn prune_links_unshared(&self, now: Ms) {
        for entry in self.tables.iter() {
            if let Ok(mut table) = entry.value().clone().try_write_owned() {
                table.prune_intervals(|i| is_dead_link(self.reservation(&i.reservation_id), now));
            }
        }
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Read locks on every table keep reservation mutations out meanwhile.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _provisioning = self.provisioning.lock().await;
        let mut ids: Vec<Ulid> = self.tables.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(table) = self.get_table(id) {
                guards.push(table.read_owned().await);
            }
        }

        let records: Vec<Reservation> = self.reservations.iter().map(|e| e.value().clone()).collect();
        let events = checkpoint_events(guards.iter().map(|g| &**g), records);

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_checkpoint(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCheckpoint { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
