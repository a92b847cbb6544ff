mod access;
mod appointments;
mod availability;
mod booking;
mod conflict;
mod error;
mod ledger;
mod slots;

pub use availability::validate_window;
pub use booking::BookingRequest;
pub use conflict::{filter_free, first_conflict, fits_window, merge_overlapping, slot_is_free};
pub use error::EngineError;
pub use slots::{Slots, generate_slots};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::limits::MAX_TUTORS_PER_TENANT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTutorState = Arc<RwLock<TutorState>>;
pub type SharedBalance = Arc<Mutex<HoursBalance>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after an append error so partially buffered bytes don't leak
    // into the next batch; every sender in this batch is told it failed.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The scheduling engine of one tenant: availability, appointments and balances.
pub struct Engine {
    pub tutors: DashMap<Ulid, SharedTutorState>,
    pub(super) balances: DashMap<BalanceKey, SharedBalance>,
    /// Reservations not yet consumed by an appointment.
    pub(super) reservations: DashMap<Ulid, (BalanceKey, Minutes)>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: window/appointment id → tutor id
    pub(super) entity_to_tutor: DashMap<Ulid, Ulid>,
    /// Student → appointment ids, in booking order.
    pub(super) student_appointments: DashMap<Ulid, Vec<Ulid>>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot can't miss an event that is logged but not yet applied.
    pub(super) commit_gate: RwLock<()>,
    pub policy: BookingPolicy,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: BookingPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tutors: DashMap::new(),
            balances: DashMap::new(),
            reservations: DashMap::new(),
            wal_tx,
            notify,
            entity_to_tutor: DashMap::new(),
            student_appointments: DashMap::new(),
            commit_gate: RwLock::new(()),
            policy,
        };

        // We're the sole owner of every Arc during replay, so try_write/try_lock
        // always succeed. Never block here: this may run inside an async context.
        for event in &events {
            if let Some(tutor_id) = event.tutor_id() {
                let ts = engine.tutor_entry(tutor_id);
                let mut guard = ts.try_write().expect("replay: uncontended write");
                engine.apply_to_tutor(&mut guard, event);
            }
            if let Some(key) = event.balance_key() {
                let balance = engine.balance_entry(key);
                let mut guard = balance.try_lock().expect("replay: uncontended lock");
                engine.apply_to_balance(&mut guard, event);
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_tutor(&self, id: &Ulid) -> Option<SharedTutorState> {
        self.tutors.get(id).map(|e| e.value().clone())
    }

    pub fn get_tutor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_tutor.get(entity_id).map(|e| *e.value())
    }

    fn tutor_entry(&self, id: Ulid) -> SharedTutorState {
        self.tutors
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(TutorState::new(id))))
            .clone()
    }

    /// Tutor state for a write path; creates it on first use.
    pub(super) fn tutor_for_write(&self, id: Ulid) -> Result<SharedTutorState, EngineError> {
        if let Some(ts) = self.get_tutor(&id) {
            return Ok(ts);
        }
        if self.tutors.len() >= MAX_TUTORS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many tutors"));
        }
        Ok(self.tutor_entry(id))
    }

    pub(super) fn get_balance(&self, key: &BalanceKey) -> Option<SharedBalance> {
        self.balances.get(key).map(|e| e.value().clone())
    }

    pub(super) fn balance_entry(&self, key: &BalanceKey) -> SharedBalance {
        self.balances
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(HoursBalance::empty(key.clone()))))
            .clone()
    }

    /// Lookup entity → tutor, get tutor, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<TutorState>), EngineError> {
        let tutor_id = self
            .get_tutor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ts = self
            .get_tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = ts.write_owned().await;
        Ok((tutor_id, guard))
    }

    /// Log a tutor-scoped event, then apply it under the held write lock.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TutorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_tutor(ts, event);
        Ok(())
    }

    /// Apply a tutor-scoped event (caller holds the tutor write lock).
    pub(super) fn apply_to_tutor(&self, ts: &mut TutorState, event: &Event) {
        match event {
            Event::WindowAdded { window } => {
                ts.windows.push(window.clone());
                self.entity_to_tutor.insert(window.id, ts.id);
            }
            Event::WindowUpdated { window } => {
                if let Some(existing) = ts.windows.iter_mut().find(|w| w.id == window.id) {
                    *existing = window.clone();
                }
            }
            Event::WindowRemoved { id, .. } => {
                ts.windows.retain(|w| w.id != *id);
                self.entity_to_tutor.remove(id);
            }
            Event::AppointmentCreated { appointment } => {
                self.index_appointment(ts, appointment.clone());
            }
            Event::AppointmentStatusChanged { id, status, .. } => {
                if let Some(appt) = ts.appointment_mut(*id) {
                    appt.status = *status;
                }
            }
            Event::AppointmentCreditedBack { id, .. } => {
                if let Some(appt) = ts.appointment_mut(*id) {
                    appt.credited_back = true;
                }
            }
            Event::AppointmentRescheduled { old_id, replacement } => {
                if let Some(old) = ts.appointment_mut(*old_id) {
                    old.status = AppointmentStatus::Cancelled;
                    old.carried_to = Some(replacement.id);
                }
                self.index_appointment(ts, replacement.clone());
            }
            Event::HoursPurchased { .. }
            | Event::HoursReserved { .. }
            | Event::HoursReleased { .. }
            | Event::BalanceRestored { .. } => {}
        }
    }

    fn index_appointment(&self, ts: &mut TutorState, appointment: Appointment) {
        self.entity_to_tutor.insert(appointment.id, ts.id);
        self.student_appointments
            .entry(appointment.student_id)
            .or_default()
            .push(appointment.id);
        self.reservations.remove(&appointment.reservation_id);
        ts.insert_appointment(appointment);
    }

    /// Apply a balance-scoped event (caller holds the balance lock).
    pub(super) fn apply_to_balance(&self, balance: &mut HoursBalance, event: &Event) {
        match event {
            Event::HoursPurchased { minutes, .. } => balance.total_purchased += minutes,
            Event::HoursReserved { reservation_id, key, minutes } => {
                balance.used += minutes;
                self.reservations.insert(*reservation_id, (key.clone(), *minutes));
            }
            Event::HoursReleased { reservation_id, minutes, .. } => {
                balance.used -= minutes;
                if let Some(id) = reservation_id {
                    self.reservations.remove(id);
                }
            }
            Event::BalanceRestored { total_purchased, used, .. } => {
                balance.total_purchased = *total_purchased;
                balance.used = *used;
            }
            Event::AppointmentCreditedBack { minutes, .. } => balance.used -= minutes,
            _ => {}
        }
        debug_assert!(balance.used >= 0, "used went negative");
        debug_assert!(balance.available() >= 0, "available went negative");
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut outstanding: std::collections::HashMap<BalanceKey, Minutes> =
            std::collections::HashMap::new();
        let mut reserved = Vec::new();
        for entry in self.reservations.iter() {
            let (key, minutes) = entry.value();
            *outstanding.entry(key.clone()).or_default() += minutes;
            reserved.push(Event::HoursReserved {
                reservation_id: *entry.key(),
                key: key.clone(),
                minutes: *minutes,
            });
        }

        let mut events = Vec::new();
        let balances: Vec<SharedBalance> = self.balances.iter().map(|e| e.value().clone()).collect();
        for balance in balances {
            let guard = balance.lock().await;
            let pending = outstanding.get(&guard.key).copied().unwrap_or(0);
            events.push(Event::BalanceRestored {
                key: guard.key.clone(),
                total_purchased: guard.total_purchased,
                used: guard.used - pending,
            });
        }
        events.extend(reserved);

        let tutors: Vec<SharedTutorState> = self.tutors.iter().map(|e| e.value().clone()).collect();
        for ts in tutors {
            let guard = ts.read().await;
            for window in &guard.windows {
                events.push(Event::WindowAdded { window: window.clone() });
            }
            for appointment in &guard.appointments {
                events.push(Event::AppointmentCreated { appointment: appointment.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
