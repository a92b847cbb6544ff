use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_PURCHASE_MINUTES;
use crate::model::*;

use super::access::{require_admin, require_student};
use super::{Engine, EngineError};

impl Engine {
    /// Credit purchased minutes to a balance. Payments run as admin.
    pub async fn purchase_hours(
        &self,
        actor: &Actor,
        key: BalanceKey,
        minutes: Minutes,
    ) -> Result<HoursBalance, EngineError> {
        require_admin(actor)?;
        if minutes <= 0 {
            return Err(EngineError::Validation(format!(
                "purchase must be a positive number of minutes, got {minutes}"
            )));
        }
        if minutes > MAX_PURCHASE_MINUTES {
            return Err(EngineError::LimitExceeded("purchase too large"));
        }
        let _gate = self.commit_gate.read().await;

        let balance = self.balance_entry(&key);
        let mut guard = balance.lock().await;
        let event = Event::HoursPurchased { key, minutes };
        self.wal_append(&event).await?;
        self.apply_to_balance(&mut guard, &event);
        info!(
            "student {} purchased {minutes} minutes (course {:?})",
            guard.key.student_id, guard.key.course_id
        );
        Ok(guard.clone())
    }

    /// Current balance. A key that never saw a purchase reads as empty.
    pub async fn balance(&self, actor: &Actor, key: &BalanceKey) -> Result<HoursBalance, EngineError> {
        require_student(actor, key.student_id)?;
        Ok(self.balance_snapshot(key).await)
    }

    /// Every balance a student holds, general balance first.
    pub async fn balances_of(
        &self,
        actor: &Actor,
        student_id: Ulid,
    ) -> Result<Vec<HoursBalance>, EngineError> {
        require_student(actor, student_id)?;
        let mut keys: Vec<BalanceKey> = self
            .balances
            .iter()
            .filter(|e| e.key().student_id == student_id)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.balance_snapshot(&key).await);
        }
        Ok(out)
    }

    pub(super) async fn balance_snapshot(&self, key: &BalanceKey) -> HoursBalance {
        match self.get_balance(key) {
            Some(balance) => balance.lock().await.clone(),
            None => HoursBalance::empty(key.clone()),
        }
    }

    /// Hold `minutes` against a balance on behalf of a student.
    pub async fn reserve(
        &self,
        actor: &Actor,
        key: BalanceKey,
        minutes: Minutes,
    ) -> Result<Ulid, EngineError> {
        require_student(actor, key.student_id)?;
        let _gate = self.commit_gate.read().await;
        self.reserve_hours(&key, minutes).await
    }

    /// Undo a reservation that no appointment consumed.
    pub async fn release(&self, actor: &Actor, reservation_id: Ulid) -> Result<Minutes, EngineError> {
        let (key, _) = self
            .reservations
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(reservation_id))?;
        require_student(actor, key.student_id)?;
        let _gate = self.commit_gate.read().await;
        self.release_reservation(reservation_id).await
    }

    /// Manually return a cancelled appointment's minutes. Idempotent:
    /// `Ok(false)` when it was already credited.
    pub async fn credit_back(&self, actor: &Actor, appointment_id: Ulid) -> Result<bool, EngineError> {
        require_admin(actor)?;
        let _gate = self.commit_gate.read().await;
        let (_, mut guard) = self.resolve_entity_write(&appointment_id).await?;
        self.credit_back_locked(&mut guard, appointment_id).await
    }

    /// Check-and-debit in one step under the balance lock.
    pub(super) async fn reserve_hours(
        &self,
        key: &BalanceKey,
        minutes: Minutes,
    ) -> Result<Ulid, EngineError> {
        if minutes <= 0 {
            return Err(EngineError::Validation(format!(
                "reservation must be positive, got {minutes} minutes"
            )));
        }
        let Some(balance) = self.get_balance(key) else {
            return Err(EngineError::InsufficientBalance {
                required: minutes,
                available: 0,
            });
        };
        let mut guard = balance.lock().await;
        if guard.available() < minutes {
            return Err(EngineError::InsufficientBalance {
                required: minutes,
                available: guard.available(),
            });
        }

        let reservation_id = Ulid::new();
        let event = Event::HoursReserved {
            reservation_id,
            key: key.clone(),
            minutes,
        };
        self.wal_append(&event).await?;
        self.apply_to_balance(&mut guard, &event);
        debug!("reserved {minutes} minutes for {} as {reservation_id}", key.student_id);
        Ok(reservation_id)
    }

    pub(super) async fn release_reservation(&self, reservation_id: Ulid) -> Result<Minutes, EngineError> {
        let (key, minutes) = self
            .reservations
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(reservation_id))?;
        let balance = self.balance_entry(&key);
        let mut guard = balance.lock().await;
        // A concurrent release may have won while we waited for the lock.
        if !self.reservations.contains_key(&reservation_id) {
            return Err(EngineError::NotFound(reservation_id));
        }

        let event = Event::HoursReleased {
            reservation_id: Some(reservation_id),
            key,
            minutes,
        };
        self.wal_append(&event).await?;
        self.apply_to_balance(&mut guard, &event);
        debug!("released reservation {reservation_id} ({minutes} minutes)");
        Ok(minutes)
    }

    /// Return minutes already consumed by an appointment (a shortened reschedule).
    /// Caller holds the tutor lock.
    pub(super) async fn release_minutes(
        &self,
        key: &BalanceKey,
        minutes: Minutes,
    ) -> Result<(), EngineError> {
        let balance = self.balance_entry(key);
        let mut guard = balance.lock().await;
        if guard.used < minutes {
            return Err(EngineError::Reconciliation(format!(
                "releasing {minutes} minutes but only {} used for student {}",
                guard.used, key.student_id
            )));
        }
        let event = Event::HoursReleased {
            reservation_id: None,
            key: key.clone(),
            minutes,
        };
        self.wal_append(&event).await?;
        self.apply_to_balance(&mut guard, &event);
        Ok(())
    }

    /// Credit a cancelled appointment's minutes back to the balance it debited,
    /// at most once. The flag and the balance change travel in one logged event.
    pub(super) async fn credit_back_locked(
        &self,
        ts: &mut TutorState,
        appointment_id: Ulid,
    ) -> Result<bool, EngineError> {
        let appt = ts
            .appointment(appointment_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        if appt.credited_back {
            return Ok(false);
        }
        if appt.status != AppointmentStatus::Cancelled {
            return Err(EngineError::Validation(format!(
                "appointment {appointment_id} is {}, only cancelled appointments are credited",
                appt.status
            )));
        }
        if let Some(next) = appt.carried_to {
            return Err(EngineError::Validation(format!(
                "hours of appointment {appointment_id} were carried to {next}"
            )));
        }

        let key = appt.balance_key();
        let minutes = appt.minutes();
        let balance = self.balance_entry(&key);
        let mut balance_guard = balance.lock().await;
        let event = Event::AppointmentCreditedBack {
            id: appointment_id,
            tutor_id: ts.id,
            key,
            minutes,
        };
        self.wal_append(&event).await?;
        self.apply_to_tutor(ts, &event);
        self.apply_to_balance(&mut balance_guard, &event);

        metrics::counter!(crate::observability::CREDITED_MINUTES_TOTAL).increment(minutes as u64);
        info!("credited {minutes} minutes back for appointment {appointment_id}");
        Ok(true)
    }
}
