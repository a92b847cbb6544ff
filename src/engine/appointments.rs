use ulid::Ulid;

use crate::limits::{MAX_APPOINTMENTS_PER_TUTOR, MAX_QUERY_WINDOW_MS};
use crate::model::*;

use super::access::{require_party, require_student, require_tutor};
use super::conflict::check_no_overlap;
use super::{Engine, EngineError};

fn check_range(range: Option<&Span>) -> Result<(), EngineError> {
    match range {
        Some(r) if r.duration_ms() > MAX_QUERY_WINDOW_MS => {
            Err(EngineError::LimitExceeded("query window too wide"))
        }
        _ => Ok(()),
    }
}

fn in_range(appt: &Appointment, range: Option<&Span>) -> bool {
    range.is_none_or(|r| appt.span.overlaps(r))
}

impl Engine {
    /// Insert a scheduled appointment. Caller holds the tutor write lock,
    /// which makes the overlap check and the insert one atomic step.
    pub(super) async fn create_appointment(
        &self,
        ts: &mut TutorState,
        appointment: Appointment,
    ) -> Result<(), EngineError> {
        if ts.appointments.len() >= MAX_APPOINTMENTS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many appointments for tutor"));
        }
        if self.entity_to_tutor.contains_key(&appointment.id) {
            return Err(EngineError::AlreadyExists(appointment.id));
        }
        check_no_overlap(ts, &appointment.span, None)?;
        self.persist_and_apply(ts, &Event::AppointmentCreated { appointment })
            .await
    }

    /// Move a scheduled appointment to a terminal status.
    pub(super) async fn update_status_locked(
        &self,
        ts: &mut TutorState,
        id: Ulid,
        to: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let appt = ts.appointment(id).ok_or(EngineError::NotFound(id))?;
        if appt.status.is_terminal() || !to.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id,
                from: appt.status,
                to,
            });
        }
        let event = Event::AppointmentStatusChanged {
            id,
            tutor_id: ts.id,
            status: to,
        };
        self.persist_and_apply(ts, &event).await?;
        ts.appointment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_appointment(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let tutor_id = self.get_tutor_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let ts = self.get_tutor(&tutor_id).ok_or(EngineError::NotFound(id))?;
        let guard = ts.read().await;
        let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        require_party(actor, appt)?;
        Ok(appt.clone())
    }

    /// A tutor's appointments of every status, ordered by start time.
    pub async fn list_by_tutor(
        &self,
        actor: &Actor,
        tutor_id: Ulid,
        range: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        require_tutor(actor, tutor_id)?;
        check_range(range.as_ref())?;
        let Some(ts) = self.get_tutor(&tutor_id) else {
            return Ok(Vec::new());
        };
        let guard = ts.read().await;
        let found = match range {
            Some(r) => guard.overlapping(&r).cloned().collect(),
            None => guard.appointments.clone(),
        };
        Ok(found)
    }

    /// A student's appointments across all tutors, ordered by start time.
    pub async fn list_by_student(
        &self,
        actor: &Actor,
        student_id: Ulid,
        range: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        require_student(actor, student_id)?;
        check_range(range.as_ref())?;
        let ids = self
            .student_appointments
            .get(&student_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(ts) = self
                .get_tutor_for_entity(&id)
                .and_then(|tutor_id| self.get_tutor(&tutor_id))
            else {
                continue;
            };
            let guard = ts.read().await;
            if let Some(appt) = guard.appointment(id)
                && in_range(appt, range.as_ref())
            {
                found.push(appt.clone());
            }
        }
        found.sort_by_key(|a| (a.span.start, a.id));
        Ok(found)
    }
}
