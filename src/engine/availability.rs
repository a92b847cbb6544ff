use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_WINDOWS_PER_TUTOR;
use crate::model::*;

use super::access::require_tutor;
use super::{Engine, EngineError};

/// Structural checks for a window before it is stored.
pub fn validate_window(window: &AvailabilityWindow) -> Result<(), EngineError> {
    if let Recurrence::Weekly { day_of_week } = window.recurrence
        && day_of_week > 6 {
            return Err(EngineError::Validation(format!(
                "day_of_week must be 0 (Sunday) to 6 (Saturday), got {day_of_week}"
            )));
        }
    if window.start >= window.end {
        return Err(EngineError::Validation(format!(
            "window start {} must be before end {}",
            window.start, window.end
        )));
    }
    Ok(())
}

/// A window is frozen while a scheduled appointment sits inside one of its occurrences.
fn ensure_unused(ts: &TutorState, window: &AvailabilityWindow) -> Result<(), EngineError> {
    let in_use = ts
        .appointments
        .iter()
        .any(|a| a.status == AppointmentStatus::Scheduled && window.contains(&a.span));
    if in_use {
        return Err(EngineError::WindowInUse(window.id));
    }
    Ok(())
}

impl Engine {
    pub async fn add_window(
        &self,
        actor: &Actor,
        window: AvailabilityWindow,
    ) -> Result<(), EngineError> {
        require_tutor(actor, window.tutor_id)?;
        validate_window(&window)?;
        let _gate = self.commit_gate.read().await;

        let ts = self.tutor_for_write(window.tutor_id)?;
        let mut guard = ts.write().await;
        if self.entity_to_tutor.contains_key(&window.id) {
            return Err(EngineError::AlreadyExists(window.id));
        }
        if guard.windows.len() >= MAX_WINDOWS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many windows for tutor"));
        }

        debug!(
            "window {} added for tutor {}: {:?} {}-{}",
            window.id, window.tutor_id, window.recurrence, window.start, window.end
        );
        self.persist_and_apply(&mut guard, &Event::WindowAdded { window })
            .await
    }

    /// Replace a window's recurrence and times. The owning tutor can't change.
    pub async fn update_window(
        &self,
        actor: &Actor,
        window: AvailabilityWindow,
    ) -> Result<(), EngineError> {
        validate_window(&window)?;
        let _gate = self.commit_gate.read().await;

        let (tutor_id, mut guard) = self.resolve_entity_write(&window.id).await?;
        let existing = guard
            .window(window.id)
            .ok_or(EngineError::NotFound(window.id))?;
        require_tutor(actor, tutor_id)?;
        if window.tutor_id != tutor_id {
            return Err(EngineError::Validation(format!(
                "window {} belongs to tutor {tutor_id}",
                window.id
            )));
        }
        ensure_unused(&guard, existing)?;

        self.persist_and_apply(&mut guard, &Event::WindowUpdated { window })
            .await
    }

    /// Delete a window, returning the tutor it belonged to.
    pub async fn remove_window(&self, actor: &Actor, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;

        let (tutor_id, mut guard) = self.resolve_entity_write(&id).await?;
        let existing = guard.window(id).ok_or(EngineError::NotFound(id))?;
        require_tutor(actor, tutor_id)?;
        ensure_unused(&guard, existing)?;

        self.persist_and_apply(&mut guard, &Event::WindowRemoved { id, tutor_id })
            .await?;
        info!("window {id} removed from tutor {tutor_id}");
        Ok(tutor_id)
    }

    /// Change only the patched columns of a window, merged against the stored
    /// window under the tutor lock. Returns the window as stored.
    pub async fn patch_window(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: WindowPatch,
    ) -> Result<AvailabilityWindow, EngineError> {
        let _gate = self.commit_gate.read().await;

        let (tutor_id, mut guard) = self.resolve_entity_write(&id).await?;
        let existing = guard.window(id).ok_or(EngineError::NotFound(id))?;
        require_tutor(actor, tutor_id)?;
        let window = patch.apply(existing);
        validate_window(&window)?;
        ensure_unused(&guard, existing)?;

        self.persist_and_apply(&mut guard, &Event::WindowUpdated { window: window.clone() })
            .await?;
        Ok(window)
    }

    /// Windows of a tutor in declaration order. Unknown tutors have none.
    pub async fn list_windows(&self, tutor_id: Ulid) -> Vec<AvailabilityWindow> {
        match self.get_tutor(&tutor_id) {
            Some(ts) => ts.read().await.windows.clone(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weekly(day_of_week: u8, start: &str, end: &str) -> AvailabilityWindow {
        AvailabilityWindow {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            recurrence: Recurrence::Weekly { day_of_week },
            start: start.parse().unwrap(),
            end: end.parse().unwrap(),
        }
    }

    #[test]
    fn accepts_well_formed_windows() {
        assert!(validate_window(&weekly(0, "09:00", "17:00")).is_ok());
        assert!(validate_window(&weekly(6, "23:00", "24:00")).is_ok());
    }

    #[test]
    fn rejects_empty_or_inverted_times() {
        assert!(matches!(
            validate_window(&weekly(1, "10:00", "10:00")),
            Err(EngineError::Validation(_))
        ));
        assert!(validate_window(&weekly(1, "11:00", "10:00")).is_err());
    }

    #[test]
    fn rejects_day_out_of_range() {
        assert!(validate_window(&weekly(7, "09:00", "10:00")).is_err());
    }

    #[test]
    fn scheduled_appointment_freezes_window() {
        let date = chrono::NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let w = weekly(1, "10:00", "12:00");
        let mut ts = TutorState::new(w.tutor_id);
        let start = TimeOfDay::hm(10, 0).unwrap().on(date);
        let mut appt = Appointment {
            id: Ulid::new(),
            student_id: Ulid::new(),
            tutor_id: w.tutor_id,
            course_id: None,
            span: Span::new(start, start + MS_PER_HOUR),
            status: AppointmentStatus::Cancelled,
            notes: None,
            credited_back: false,
            reservation_id: Ulid::new(),
            carried_to: None,
            created_at: 0,
        };
        ts.insert_appointment(appt.clone());
        assert!(ensure_unused(&ts, &w).is_ok());

        appt.id = Ulid::new();
        appt.status = AppointmentStatus::Scheduled;
        ts.insert_appointment(appt);
        assert!(matches!(ensure_unused(&ts, &w), Err(EngineError::WindowInUse(id)) if id == w.id));
    }
}
