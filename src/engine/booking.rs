use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::limits::MAX_NOTES_LEN;
use crate::model::*;
use crate::notify::DomainEvent;
use crate::observability;

use super::access::{require_party, require_student, require_tutor};
use super::conflict::{fits_window, now_ms, slot_is_free, validate_span};
use super::{Engine, EngineError};

/// A student's request for one lesson.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub student_id: Ulid,
    pub tutor_id: Ulid,
    pub span: Span,
    pub course_id: Option<Ulid>,
    pub notes: Option<String>,
}

/// Shape checks shared by booking and rescheduling.
fn validate_lesson(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("lesson end must be after its start".into()));
    }
    if span.start % MS_PER_MINUTE != 0 || span.end % MS_PER_MINUTE != 0 {
        return Err(EngineError::Validation(
            "lesson boundaries must fall on whole minutes".into(),
        ));
    }
    validate_span(span)?;
    if span.start < now {
        return Err(EngineError::Validation("lesson starts in the past".into()));
    }
    Ok(())
}

impl Engine {
    /// Reserve hours and create a scheduled appointment for a free slot.
    pub async fn book(&self, actor: &Actor, req: BookingRequest) -> Result<Appointment, EngineError> {
        require_student(actor, req.student_id)?;
        let now = now_ms();
        validate_lesson(&req.span, now)?;
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::Validation(format!(
                "notes longer than {MAX_NOTES_LEN} bytes"
            )));
        }
        let _gate = self.commit_gate.read().await;
        if self.entity_to_tutor.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        if !self.is_free(req.tutor_id, &req.span).await {
            debug!("slot {:?} of tutor {} not free", req.span, req.tutor_id);
            return Err(EngineError::SlotUnavailable);
        }
        let Some(ts) = self.get_tutor(&req.tutor_id) else {
            return Err(EngineError::SlotUnavailable);
        };

        let key = BalanceKey::new(req.student_id, req.course_id);
        let minutes = req.span.duration_minutes();
        let reservation_id = self.reserve_hours(&key, minutes).await?;

        let appointment = Appointment {
            id: req.id,
            student_id: req.student_id,
            tutor_id: req.tutor_id,
            course_id: req.course_id,
            span: req.span,
            status: AppointmentStatus::Scheduled,
            notes: req.notes,
            credited_back: false,
            reservation_id,
            carried_to: None,
            created_at: now,
        };

        let created = {
            let mut guard = ts.write().await;
            // Windows may have changed since the pre-check.
            if fits_window(&guard, &appointment.span) {
                self.create_appointment(&mut guard, appointment.clone()).await
            } else {
                Err(EngineError::SlotUnavailable)
            }
        };
        if let Err(cause) = created {
            return Err(self.rollback_reservation(reservation_id, &key, minutes, cause).await);
        }

        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        info!(
            "booked {} for student {} with tutor {} ({minutes} min)",
            appointment.id, appointment.student_id, appointment.tutor_id
        );
        self.notify.publish(DomainEvent::AppointmentBooked {
            appointment: appointment.clone(),
        });
        Ok(appointment)
    }

    /// Give back a reservation after a failed create. Returns the error to surface.
    pub(super) async fn rollback_reservation(
        &self,
        reservation_id: Ulid,
        key: &BalanceKey,
        minutes: Minutes,
        cause: EngineError,
    ) -> EngineError {
        if let Err(release_err) = self.release_reservation(reservation_id).await {
            metrics::counter!(observability::RECONCILIATION_FAILURES_TOTAL).increment(1);
            error!(
                %reservation_id,
                student_id = %key.student_id,
                course_id = ?key.course_id,
                minutes,
                "reservation not released after failed booking ({cause}): {release_err}"
            );
            return EngineError::Reconciliation(format!(
                "reservation {reservation_id} of {minutes} minutes for student {} \
                 could not be released: {release_err}",
                key.student_id
            ));
        }
        match cause {
            EngineError::Overlap(existing) => {
                metrics::counter!(observability::BOOKING_RACES_LOST_TOTAL).increment(1);
                warn!("booking {reservation_id} lost the slot to appointment {existing}");
                EngineError::SlotUnavailable
            }
            other => other,
        }
    }

    /// Cancel a scheduled appointment, crediting hours back when policy allows.
    pub async fn cancel(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (_, mut guard) = self.resolve_entity_write(&id).await?;
        let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        require_party(actor, appt)?;

        // Tutors and admins always refund; students only with enough notice.
        let credit = match actor.role {
            Role::Tutor | Role::Admin => true,
            Role::Student => now_ms() <= appt.span.start - self.policy.credit_lead_time_ms,
        };

        let mut cancelled = self
            .update_status_locked(&mut guard, id, AppointmentStatus::Cancelled)
            .await?;
        if credit {
            match self.credit_back_locked(&mut guard, id).await {
                Ok(_) => cancelled.credited_back = true,
                Err(e) => {
                    metrics::counter!(observability::RECONCILIATION_FAILURES_TOTAL).increment(1);
                    error!(
                        appointment_id = %id,
                        student_id = %cancelled.student_id,
                        minutes = cancelled.minutes(),
                        "appointment cancelled but not credited: {e}"
                    );
                    return Err(EngineError::Reconciliation(format!(
                        "appointment {id} cancelled but {} minutes not credited: {e}",
                        cancelled.minutes()
                    )));
                }
            }
        }
        drop(guard);

        let credited = if cancelled.credited_back { "true" } else { "false" };
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "credited" => credited).increment(1);
        info!(
            "appointment {id} cancelled by {} (credited: {credited})",
            actor.role.as_str()
        );
        self.notify.publish(DomainEvent::AppointmentCancelled {
            appointment: cancelled.clone(),
            cancelled_by: actor.role,
            credited_back: cancelled.credited_back,
        });
        Ok(cancelled)
    }

    /// Record how a lesson went. No effect on hours.
    pub async fn mark_outcome(
        &self,
        actor: &Actor,
        id: Ulid,
        outcome: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        if !matches!(outcome, AppointmentStatus::Completed | AppointmentStatus::NoShow) {
            return Err(EngineError::Validation(format!(
                "outcome must be completed or no_show, got {outcome}"
            )));
        }
        let _gate = self.commit_gate.read().await;
        let (tutor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.appointment(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        require_tutor(actor, tutor_id)?;

        let updated = self.update_status_locked(&mut guard, id, outcome).await?;
        drop(guard);

        info!("appointment {id} marked {outcome}");
        self.notify.publish(DomainEvent::AppointmentOutcomeRecorded {
            appointment: updated.clone(),
        });
        Ok(updated)
    }

    /// Move a scheduled appointment to another free slot with the same tutor.
    /// The old appointment is cancelled with its hours carried to `new_id`.
    pub async fn reschedule(
        &self,
        actor: &Actor,
        id: Ulid,
        new_id: Ulid,
        new_span: Span,
    ) -> Result<Appointment, EngineError> {
        let now = now_ms();
        validate_lesson(&new_span, now)?;
        let _gate = self.commit_gate.read().await;
        if self.entity_to_tutor.contains_key(&new_id) {
            return Err(EngineError::AlreadyExists(new_id));
        }

        let (tutor_id, mut guard) = self.resolve_entity_write(&id).await?;
        let old = guard
            .appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        require_party(actor, &old)?;
        if old.status != AppointmentStatus::Scheduled {
            return Err(EngineError::InvalidTransition {
                id,
                from: old.status,
                to: AppointmentStatus::Cancelled,
            });
        }
        if actor.role == Role::Student && now > old.span.start - self.policy.credit_lead_time_ms {
            return Err(EngineError::Validation(format!(
                "appointment {id} is too close to its start to reschedule"
            )));
        }
        if guard.appointments.len() >= crate::limits::MAX_APPOINTMENTS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many appointments for tutor"));
        }
        if !slot_is_free(&guard, &new_span, Some(id)) {
            return Err(EngineError::SlotUnavailable);
        }

        let key = old.balance_key();
        let delta = new_span.duration_minutes() - old.minutes();
        let reservation_id = if delta > 0 {
            self.reserve_hours(&key, delta).await?
        } else {
            old.reservation_id
        };

        let replacement = Appointment {
            id: new_id,
            student_id: old.student_id,
            tutor_id,
            course_id: old.course_id,
            span: new_span,
            status: AppointmentStatus::Scheduled,
            notes: old.notes.clone(),
            credited_back: false,
            reservation_id,
            carried_to: None,
            created_at: now,
        };
        let event = Event::AppointmentRescheduled {
            old_id: id,
            replacement: replacement.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if delta > 0 {
                return Err(self.rollback_reservation(reservation_id, &key, delta, e).await);
            }
            return Err(e);
        }

        if delta < 0
            && let Err(e) = self.release_minutes(&key, -delta).await
        {
            metrics::counter!(observability::RECONCILIATION_FAILURES_TOTAL).increment(1);
            error!(
                appointment_id = %new_id,
                student_id = %key.student_id,
                minutes = -delta,
                "shortened reschedule did not return minutes: {e}"
            );
            return Err(EngineError::Reconciliation(format!(
                "{} minutes of appointment {new_id} not returned: {e}",
                -delta
            )));
        }

        let previous = guard.appointment(id).cloned().unwrap_or(old);
        drop(guard);

        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        info!("appointment {id} rescheduled to {new_id} ({delta:+} min)");
        self.notify.publish(DomainEvent::AppointmentRescheduled {
            previous,
            replacement: replacement.clone(),
        });
        Ok(replacement)
    }
}
