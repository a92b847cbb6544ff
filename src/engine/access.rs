use ulid::Ulid;

use crate::model::{Actor, Appointment, Role};

use super::EngineError;

/// Tutor-owned resources: the tutor themself or an admin.
pub(super) fn require_tutor(actor: &Actor, tutor_id: Ulid) -> Result<(), EngineError> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Tutor if actor.user_id == tutor_id => Ok(()),
        _ => Err(EngineError::Forbidden(format!(
            "{} {} cannot manage tutor {tutor_id}",
            actor.role.as_str(),
            actor.user_id
        ))),
    }
}

/// Student-owned resources: the student themself or an admin.
pub(super) fn require_student(actor: &Actor, student_id: Ulid) -> Result<(), EngineError> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Student if actor.user_id == student_id => Ok(()),
        _ => Err(EngineError::Forbidden(format!(
            "{} {} cannot act for student {student_id}",
            actor.role.as_str(),
            actor.user_id
        ))),
    }
}

/// Either side of the appointment, or an admin.
pub(super) fn require_party(actor: &Actor, appt: &Appointment) -> Result<(), EngineError> {
    let allowed = match actor.role {
        Role::Admin => true,
        Role::Student => actor.user_id == appt.student_id,
        Role::Tutor => actor.user_id == appt.tutor_id,
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!(
            "{} {} is not a party to appointment {}",
            actor.role.as_str(),
            actor.user_id,
            appt.id
        )))
    }
}

pub(super) fn require_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("admin only".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn appt(student_id: Ulid, tutor_id: Ulid) -> Appointment {
        Appointment {
            id: Ulid::new(),
            student_id,
            tutor_id,
            course_id: None,
            span: Span::new(0, MS_PER_HOUR),
            status: AppointmentStatus::Scheduled,
            notes: None,
            credited_back: false,
            reservation_id: Ulid::new(),
            carried_to: None,
            created_at: 0,
        }
    }

    #[test]
    fn tutor_ownership() {
        let tutor = Ulid::new();
        assert!(require_tutor(&Actor::tutor(tutor), tutor).is_ok());
        assert!(require_tutor(&Actor::admin(), tutor).is_ok());
        assert!(matches!(
            require_tutor(&Actor::tutor(Ulid::new()), tutor),
            Err(EngineError::Forbidden(_))
        ));
        assert!(require_tutor(&Actor::student(tutor), tutor).is_err());
    }

    #[test]
    fn student_ownership() {
        let student = Ulid::new();
        assert!(require_student(&Actor::student(student), student).is_ok());
        assert!(require_student(&Actor::admin(), student).is_ok());
        assert!(require_student(&Actor::student(Ulid::new()), student).is_err());
        assert!(require_student(&Actor::tutor(student), student).is_err());
    }

    #[test]
    fn party_check() {
        let (student, tutor) = (Ulid::new(), Ulid::new());
        let a = appt(student, tutor);
        assert!(require_party(&Actor::student(student), &a).is_ok());
        assert!(require_party(&Actor::tutor(tutor), &a).is_ok());
        assert!(require_party(&Actor::admin(), &a).is_ok());
        assert!(require_party(&Actor::student(tutor), &a).is_err());
        assert!(require_party(&Actor::tutor(Ulid::new()), &a).is_err());
    }

    #[test]
    fn admin_check() {
        assert!(require_admin(&Actor::admin()).is_ok());
        assert!(require_admin(&Actor::tutor(Ulid::new())).is_err());
    }
}
