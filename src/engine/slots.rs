use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_SLOT_MINUTES;
use crate::model::*;

use super::conflict::{filter_free, now_ms};
use super::{Engine, EngineError};

/// Step positions of one window occurrence.
#[derive(Debug, Clone)]
struct Cursor {
    next_start: Ms,
    /// Latest start whose slot still ends inside the window.
    last_start: Ms,
    step: Ms,
}

/// Candidate slots for one date, ordered by start time, each emitted once.
///
/// Lazy and finite; clone it to walk the same sequence again.
#[derive(Debug, Clone)]
pub struct Slots {
    cursors: Vec<Cursor>,
    duration: Ms,
    last: Option<Span>,
}

impl Iterator for Slots {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        loop {
            // Every slot has the same duration, so ordering by start also orders by end.
            let cursor = self
                .cursors
                .iter_mut()
                .filter(|c| c.next_start <= c.last_start)
                .min_by_key(|c| c.next_start)?;
            let slot = Span::new(cursor.next_start, cursor.next_start + self.duration);
            cursor.next_start += cursor.step;

            // Overlapping windows yield identical slots back to back.
            if self.last == Some(slot) {
                continue;
            }
            self.last = Some(slot);
            return Some(slot);
        }
    }
}

fn validate_minutes(what: &str, value: Minutes) -> Result<Ms, EngineError> {
    if value <= 0 || value > MAX_SLOT_MINUTES {
        return Err(EngineError::Validation(format!(
            "{what} must be between 1 and {MAX_SLOT_MINUTES} minutes, got {value}"
        )));
    }
    Ok(value * MS_PER_MINUTE)
}

/// Candidate slots of `duration_min` minutes, every `step_min` minutes, inside
/// each window applicable on `date`. A slot never spans two windows.
pub fn generate_slots<'a>(
    windows: impl IntoIterator<Item = &'a AvailabilityWindow>,
    date: NaiveDate,
    duration_min: Minutes,
    step_min: Minutes,
) -> Result<Slots, EngineError> {
    let duration = validate_minutes("duration", duration_min)?;
    let step = validate_minutes("step", step_min)?;

    let cursors = windows
        .into_iter()
        .filter_map(|w| w.occurrence_on(date))
        .filter(|occ| occ.duration_ms() >= duration)
        .map(|occ| Cursor {
            next_start: occ.start,
            last_start: occ.end - duration,
            step,
        })
        .collect();

    Ok(Slots {
        cursors,
        duration,
        last: None,
    })
}

impl Engine {
    /// Bookable slots for a tutor on `date`: generated candidates minus
    /// anything blocked by an existing appointment or already in the past.
    pub async fn available_slots(
        &self,
        tutor_id: Ulid,
        date: NaiveDate,
        duration_min: Option<Minutes>,
        step_min: Option<Minutes>,
    ) -> Result<Vec<Span>, EngineError> {
        let duration_min = duration_min.unwrap_or(self.policy.default_duration_min);
        let step_min = step_min.unwrap_or(self.policy.default_step_min);

        let Some(ts) = self.get_tutor(&tutor_id) else {
            // Validate anyway so bad parameters fail the same way for every tutor.
            generate_slots(std::iter::empty(), date, duration_min, step_min)?;
            return Ok(Vec::new());
        };
        let guard = ts.read().await;

        let candidates = generate_slots(guard.windows_on(date), date, duration_min, step_min)?;
        // Slots of a window ending at 24:00 still start on `date`.
        let day = day_span(date);
        let horizon = Span::new(day.start, day.end + duration_min * MS_PER_MINUTE);
        let now = now_ms();
        let mut free = filter_free(candidates, guard.overlapping(&horizon));
        free.retain(|slot| slot.start >= now);
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn window(recurrence: Recurrence, start: (u16, u16), end: (u16, u16)) -> AvailabilityWindow {
        AvailabilityWindow {
            id: Ulid::new(),
            tutor_id: Ulid::nil(),
            recurrence,
            start: TimeOfDay::hm(start.0, start.1).unwrap(),
            end: TimeOfDay::hm(end.0, end.1).unwrap(),
        }
    }

    fn at(h: i64, m: i64) -> Ms {
        day_start_ms(monday()) + h * MS_PER_HOUR + m * MS_PER_MINUTE
    }

    #[test]
    fn steps_through_window() {
        let w = window(Recurrence::Weekly { day_of_week: 1 }, (9, 0), (11, 0));
        let slots: Vec<Span> = generate_slots([&w], monday(), 60, 30).unwrap().collect();
        assert_eq!(
            slots,
            vec![
                Span::new(at(9, 0), at(10, 0)),
                Span::new(at(9, 30), at(10, 30)),
                Span::new(at(10, 0), at(11, 0)),
            ]
        );
    }

    #[test]
    fn window_shorter_than_duration_yields_nothing() {
        let w = window(Recurrence::Weekly { day_of_week: 1 }, (9, 0), (9, 45));
        assert_eq!(generate_slots([&w], monday(), 60, 15).unwrap().count(), 0);
    }

    #[test]
    fn step_larger_than_duration_leaves_gaps() {
        let w = window(Recurrence::Weekly { day_of_week: 1 }, (9, 0), (12, 0));
        let starts: Vec<Ms> = generate_slots([&w], monday(), 30, 90)
            .unwrap()
            .map(|s| s.start)
            .collect();
        assert_eq!(starts, vec![at(9, 0), at(10, 30)]);
    }

    #[test]
    fn only_applicable_windows() {
        let weekly_monday = window(Recurrence::Weekly { day_of_week: 1 }, (9, 0), (10, 0));
        let weekly_tuesday = window(Recurrence::Weekly { day_of_week: 2 }, (9, 0), (10, 0));
        let once_today = window(Recurrence::Once { date: monday() }, (14, 0), (15, 0));
        let once_next_week = window(
            Recurrence::Once { date: monday() + chrono::Days::new(7) },
            (16, 0),
            (17, 0),
        );
        let windows = [weekly_monday, weekly_tuesday, once_today, once_next_week];
        let slots: Vec<Span> = generate_slots(&windows, monday(), 60, 30).unwrap().collect();
        assert_eq!(
            slots,
            vec![Span::new(at(9, 0), at(10, 0)), Span::new(at(14, 0), at(15, 0))]
        );
    }

    #[test]
    fn overlapping_windows_merge_in_order_without_duplicates() {
        // second window declared first to check ordering is by time, not declaration
        let late = window(Recurrence::Weekly { day_of_week: 1 }, (10, 0), (12, 0));
        let early = window(Recurrence::Once { date: monday() }, (9, 0), (11, 0));
        let slots: Vec<Span> = generate_slots([&late, &early], monday(), 60, 30).unwrap().collect();
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(
            starts,
            vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30), at(11, 0)]
        );
    }

    #[test]
    fn adjacent_windows_never_produce_a_spanning_slot() {
        let a = window(Recurrence::Weekly { day_of_week: 1 }, (10, 0), (11, 0));
        let b = window(Recurrence::Weekly { day_of_week: 1 }, (11, 0), (12, 0));
        let slots: Vec<Span> = generate_slots([&a, &b], monday(), 60, 30).unwrap().collect();
        assert_eq!(
            slots,
            vec![Span::new(at(10, 0), at(11, 0)), Span::new(at(11, 0), at(12, 0))]
        );
        for slot in &slots {
            assert!(a.contains(slot) || b.contains(slot));
        }
    }

    #[test]
    fn window_ending_at_midnight() {
        let mut w = window(Recurrence::Weekly { day_of_week: 1 }, (23, 0), (23, 0));
        w.end = TimeOfDay::END_OF_DAY;
        let slots: Vec<Span> = generate_slots([&w], monday(), 60, 30).unwrap().collect();
        assert_eq!(slots, vec![Span::new(at(23, 0), at(24, 0))]);
    }

    #[test]
    fn clone_restarts_sequence() {
        let w = window(Recurrence::Weekly { day_of_week: 1 }, (8, 0), (18, 0));
        let slots = generate_slots([&w], monday(), 45, 15).unwrap();
        let first: Vec<Span> = slots.clone().collect();
        let second: Vec<Span> = slots.collect();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|p| p[0].start < p[1].start));
    }

    #[test]
    fn rejects_bad_duration_and_step() {
        let w = window(Recurrence::Weekly { day_of_week: 1 }, (9, 0), (10, 0));
        assert!(matches!(
            generate_slots([&w], monday(), 0, 30),
            Err(EngineError::Validation(_))
        ));
        assert!(generate_slots([&w], monday(), 60, 0).is_err());
        assert!(generate_slots([&w], monday(), MAX_SLOT_MINUTES + 1, 30).is_err());
        assert!(generate_slots([&w], monday(), MAX_SLOT_MINUTES, MAX_SLOT_MINUTES).is_ok());
    }
}
