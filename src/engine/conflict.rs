use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_LESSON_DURATION_MS {
        return Err(EngineError::LimitExceeded("lesson too long"));
    }
    Ok(())
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Drop every candidate that intersects a scheduled or completed appointment.
/// Cancelled and no-show appointments never block. Candidate order is kept.
pub fn filter_free<'a>(
    candidates: impl IntoIterator<Item = Span>,
    appointments: impl IntoIterator<Item = &'a Appointment>,
) -> Vec<Span> {
    let mut busy: Vec<Span> = appointments
        .into_iter()
        .filter(|a| a.status.blocks())
        .map(|a| a.span)
        .collect();
    busy.sort_by_key(|s| s.start);
    // Merged spans are disjoint and sorted by both start and end.
    let busy = merge_overlapping(&busy);

    candidates
        .into_iter()
        .filter(|slot| {
            let first_ending_after = busy.partition_point(|b| b.end <= slot.start);
            busy.get(first_ending_after)
                .is_none_or(|b| !b.overlaps(slot))
        })
        .collect()
}

/// First blocking appointment intersecting `span`, skipping `ignore`.
pub fn first_conflict(ts: &TutorState, span: &Span, ignore: Option<Ulid>) -> Option<Ulid> {
    ts.overlapping(span)
        .find(|a| a.status.blocks() && Some(a.id) != ignore)
        .map(|a| a.id)
}

/// True if `span` lies inside a single window applicable on its start date.
pub fn fits_window(ts: &TutorState, span: &Span) -> bool {
    ts.windows.iter().any(|w| w.contains(span))
}

/// Commit-time predicate: inside one window and clear of blocking appointments.
pub fn slot_is_free(ts: &TutorState, span: &Span, ignore: Option<Ulid>) -> bool {
    fits_window(ts, span) && first_conflict(ts, span, ignore).is_none()
}

/// Store-level exclusion check. Caller holds the tutor write lock.
pub(super) fn check_no_overlap(
    ts: &TutorState,
    span: &Span,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(ts, span, ignore) {
        Some(existing) => Err(EngineError::Overlap(existing)),
        None => Ok(()),
    }
}

impl Engine {
    /// Re-validate a proposed slot against the tutor's current state.
    pub async fn is_free(&self, tutor_id: Ulid, span: &Span) -> bool {
        let Some(ts) = self.get_tutor(&tutor_id) else {
            return false;
        };
        let guard = ts.read().await;
        slot_is_free(&guard, span, None)
    }
}
