use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Lesson time is accounted in whole minutes.
pub type Minutes = i64;

pub const MS_PER_MINUTE: Ms = 60_000;
pub const MS_PER_HOUR: Ms = 60 * MS_PER_MINUTE;
pub const MS_PER_DAY: Ms = 24 * MS_PER_HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Length in whole minutes, rounded down.
    pub fn duration_minutes(&self) -> Minutes {
        self.duration_ms() / MS_PER_MINUTE
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

/// Midnight UTC of `date`.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// The whole UTC day of `date` as a span.
pub fn day_span(date: NaiveDate) -> Span {
    let start = day_start_ms(date);
    Span::new(start, start + MS_PER_DAY)
}

/// UTC calendar date containing the instant.
pub fn date_of(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// Sunday = 0 … Saturday = 6.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Minute of the day in `0..=1440`. `24:00` is only meaningful as a window end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(1440);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= Self::END_OF_DAY.0).then_some(Self(minutes))
    }

    pub fn hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour.checked_mul(60)?.checked_add(minute)?)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// The instant this time of day falls on `date` (UTC).
    pub fn on(self, date: NaiveDate) -> Ms {
        day_start_ms(date) + self.0 as Ms * MS_PER_MINUTE
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    /// Accepts `HH:MM` and `HH:MM:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let mut next = |what: &str| -> Result<u16, String> {
            parts
                .next()
                .ok_or_else(|| format!("bad time {s:?}: missing {what}"))?
                .parse::<u16>()
                .map_err(|e| format!("bad time {s:?}: {e}"))
        };
        let hour = next("hour")?;
        let minute = next("minute")?;
        if let Some(sec) = parts.next()
            && sec != "00" && sec != "0" {
                return Err(format!("bad time {s:?}: seconds are not supported"));
            }
        if parts.next().is_some() {
            return Err(format!("bad time {s:?}"));
        }
        TimeOfDay::hm(hour, minute).ok_or_else(|| format!("time out of range: {s:?}"))
    }
}

// ── Availability ─────────────────────────────────────────────────

/// When a window applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recurrence {
    /// Every week on this day (Sunday = 0).
    Weekly { day_of_week: u8 },
    /// Exactly once, on this date.
    Once { date: NaiveDate },
}

impl Recurrence {
    pub fn applies_to(&self, date: NaiveDate) -> bool {
        match self {
            Recurrence::Weekly { day_of_week: d } => *d == day_of_week(date),
            Recurrence::Once { date: on } => *on == date,
        }
    }
}

/// A tutor-declared interval of time-of-day during which lessons may be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub recurrence: Recurrence,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl AvailabilityWindow {
    /// The concrete span this window covers on `date`, if it applies that day.
    pub fn occurrence_on(&self, date: NaiveDate) -> Option<Span> {
        if !self.recurrence.applies_to(date) || self.start >= self.end {
            return None;
        }
        Some(Span::new(self.start.on(date), self.end.on(date)))
    }

    /// True if `span` lies inside the occurrence on the span's start date.
    pub fn contains(&self, span: &Span) -> bool {
        date_of(span.start)
            .and_then(|date| self.occurrence_on(date))
            .is_some_and(|occ| occ.contains_span(span))
    }
}

/// Columns set by an `UPDATE availability_windows`. `None` keeps the stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowPatch {
    pub recurrence: Option<Recurrence>,
    pub start: Option<TimeOfDay>,
    pub end: Option<TimeOfDay>,
}

impl WindowPatch {
    pub fn apply(&self, window: &AvailabilityWindow) -> AvailabilityWindow {
        AvailabilityWindow {
            id: window.id,
            tutor_id: window.tutor_id,
            recurrence: self.recurrence.unwrap_or(window.recurrence),
            start: self.start.unwrap_or(window.start),
            end: self.end.unwrap_or(window.end),
        }
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    /// Whether an appointment in this status occupies the tutor's time.
    pub fn blocks(&self) -> bool {
        matches!(self, AppointmentStatus::Scheduled | AppointmentStatus::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AppointmentStatus::Scheduled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "no_show" | "noshow" | "no-show" => Ok(AppointmentStatus::NoShow),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub student_id: Ulid,
    pub tutor_id: Ulid,
    pub course_id: Option<Ulid>,
    pub span: Span,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub credited_back: bool,
    /// Ledger reservation this appointment consumed.
    pub reservation_id: Ulid,
    /// Set when the appointment was rescheduled; its hours moved to that appointment.
    pub carried_to: Option<Ulid>,
    pub created_at: Ms,
}

impl Appointment {
    pub fn minutes(&self) -> Minutes {
        self.span.duration_minutes()
    }

    pub fn balance_key(&self) -> BalanceKey {
        BalanceKey::new(self.student_id, self.course_id)
    }
}

// ── Balances ─────────────────────────────────────────────────────

/// A student's balance, optionally scoped to one course enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub student_id: Ulid,
    pub course_id: Option<Ulid>,
}

impl BalanceKey {
    pub fn new(student_id: Ulid, course_id: Option<Ulid>) -> Self {
        Self { student_id, course_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoursBalance {
    pub key: BalanceKey,
    pub total_purchased: Minutes,
    pub used: Minutes,
}

impl HoursBalance {
    pub fn empty(key: BalanceKey) -> Self {
        Self {
            key,
            total_purchased: 0,
            used: 0,
        }
    }

    pub fn available(&self) -> Minutes {
        self.total_purchased - self.used
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Tutor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Tutor => "tutor",
            Role::Admin => "admin",
        }
    }
}

/// Authenticated caller, supplied by the identity layer and trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn student(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Student }
    }

    pub fn tutor(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Tutor }
    }

    pub fn admin() -> Self {
        Self { user_id: Ulid::nil(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Per-tutor state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TutorState {
    pub id: Ulid,
    /// Declared windows, in insertion order.
    pub windows: Vec<AvailabilityWindow>,
    /// All appointments ever booked with this tutor, sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl TutorState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            windows: Vec::new(),
            appointments: Vec::new(),
        }
    }

    pub fn window(&self, id: Ulid) -> Option<&AvailabilityWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    /// Windows applicable on `date`.
    pub fn windows_on(&self, date: NaiveDate) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows
            .iter()
            .filter(move |w| w.recurrence.applies_to(date))
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Return only appointments whose span overlaps the query window.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

/// WAL event types. Flat, no nesting beyond the records they carry.
/// This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowUpdated {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
        tutor_id: Ulid,
    },
    HoursPurchased {
        key: BalanceKey,
        minutes: Minutes,
    },
    HoursReserved {
        reservation_id: Ulid,
        key: BalanceKey,
        minutes: Minutes,
    },
    /// Returns reserved minutes; `reservation_id` is set when undoing a reservation.
    HoursReleased {
        reservation_id: Option<Ulid>,
        key: BalanceKey,
        minutes: Minutes,
    },
    /// Compaction snapshot of a balance.
    BalanceRestored {
        key: BalanceKey,
        total_purchased: Minutes,
        used: Minutes,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentStatusChanged {
        id: Ulid,
        tutor_id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentCreditedBack {
        id: Ulid,
        tutor_id: Ulid,
        key: BalanceKey,
        minutes: Minutes,
    },
    AppointmentRescheduled {
        old_id: Ulid,
        replacement: Appointment,
    },
}

impl Event {
    /// Tutor whose state this event touches.
    pub fn tutor_id(&self) -> Option<Ulid> {
        match self {
            Event::WindowAdded { window } | Event::WindowUpdated { window } => Some(window.tutor_id),
            Event::WindowRemoved { tutor_id, .. }
            | Event::AppointmentStatusChanged { tutor_id, .. }
            | Event::AppointmentCreditedBack { tutor_id, .. } => Some(*tutor_id),
            Event::AppointmentCreated { appointment } => Some(appointment.tutor_id),
            Event::AppointmentRescheduled { replacement, .. } => Some(replacement.tutor_id),
            Event::HoursPurchased { .. }
            | Event::HoursReserved { .. }
            | Event::HoursReleased { .. }
            | Event::BalanceRestored { .. } => None,
        }
    }

    /// Balance this event touches.
    pub fn balance_key(&self) -> Option<&BalanceKey> {
        match self {
            Event::HoursPurchased { key, .. }
            | Event::HoursReserved { key, .. }
            | Event::HoursReleased { key, .. }
            | Event::BalanceRestored { key, .. }
            | Event::AppointmentCreditedBack { key, .. } => Some(key),
            _ => None,
        }
    }
}
