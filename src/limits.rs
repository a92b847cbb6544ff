use crate::model::{MS_PER_DAY, MS_PER_HOUR, Minutes, Ms};

// ── Tenancy ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Per-tenant state ─────────────────────────────────────────────

pub const MAX_TUTORS_PER_TENANT: usize = 100_000;
pub const MAX_WINDOWS_PER_TUTOR: usize = 512;
pub const MAX_APPOINTMENTS_PER_TUTOR: usize = 100_000;
pub const MAX_NOTES_LEN: usize = 2_000;

// ── Time ─────────────────────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single lesson can't run longer than this.
pub const MAX_LESSON_DURATION_MS: Ms = 12 * MS_PER_HOUR;

/// Upper bound for both slot duration and step.
pub const MAX_SLOT_MINUTES: Minutes = 24 * 60;

/// Widest range accepted by appointment listings.
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * MS_PER_DAY;

// ── Ledger ───────────────────────────────────────────────────────

/// Largest single purchase (10 000 hours).
pub const MAX_PURCHASE_MINUTES: Minutes = 600_000;
