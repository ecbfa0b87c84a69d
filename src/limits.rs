use crate::model::Ms;

// ── Shops ────────────────────────────────────────────────────────

pub const MAX_SHOPS: usize = 256;
pub const MAX_SHOP_NAME_LEN: usize = 128;

// ── Mechanics ────────────────────────────────────────────────────

pub const MAX_MECHANICS_PER_SHOP: usize = 1_000;
pub const MAX_NAME_LEN: usize = 256;

// ── Visits ───────────────────────────────────────────────────────

pub const MAX_VISITS_PER_MECHANIC: usize = 100_000;
pub const MAX_SERVICES_PER_VISIT: usize = 32;

/// A visit never spans more than one day.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
