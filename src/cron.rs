//! Cron expression handling.
//!
//! The parser itself is an external collaborator; the engine needs exactly
//! two things from it: validation at definition-load time, and "next
//! occurrence after t". Expressions are 5-field, evaluated in UTC — the
//! runtime forces UTC everywhere, and non-UTC timezones are rejected when
//! definitions are validated.

use std::fmt;

use chrono::{DateTime, Utc};

/// Upper bound on slot-walk iterations, so a pathological floor (years in
/// the past with a `* * * * *` expression) cannot spin a tick.
const MAX_SLOT_WALK: usize = 100_000;

// ---------------------------------------------------------------------------
// CronExpr
// ---------------------------------------------------------------------------

/// A validated 5-field cron expression.
#[derive(Clone)]
pub struct CronExpr {
    raw: String,
    inner: croner::Cron,
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.raw).finish()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl CronExpr {
    /// Parse and validate a 5-field expression.
    ///
    /// # Errors
    /// Returns a [`CronParseError`] carrying the expression and the parser's
    /// reason.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let inner = croner::Cron::new(expr)
            .parse()
            .map_err(|e| CronParseError {
                expr: expr.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            raw: expr.to_owned(),
            inner,
        })
    }

    /// The original expression text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The first occurrence strictly after `after`, or `None` when the
    /// expression has no future occurrence within the parser's horizon.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.find_next_occurrence(&after, false).ok()
    }

    /// The most recent slot `t` with `floor < t ≤ now`.
    ///
    /// This is the catch-up primitive: after downtime, exactly one fire is
    /// emitted for the latest elapsed slot instead of one per missed slot.
    #[must_use]
    pub fn latest_slot_in(&self, floor: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut cursor = floor;
        let mut latest = None;
        for _ in 0..MAX_SLOT_WALK {
            match self.next_after(cursor) {
                Some(t) if t <= now => {
                    latest = Some(t);
                    cursor = t;
                }
                _ => break,
            }
        }
        latest
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A cron expression failed to parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronParseError {
    pub expr: String,
    pub reason: String,
}

impl fmt::Display for CronParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cron expression {:?}: {}", self.expr, self.reason)
    }
}

impl std::error::Error for CronParseError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn parses_five_field() {
        assert!(CronExpr::parse("*/5 * * * *").is_ok());
        assert!(CronExpr::parse("0 3 * * 1-5").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        let err = CronExpr::parse("not a cron").unwrap_err();
        assert_eq!(err.expr, "not a cron");
    }

    #[test]
    fn next_after_is_strict() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        let next = cron.next_after(at(10, 0, 0)).unwrap();
        assert_eq!(next, at(10, 5, 0));
    }

    #[test]
    fn next_after_from_offset() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        let next = cron.next_after(at(10, 2, 30)).unwrap();
        assert_eq!(next, at(10, 5, 0));
    }

    #[test]
    fn latest_slot_catch_up_is_single() {
        // last fire 10:00, daemon back at 10:23 → one fire, for 10:20
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        let slot = cron.latest_slot_in(at(10, 0, 0), at(10, 23, 0)).unwrap();
        assert_eq!(slot, at(10, 20, 0));
    }

    #[test]
    fn latest_slot_none_when_not_due() {
        // between slots nothing fires
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        assert!(cron.latest_slot_in(at(10, 20, 0), at(10, 24, 59)).is_none());
    }

    #[test]
    fn latest_slot_at_exact_boundary() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        assert_eq!(
            cron.latest_slot_in(at(10, 15, 0), at(10, 20, 0)),
            Some(at(10, 20, 0))
        );
    }
}
