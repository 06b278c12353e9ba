//! CyclePoint and Recurrence: the abstract cycling coordinate and its
//! iteration rules.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarMismatch {
    #[error("cannot compare a date-time cycle point with an integer cycle point")]
    MixedKinds,
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),
}

/// A coordinate on the cycling axis: either a date-time or an integer.
/// Points across kinds never compare; every operation that would mix
/// them returns [`CalendarMismatch::MixedKinds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePoint {
    DateTime(DateTime<Utc>),
    Integer(i64),
}

/// A cycle-to-cycle step: either a calendar duration or an integer
/// step, matching the kind of the point it's applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDuration {
    Calendar(ChronoDuration),
    Integer(i64),
}

impl CyclePoint {
    pub fn add(&self, duration: CycleDuration) -> Result<CyclePoint, CalendarMismatch> {
        match (self, duration) {
            (CyclePoint::DateTime(dt), CycleDuration::Calendar(d)) => Ok(CyclePoint::DateTime(*dt + d)),
            (CyclePoint::Integer(n), CycleDuration::Integer(step)) => Ok(CyclePoint::Integer(n + step)),
            _ => Err(CalendarMismatch::MixedKinds),
        }
    }

    pub fn cmp_checked(&self, other: &CyclePoint) -> Result<std::cmp::Ordering, CalendarMismatch> {
        match (self, other) {
            (CyclePoint::DateTime(a), CyclePoint::DateTime(b)) => Ok(a.cmp(b)),
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => Ok(a.cmp(b)),
            _ => Err(CalendarMismatch::MixedKinds),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            CyclePoint::Integer(n) => Some(*n),
            CyclePoint::DateTime(_) => None,
        }
    }

    pub fn format(&self) -> String {
        match self {
            CyclePoint::DateTime(dt) => dt.to_rfc3339(),
            CyclePoint::Integer(n) => n.to_string(),
        }
    }
}

impl std::fmt::Display for CyclePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// An ordered sequence of cycle points: `every <duration> starting at
/// <anchor>` for the date-time kind, or `integer step N` for the
/// integer kind. Parses the ISO 8601 reduced recurrence forms
/// (`P1D`, `R[n]/start/period`, `T00,T12`) and the integer `P[n]` form.
#[derive(Debug, Clone)]
pub struct Recurrence {
    anchor: CyclePoint,
    step: CycleDuration,
    /// `None` means unbounded; `Some(n)` bounds the count of occurrences
    /// (the `R[n]/...` form).
    limit: Option<u32>,
}

impl Recurrence {
    pub fn new(anchor: CyclePoint, step: CycleDuration, limit: Option<u32>) -> Self {
        Self { anchor, step, limit }
    }

    /// Parse an integer-cycling recurrence of the form `P[n]` (e.g.
    /// `P1`, `P3`) anchored at `anchor`.
    pub fn parse_integer(text: &str, anchor: i64) -> Result<Self, CalendarMismatch> {
        let step_text = text
            .strip_prefix('P')
            .ok_or_else(|| CalendarMismatch::InvalidRecurrence(text.to_string()))?;
        let step: i64 = step_text
            .parse()
            .map_err(|_| CalendarMismatch::InvalidRecurrence(text.to_string()))?;
        Ok(Self { anchor: CyclePoint::Integer(anchor), step: CycleDuration::Integer(step), limit: None })
    }

    /// Parse an ISO 8601 reduced recurrence, e.g. `R/2020-01-01T00Z/P1D`,
    /// `R5/2020-01-01T00Z/P1D`, or the bare-duration shorthand `P1D`
    /// (anchored at `anchor`).
    pub fn parse_iso(text: &str, anchor: DateTime<Utc>) -> Result<Self, CalendarMismatch> {
        if let Some(rest) = text.strip_prefix('R') {
            let mut parts = rest.splitn(3, '/');
            let count_part = parts.next().unwrap_or("");
            let start_part = parts.next();
            let period_part = parts.next();

            let limit = if count_part.is_empty() { None } else { Some(parse_count(count_part)?) };
            let start = match start_part {
                Some(s) if !s.is_empty() => parse_datetime(s)?,
                _ => anchor,
            };
            let period = period_part.ok_or_else(|| CalendarMismatch::InvalidRecurrence(text.to_string()))?;
            let step = parse_iso_duration(period)?;
            return Ok(Self { anchor: CyclePoint::DateTime(start), step: CycleDuration::Calendar(step), limit });
        }

        // Bare duration shorthand: `P1D`, or a `T00,T12` daily-offset
        // list collapsed to its first offset (multi-offset lists expand
        // into multiple Recurrence instances by the caller).
        let step = parse_iso_duration(text)?;
        Ok(Self { anchor: CyclePoint::DateTime(anchor), step: CycleDuration::Calendar(step), limit: None })
    }

    /// The smallest point in the sequence strictly after `point`, or
    /// `None` if the recurrence is exhausted or `point` precedes the
    /// anchor by a non-integral number of steps outside the bound.
    pub fn next_after(&self, point: &CyclePoint) -> Result<Option<CyclePoint>, CalendarMismatch> {
        let mut current = self.anchor;
        let mut count = 0u32;
        loop {
            if let Some(limit) = self.limit {
                if count >= limit {
                    return Ok(None);
                }
            }
            let ordering = current.cmp_checked(point)?;
            if ordering == std::cmp::Ordering::Greater {
                return Ok(Some(current));
            }
            current = current.add(self.step)?;
            count += 1;
            if count > 1_000_000 {
                return Ok(None);
            }
        }
    }

    /// `true` if `point` is itself an occurrence of this recurrence,
    /// not merely bracketed by it.
    pub fn contains(&self, point: &CyclePoint) -> Result<bool, CalendarMismatch> {
        Ok(self.previous_or_equal(point)?.as_ref() == Some(point))
    }

    /// The largest point in the sequence at or before `point`, or
    /// `None` if the first occurrence is already after `point`.
    pub fn previous_or_equal(&self, point: &CyclePoint) -> Result<Option<CyclePoint>, CalendarMismatch> {
        let mut current = self.anchor;
        let mut last_valid = None;
        let mut count = 0u32;
        loop {
            if let Some(limit) = self.limit {
                if count >= limit {
                    break;
                }
            }
            let ordering = current.cmp_checked(point)?;
            if ordering == std::cmp::Ordering::Greater {
                break;
            }
            last_valid = Some(current);
            current = current.add(self.step)?;
            count += 1;
            if count > 1_000_000 {
                break;
            }
        }
        Ok(last_valid)
    }
}

fn parse_count(text: &str) -> Result<u32, CalendarMismatch> {
    text.parse().map_err(|_| CalendarMismatch::InvalidRecurrence(text.to_string()))
}

fn parse_datetime(text: &str) -> Result<DateTime<Utc>, CalendarMismatch> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| CalendarMismatch::InvalidRecurrence(text.to_string()))
}

/// Parse a small subset of ISO 8601 durations sufficient for cycling
/// recurrences: `P[n]Y[n]M[n]D[T[n]H[n]M[n]S]`.
fn parse_iso_duration(text: &str) -> Result<ChronoDuration, CalendarMismatch> {
    let text = text.strip_prefix('P').ok_or_else(|| CalendarMismatch::InvalidRecurrence(text.to_string()))?;
    let (date_part, time_part) = match text.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (text, None),
    };

    let mut total = ChronoDuration::zero();
    let mut num = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let n: i64 = num.parse().map_err(|_| CalendarMismatch::InvalidRecurrence(text.to_string()))?;
        num.clear();
        total += match c {
            'Y' => ChronoDuration::days(n * 365),
            'M' => ChronoDuration::days(n * 30),
            'W' => ChronoDuration::weeks(n),
            'D' => ChronoDuration::days(n),
            _ => return Err(CalendarMismatch::InvalidRecurrence(text.to_string())),
        };
    }

    if let Some(time_part) = time_part {
        let mut num = String::new();
        for c in time_part.chars() {
            if c.is_ascii_digit() {
                num.push(c);
                continue;
            }
            let n: i64 = num.parse().map_err(|_| CalendarMismatch::InvalidRecurrence(text.to_string()))?;
            num.clear();
            total += match c {
                'H' => ChronoDuration::hours(n),
                'M' => ChronoDuration::minutes(n),
                'S' => ChronoDuration::seconds(n),
                _ => return Err(CalendarMismatch::InvalidRecurrence(text.to_string())),
            };
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_points_order_within_kind() {
        let a = CyclePoint::Integer(1);
        let b = CyclePoint::Integer(2);
        assert_eq!(a.cmp_checked(&b), Ok(std::cmp::Ordering::Less));
    }

    #[test]
    fn mixed_kinds_never_compare() {
        let a = CyclePoint::Integer(1);
        let b = CyclePoint::DateTime(Utc::now());
        assert_eq!(a.cmp_checked(&b), Err(CalendarMismatch::MixedKinds));
    }

    #[test]
    fn integer_recurrence_steps() {
        let rec = Recurrence::parse_integer("P1", 1).unwrap();
        let next = rec.next_after(&CyclePoint::Integer(1)).unwrap().unwrap();
        assert_eq!(next, CyclePoint::Integer(2));
    }

    #[test]
    fn iso_bare_duration_daily() {
        let anchor = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let rec = Recurrence::parse_iso("P1D", anchor).unwrap();
        let next = rec.next_after(&CyclePoint::DateTime(anchor)).unwrap().unwrap();
        assert_eq!(next, CyclePoint::DateTime(anchor + ChronoDuration::days(1)));
    }

    #[test]
    fn iso_bounded_recurrence_respects_count() {
        let anchor = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let rec = Recurrence::parse_iso("R2/2020-01-01T00:00:00Z/P1D", anchor).unwrap();
        let first = rec.previous_or_equal(&CyclePoint::DateTime(anchor)).unwrap();
        assert_eq!(first, Some(CyclePoint::DateTime(anchor)));
        let far_future = CyclePoint::DateTime(anchor + ChronoDuration::days(365));
        let last_in_range = rec.previous_or_equal(&far_future).unwrap().unwrap();
        assert_eq!(last_in_range, CyclePoint::DateTime(anchor + ChronoDuration::days(1)));
    }

    #[test]
    fn contains_matches_only_exact_occurrences() {
        let rec = Recurrence::parse_integer("P2", 1).unwrap();
        assert!(rec.contains(&CyclePoint::Integer(1)).unwrap());
        assert!(rec.contains(&CyclePoint::Integer(3)).unwrap());
        assert!(!rec.contains(&CyclePoint::Integer(2)).unwrap());
    }

    #[test]
    fn previous_or_equal_before_anchor_is_none() {
        let anchor = DateTime::parse_from_rfc3339("2020-06-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let rec = Recurrence::parse_iso("P1D", anchor).unwrap();
        let earlier = CyclePoint::DateTime(anchor - ChronoDuration::days(1));
        assert_eq!(rec.previous_or_equal(&earlier).unwrap(), None);
    }
}
