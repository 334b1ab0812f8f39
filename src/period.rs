//! Period calculator: derives the accounting window a per-period limit counts in.
//!
//! Windows are half-open `[start, end)` and identified by their `start`. The
//! calculator is pure: the same reference time and the same anchors always
//! produce the same window, which is what lets a single increment compare window
//! identity across its read and write.
//!
//! Calendar units are computed in UTC. Weeks start on Monday.

use crate::billable::{Billable, BillableId, BillingAnchor};
use crate::error::WardenError;
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Half-open accounting interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Build a window, rejecting `end <= start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WardenError> {
        if end <= start {
            return Err(WardenError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn length(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Bounds returned by a custom period function; either may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RawWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start: Some(start), end: Some(end) }
    }
}

type CustomFn = dyn Fn(&BillableId, DateTime<Utc>) -> RawWindow + Send + Sync;

/// Caller-defined window function, invoked with the billable and reference time.
#[derive(Clone)]
pub struct CustomPeriod(Arc<CustomFn>);

impl CustomPeriod {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&BillableId, DateTime<Utc>) -> RawWindow + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CustomPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomPeriod(<fn>)")
    }
}

/// How a per-period limit slices time.
#[derive(Debug, Clone)]
pub enum PeriodSpec {
    Day,
    Week,
    Month,
    Year,
    /// Fixed length starting at the beginning of the reference day, so the
    /// window moves with the reference day. At least one day long; shorter
    /// lengths would not contain the reference time.
    Duration(chrono::Duration),
    /// Billing provider period, falling back to a subscription-anchored month,
    /// then to the calendar month.
    BillingCycle,
    Custom(CustomPeriod),
}

impl fmt::Display for PeriodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodSpec::Day => write!(f, "day"),
            PeriodSpec::Week => write!(f, "week"),
            PeriodSpec::Month => write!(f, "month"),
            PeriodSpec::Year => write!(f, "year"),
            PeriodSpec::Duration(d) => write!(f, "duration({}s)", d.num_seconds()),
            PeriodSpec::BillingCycle => write!(f, "billing_cycle"),
            PeriodSpec::Custom(_) => write!(f, "custom"),
        }
    }
}

/// Compute the window containing `reference` for `spec`.
pub fn window(
    spec: &PeriodSpec,
    reference: DateTime<Utc>,
    billable: &Billable,
) -> Result<Window, WardenError> {
    match spec {
        PeriodSpec::Day => {
            let start = start_of_day(reference);
            Window::new(start, offset(start, chrono::Duration::days(1))?)
        }
        PeriodSpec::Week => {
            let back = i64::from(reference.weekday().num_days_from_monday());
            let start = offset(start_of_day(reference), chrono::Duration::days(-back))?;
            Window::new(start, offset(start, chrono::Duration::days(7))?)
        }
        PeriodSpec::Month => calendar_month(reference),
        PeriodSpec::Year => {
            let first = NaiveDate::from_ymd_opt(reference.year(), 1, 1)
                .ok_or_else(|| out_of_range(reference))?;
            let next =
                first.checked_add_months(Months::new(12)).ok_or_else(|| out_of_range(reference))?;
            Window::new(midnight(first), midnight(next))
        }
        PeriodSpec::Duration(length) => {
            let start = start_of_day(reference);
            Window::new(start, offset(start, *length)?)
        }
        PeriodSpec::BillingCycle => match billable.anchor() {
            Some(BillingAnchor::CurrentPeriod { start, end }) => Window::new(*start, *end),
            Some(BillingAnchor::SubscribedAt(anchor)) => anchored_month(*anchor, reference),
            None => calendar_month(reference),
        },
        PeriodSpec::Custom(custom) => {
            let raw = (custom.0)(billable.id(), reference);
            let start = raw.start.ok_or(WardenError::MissingWindowBound { bound: "start" })?;
            let end = raw.end.ok_or(WardenError::MissingWindowBound { bound: "end" })?;
            Window::new(start, end)
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    midnight(at.date_naive())
}

fn out_of_range(at: DateTime<Utc>) -> WardenError {
    WardenError::InvalidWindow { start: at, end: at }
}

fn offset(at: DateTime<Utc>, by: chrono::Duration) -> Result<DateTime<Utc>, WardenError> {
    at.checked_add_signed(by).ok_or_else(|| out_of_range(at))
}

fn calendar_month(reference: DateTime<Utc>) -> Result<Window, WardenError> {
    let first = NaiveDate::from_ymd_opt(reference.year(), reference.month(), 1)
        .ok_or_else(|| out_of_range(reference))?;
    let next = first.checked_add_months(Months::new(1)).ok_or_else(|| out_of_range(reference))?;
    Window::new(midnight(first), midnight(next))
}

fn shift_months(at: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        at.checked_add_months(magnitude)
    } else {
        at.checked_sub_months(magnitude)
    }
}

/// Monthly window repeating from `anchor`. Every boundary is computed from the
/// anchor itself, so a day-31 anchor clamps to short months without drifting.
fn anchored_month(anchor: DateTime<Utc>, reference: DateTime<Utc>) -> Result<Window, WardenError> {
    let mut k = i64::from(reference.year() - anchor.year()) * 12
        + i64::from(reference.month()) - i64::from(anchor.month());
    let mut start = shift_months(anchor, k).ok_or_else(|| out_of_range(reference))?;
    if start > reference {
        k -= 1;
        start = shift_months(anchor, k).ok_or_else(|| out_of_range(reference))?;
    }
    let end = shift_months(anchor, k + 1).ok_or_else(|| out_of_range(reference))?;
    Window::new(start, end)
}
