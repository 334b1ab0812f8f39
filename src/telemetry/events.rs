use crate::billable::BillableId;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;

/// Notifications produced by enforcement transitions.
///
/// Each event is produced at most once per threshold (warnings) or per exceed
/// episode (grace start, block) and only after the state change that caused it
/// has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum EnforcementEvent {
    /// Usage crossed a warning threshold.
    Warning {
        billable: BillableId,
        limit: String,
        /// Fraction of the cap, in (0, 1]
        threshold: f64,
    },
    /// Usage went over the cap and a grace period started.
    GraceStarted {
        billable: BillableId,
        limit: String,
        /// When blocking begins if usage stays over the cap
        ends_at: DateTime<Utc>,
    },
    /// The billable is now blocked on this limit.
    Blocked { billable: BillableId, limit: String },
}

impl EnforcementEvent {
    pub fn billable(&self) -> &BillableId {
        match self {
            EnforcementEvent::Warning { billable, .. }
            | EnforcementEvent::GraceStarted { billable, .. }
            | EnforcementEvent::Blocked { billable, .. } => billable,
        }
    }

    pub fn limit(&self) -> &str {
        match self {
            EnforcementEvent::Warning { limit, .. }
            | EnforcementEvent::GraceStarted { limit, .. }
            | EnforcementEvent::Blocked { limit, .. } => limit,
        }
    }

    /// Stable snake_case name, used as the `kind` field in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            EnforcementEvent::Warning { .. } => "warning",
            EnforcementEvent::GraceStarted { .. } => "grace_started",
            EnforcementEvent::Blocked { .. } => "blocked",
        }
    }
}

impl fmt::Display for EnforcementEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementEvent::Warning { billable, limit, threshold } => {
                write!(f, "Warning({}/{}, threshold={})", billable, limit, threshold)
            }
            EnforcementEvent::GraceStarted { billable, limit, ends_at } => {
                write!(f, "GraceStarted({}/{}, ends_at={})", billable, limit, ends_at.to_rfc3339())
            }
            EnforcementEvent::Blocked { billable, limit } => {
                write!(f, "Blocked({}/{})", billable, limit)
            }
        }
    }
}

/// Flat JSON rendering shared by structured sinks.
pub fn event_to_json(event: &EnforcementEvent) -> serde_json::Value {
    match event {
        EnforcementEvent::Warning { billable, limit, threshold } => json!({
            "kind": event.kind(),
            "billable": billable.as_str(),
            "limit": limit,
            "threshold": threshold,
        }),
        EnforcementEvent::GraceStarted { billable, limit, ends_at } => json!({
            "kind": event.kind(),
            "billable": billable.as_str(),
            "limit": limit,
            "ends_at": ends_at.to_rfc3339(),
        }),
        EnforcementEvent::Blocked { billable, limit } => json!({
            "kind": event.kind(),
            "billable": billable.as_str(),
            "limit": limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn org() -> BillableId {
        BillableId::new("org_1")
    }

    #[test]
    fn display_names_variant_and_key() {
        let warning =
            EnforcementEvent::Warning { billable: org(), limit: "projects".into(), threshold: 0.8 };
        assert_eq!(warning.to_string(), "Warning(org_1/projects, threshold=0.8)");

        let blocked = EnforcementEvent::Blocked { billable: org(), limit: "seats".into() };
        assert_eq!(blocked.to_string(), "Blocked(org_1/seats)");
        assert_eq!(blocked.limit(), "seats");
        assert_eq!(blocked.billable(), &org());
    }

    #[test]
    fn grace_started_json() {
        let ends_at = Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap();
        let v = event_to_json(&EnforcementEvent::GraceStarted {
            billable: org(),
            limit: "projects".into(),
            ends_at,
        });
        assert_eq!(v["kind"], "grace_started");
        assert_eq!(v["billable"], "org_1");
        assert_eq!(v["limit"], "projects");
        assert_eq!(v["ends_at"], "2025-01-08T00:00:00+00:00");
    }

    #[test]
    fn warning_json_carries_threshold() {
        let v = event_to_json(&EnforcementEvent::Warning {
            billable: org(),
            limit: "exports".into(),
            threshold: 0.95,
        });
        assert_eq!(v["kind"], "warning");
        assert_eq!(v["threshold"], 0.95);
    }
}
