//! Identity and billing context of the entity a plan is enforced against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a billable (account, organization, user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillableId(String);

impl BillableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BillableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BillableId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BillableId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Billing-cycle anchor supplied by the billing collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingAnchor {
    /// Current subscription period, used verbatim.
    CurrentPeriod { start: DateTime<Utc>, end: DateTime<Utc> },
    /// Subscription creation time; windows repeat monthly from it.
    SubscribedAt(DateTime<Utc>),
}

/// A billable plus whatever the caller already knows about its subscription.
///
/// The core never fetches this itself; the surrounding application fills it in
/// from its own billing records before asking for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Billable {
    id: BillableId,
    anchor: Option<BillingAnchor>,
    subscribed_plan: Option<String>,
}

impl Billable {
    pub fn new(id: impl Into<BillableId>) -> Self {
        Self { id: id.into(), anchor: None, subscribed_plan: None }
    }

    /// Attach the current billing period reported by the billing provider.
    pub fn with_billing_period(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.anchor = Some(BillingAnchor::CurrentPeriod { start, end });
        self
    }

    /// Attach the subscription creation time as a fallback anchor.
    pub fn with_subscribed_at(mut self, at: DateTime<Utc>) -> Self {
        if !matches!(self.anchor, Some(BillingAnchor::CurrentPeriod { .. })) {
            self.anchor = Some(BillingAnchor::SubscribedAt(at));
        }
        self
    }

    /// Plan key derived from an active subscription, if any.
    pub fn with_subscribed_plan(mut self, plan: impl Into<String>) -> Self {
        self.subscribed_plan = Some(plan.into());
        self
    }

    pub fn id(&self) -> &BillableId {
        &self.id
    }

    pub fn anchor(&self) -> Option<&BillingAnchor> {
        self.anchor.as_ref()
    }

    pub fn subscribed_plan(&self) -> Option<&str> {
        self.subscribed_plan.as_deref()
    }
}
