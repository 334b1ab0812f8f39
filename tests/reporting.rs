mod common;

use chrono::Duration;
use common::{at, FixedCount};
use planwarden::{
    highest_severity, AfterLimit, Billable, Cap, CheckOptions, InMemoryStateStore, LimitChecker,
    LimitSpec, ManualClock, PeriodSpec, Plan, PlanRegistry, Severity,
};
use std::sync::Arc;

fn registry() -> Arc<PlanRegistry> {
    let plan = Plan::builder("free")
        .limit(LimitSpec::builder("projects").to(3).grace(Duration::days(7)).build().unwrap())
        .limit(
            LimitSpec::builder("exports")
                .to(10)
                .per(PeriodSpec::Month)
                .after_limit(AfterLimit::BlockUsage)
                .build()
                .unwrap(),
        )
        .limit(LimitSpec::builder("members").unlimited().build().unwrap())
        .build()
        .unwrap();
    Arc::new(PlanRegistry::builder().plan(plan).default_plan("free").build().unwrap())
}

#[tokio::test]
async fn snapshot_reports_every_limit_without_mutating() {
    let t = at(2025, 4, 10, 0);
    let clock = ManualClock::new(t);
    let projects = FixedCount::new(3);
    let states = InMemoryStateStore::new();
    let checker = LimitChecker::builder(registry())
        .live_count("projects", projects.clone())
        .live_count("members", FixedCount::new(42))
        .state_store(states.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    let org = Billable::new("org_1");

    let before = checker.snapshot(&org).await.unwrap();
    assert!(states.is_empty(), "snapshot never writes state");
    let keys: Vec<&str> = before.iter().map(|s| s.limit.as_str()).collect();
    assert_eq!(keys, vec!["exports", "members", "projects"]);

    let members = &before[1];
    assert_eq!(members.cap, Cap::Unlimited);
    assert_eq!(members.current_usage, 42);
    assert_eq!(members.remaining, None);
    assert_eq!(members.severity(), Severity::Ok);

    let exports = &before[0];
    assert_eq!(exports.window.map(|w| w.start), Some(at(2025, 4, 1, 0)));
    assert_eq!(exports.remaining, Some(10));

    checker.evaluate(&org, "projects", CheckOptions::by(1)).await.unwrap();
    projects.set(4);
    clock.advance(Duration::days(1));

    let during = checker.status(&org, "projects").await.unwrap().unwrap();
    assert!(during.grace_active);
    assert!(during.allowed);
    assert_eq!(during.grace_ends_at, Some(t + Duration::days(7)));
    assert_eq!(during.percent_used.map(|p| p.round()), Some(133.0));
    assert_eq!(checker.overage(&org, "projects").await.unwrap(), 1);

    clock.advance(Duration::days(7));
    let after = checker.snapshot(&org).await.unwrap();
    assert!(after[2].blocked);
    assert!(!after[2].grace_active);
    assert_eq!(highest_severity(&after), Severity::Blocked);
    assert!(checker.blocked(&org, "projects").await.unwrap());
    assert!(checker.status(&org, "webhooks").await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_allowance_reports_blocked_for_block_usage() {
    let checker = LimitChecker::builder(registry())
        .live_count("projects", FixedCount::new(0))
        .live_count("members", FixedCount::new(0))
        .clock(ManualClock::new(at(2025, 4, 10, 0)))
        .build()
        .unwrap();
    let org = Billable::new("org_1");

    checker.commit(&org, "exports", CheckOptions::by(10)).await.unwrap();
    let status = checker.status(&org, "exports").await.unwrap().unwrap();
    assert_eq!(status.remaining, Some(0));
    assert!(status.blocked);
    assert_eq!(status.severity(), Severity::Blocked);
    assert_eq!(status.warning_threshold, Some(0.95));
}
