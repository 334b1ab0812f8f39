//! Enforcement event delivery.
//!
//! Transitions produce [`EnforcementEvent`]s which flow through an
//! [`EventSink`], a `tower::Service<EnforcementEvent>`. Sinks compose with
//! [`MulticastSink`] and are always driven through [`emit_best_effort`]: a
//! failing sink is logged and never undoes a committed transition.
//!
//! ```rust
//! use planwarden::telemetry::{EnforcementEvent, MemorySink};
//! use planwarden::BillableId;
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = EnforcementEvent::Blocked {
//!     billable: BillableId::new("org_1"),
//!     limit: "projects".into(),
//! };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

pub mod events;
pub mod sinks;

pub use events::{event_to_json, EnforcementEvent};
pub use sinks::{
    emit_best_effort, CallbackSink, EventSink, LogSink, MemorySink, MulticastSink, NullSink,
    SinkFailure,
};
