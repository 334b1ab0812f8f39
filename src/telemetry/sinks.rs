use super::events::EnforcementEvent;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A sink that consumes enforcement events.
pub trait EventSink:
    tower::Service<EnforcementEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event`, logging rather than propagating any sink failure.
///
/// Sinks are notifications, not transaction participants: the state change that
/// produced the event is already committed when this runs.
pub async fn emit_best_effort<S>(sink: S, event: EnforcementEvent)
where
    S: tower::Service<EnforcementEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    let label = event.to_string();
    match sink.ready_oneshot().await {
        Ok(mut ready_sink) => {
            if let Err(e) = ready_sink.call(event).await {
                tracing::warn!(event = %label, error = %e, "enforcement event sink failed");
            }
        }
        Err(e) => tracing::warn!(event = %label, error = %e, "enforcement event sink not ready"),
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<EnforcementEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: EnforcementEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing` at INFO with the billable and limit as fields.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<EnforcementEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: EnforcementEvent) -> Self::Future {
        tracing::info!(
            kind = event.kind(),
            billable = %event.billable(),
            limit = event.limit(),
            event = %event,
            "enforcement_event"
        );
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for LogSink {
    type SinkError = Infallible;
}

/// Bounded in-memory event buffer; the oldest event is evicted when full.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<EnforcementEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<EnforcementEvent> {
        self.events.lock().expect("memory sink poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("memory sink poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("memory sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<EnforcementEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: EnforcementEvent) -> Self::Future {
        let mut guard = self.events.lock().expect("memory sink poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for MemorySink {
    type SinkError = Infallible;
}

/// Boxed error returned by host callbacks and composed sinks.
#[derive(Debug)]
pub struct SinkFailure(Box<dyn std::error::Error + Send + Sync>);

impl SinkFailure {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

impl fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event sink error: {}", self.0)
    }
}

impl std::error::Error for SinkFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

type WarningFn = dyn Fn(&crate::BillableId, &str, f64) -> Result<(), SinkFailure> + Send + Sync;
type GraceFn = dyn Fn(&crate::BillableId, &str, chrono::DateTime<chrono::Utc>) -> Result<(), SinkFailure>
    + Send
    + Sync;
type BlockFn = dyn Fn(&crate::BillableId, &str) -> Result<(), SinkFailure> + Send + Sync;

/// Routes each event kind to an optional host callback.
///
/// Unregistered kinds are ignored. Callbacks run synchronously on the caller's
/// task.
#[derive(Clone, Default)]
pub struct CallbackSink {
    on_warning: Option<Arc<WarningFn>>,
    on_grace_start: Option<Arc<GraceFn>>,
    on_block: Option<Arc<BlockFn>>,
}

impl CallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_warning<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::BillableId, &str, f64) -> Result<(), SinkFailure> + Send + Sync + 'static,
    {
        self.on_warning = Some(Arc::new(f));
        self
    }

    pub fn on_grace_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::BillableId, &str, chrono::DateTime<chrono::Utc>) -> Result<(), SinkFailure>
            + Send
            + Sync
            + 'static,
    {
        self.on_grace_start = Some(Arc::new(f));
        self
    }

    pub fn on_block<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::BillableId, &str) -> Result<(), SinkFailure> + Send + Sync + 'static,
    {
        self.on_block = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink")
            .field("on_warning", &self.on_warning.is_some())
            .field("on_grace_start", &self.on_grace_start.is_some())
            .field("on_block", &self.on_block.is_some())
            .finish()
    }
}

impl Service<EnforcementEvent> for CallbackSink {
    type Response = ();
    type Error = SinkFailure;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: EnforcementEvent) -> Self::Future {
        let result = match &event {
            EnforcementEvent::Warning { billable, limit, threshold } => {
                self.on_warning.as_ref().map_or(Ok(()), |f| f(billable, limit, *threshold))
            }
            EnforcementEvent::GraceStarted { billable, limit, ends_at } => {
                self.on_grace_start.as_ref().map_or(Ok(()), |f| f(billable, limit, *ends_at))
            }
            EnforcementEvent::Blocked { billable, limit } => {
                self.on_block.as_ref().map_or(Ok(()), |f| f(billable, limit))
            }
        };
        Box::pin(async move { result })
    }
}

impl EventSink for CallbackSink {
    type SinkError = SinkFailure;
}

/// Fans each event out to two sinks concurrently.
///
/// Both sinks always receive the event; the first error is reported.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<EnforcementEvent> for MulticastSink<A, B>
where
    A: tower::Service<EnforcementEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<EnforcementEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = SinkFailure;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: EnforcementEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_clone));
            res_a.map_err(SinkFailure::new)?;
            res_b.map_err(SinkFailure::new)?;
            Ok(())
        })
    }
}

impl<A, B> EventSink for MulticastSink<A, B>
where
    A: tower::Service<EnforcementEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<EnforcementEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = SinkFailure;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BillableId;
    use std::sync::atomic::AtomicUsize;

    fn blocked(limit: &str) -> EnforcementEvent {
        EnforcementEvent::Blocked { billable: BillableId::new("org_1"), limit: limit.into() }
    }

    fn warning(threshold: f64) -> EnforcementEvent {
        EnforcementEvent::Warning {
            billable: BillableId::new("org_1"),
            limit: "projects".into(),
            threshold,
        }
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.call(blocked("projects")).await.unwrap();
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        sink.call(warning(0.6)).await.unwrap();
        sink.call(warning(0.8)).await.unwrap();
        sink.call(blocked("projects")).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events(), vec![warning(0.8), blocked("projects")]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn callback_sink_routes_by_kind() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let blocks = Arc::new(AtomicUsize::new(0));
        let (w, b) = (warnings.clone(), blocks.clone());
        let mut sink = CallbackSink::new()
            .on_warning(move |_, _, _| {
                w.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_block(move |_, limit| {
                assert_eq!(limit, "projects");
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        sink.call(warning(0.6)).await.unwrap();
        sink.call(blocked("projects")).await.unwrap();
        sink.call(EnforcementEvent::GraceStarted {
            billable: BillableId::new("org_1"),
            limit: "projects".into(),
            ends_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(blocks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multicast_delivers_to_both_even_when_one_fails() {
        let memory = MemorySink::new();
        let failing = CallbackSink::new().on_block(|_, _| Err(SinkFailure::new("mailer down")));
        let mut sink = MulticastSink::new(failing, memory.clone());

        let err = sink.call(blocked("projects")).await.unwrap_err();
        assert!(err.to_string().contains("mailer down"));
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_errors() {
        let failing = CallbackSink::new().on_warning(|_, _, _| Err(SinkFailure::new("boom")));
        emit_best_effort(failing, warning(0.8)).await;
    }

    #[tokio::test]
    async fn log_sink_accepts_events() {
        let mut sink = LogSink;
        sink.call(warning(0.95)).await.unwrap();
    }
}
