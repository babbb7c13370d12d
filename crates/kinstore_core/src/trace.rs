//! Tracing sink consumed by the service layer.
//!
//! # Responsibility
//! - Let callers plug in span collection without coupling behavior to it.
//! - Provide a no-op sink and a log-backed sink.
//!
//! # Invariants
//! - Every started span reports exactly once, including on early return
//!   and unwinding.

use log::debug;
use std::time::{Duration, Instant};

/// How a span ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOutcome {
    Ok,
    Error,
    /// Dropped while the thread was unwinding.
    Panicked,
}

impl SpanOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Panicked => "panicked",
        }
    }
}

/// Finished span as delivered to a [`Tracer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanRecord {
    pub name: &'static str,
    pub duration: Duration,
    pub outcome: SpanOutcome,
}

/// Opaque span sink.
pub trait Tracer: Send + Sync {
    fn record(&self, span: &SpanRecord);
}

/// Discards every span.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn record(&self, _span: &SpanRecord) {}
}

/// Emits every span as one debug log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn record(&self, span: &SpanRecord) {
        debug!(
            "event=span module=trace status={} name={} duration_ms={}",
            span.outcome.as_str(),
            span.name,
            span.duration.as_millis()
        );
    }
}

/// Running span; reports to its tracer when dropped.
pub struct Span<'a> {
    tracer: &'a dyn Tracer,
    name: &'static str,
    started_at: Instant,
    outcome: Option<SpanOutcome>,
}

impl<'a> Span<'a> {
    pub fn start(tracer: &'a dyn Tracer, name: &'static str) -> Self {
        Self {
            tracer,
            name,
            started_at: Instant::now(),
            outcome: None,
        }
    }

    /// Marks the span outcome from a result.
    pub fn record_result<T, E>(&mut self, result: &Result<T, E>) {
        self.outcome = Some(match result {
            Ok(_) => SpanOutcome::Ok,
            Err(_) => SpanOutcome::Error,
        });
    }
}

impl Drop for Span<'_> {
    fn drop(&mut self) {
        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None if std::thread::panicking() => SpanOutcome::Panicked,
            None => SpanOutcome::Error,
        };
        self.tracer.record(&SpanRecord {
            name: self.name,
            duration: self.started_at.elapsed(),
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{Span, SpanOutcome, SpanRecord, Tracer};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        spans: Mutex<Vec<SpanRecord>>,
    }

    impl Tracer for Collecting {
        fn record(&self, span: &SpanRecord) {
            self.spans.lock().unwrap().push(*span);
        }
    }

    #[test]
    fn span_reports_result_outcome_once() {
        let tracer = Collecting::default();
        {
            let mut span = Span::start(&tracer, "create_parent");
            span.record_result::<(), ()>(&Ok(()));
        }
        {
            let mut span = Span::start(&tracer, "delete_parent");
            span.record_result::<(), &str>(&Err("boom"));
        }

        let spans = tracer.spans.lock().unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].name, "create_parent");
        assert_eq!(spans[0].outcome, SpanOutcome::Ok);
        assert_eq!(spans[1].outcome, SpanOutcome::Error);
    }

    #[test]
    fn span_dropped_during_unwind_reports_panicked() {
        let tracer = Collecting::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _span = Span::start(&tracer, "explode");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(tracer.spans.lock().unwrap()[0].outcome, SpanOutcome::Panicked);
    }
}
