//! Log capture for assertions on emitted events
//!
//! `capture_logs` installs a thread-local subscriber that records every event
//! with its level and rendered message. Tasks spawned on a current-thread
//! runtime are captured too.

use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

/// One recorded event
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Shared view of the captured events
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    /// Was an event at `level` emitted whose message contains `needle`?
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.at_level(level)
            .iter()
            .any(|e| e.message.contains(needle))
    }

    /// Count events whose message contains `needle`
    pub fn count_matching(&self, needle: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }
}

struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Ok(mut events) = self.events.lock() {
            events.push(CapturedEvent {
                level: *event.metadata().level(),
                target: event.metadata().target().to_string(),
                message: visitor.message,
            });
        }
    }
}

/// Record events on the current thread until the guard is dropped
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer {
        events: capture.events.clone(),
    });
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}
