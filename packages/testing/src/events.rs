use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, registry};

/// One `tracing` event recorded by [`capture_events()`].
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    level: Level,
    target: String,
    message: String,
    fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// The verbosity level of the event.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// The target of the event, by default the module path that emitted it.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The message of the event, or an empty string if it had none.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The value of a field, formatted via `Debug` (strings are stored without quotes).
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Runs `f` with a subscriber installed on the current thread that records every event,
/// returning the result of `f` together with the recorded events in emission order.
///
/// Events emitted on other threads are not recorded.
///
/// ```rust
/// use testing::capture_events;
///
/// let ((), events) = capture_events(|| tracing::info!(answer = 42, "computed"));
///
/// assert_eq!(events.len(), 1);
/// assert_eq!(events[0].message(), "computed");
/// assert_eq!(events[0].field("answer"), Some("42"));
/// ```
pub fn capture_events<F, R>(f: F) -> (R, Vec<CapturedEvent>)
where
    F: FnOnce() -> R,
{
    let events = Arc::new(Mutex::new(Vec::new()));

    let subscriber = registry().with(CaptureLayer {
        events: Arc::clone(&events),
    });

    let result = tracing::subscriber::with_default(subscriber, f);

    let events = events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain(..)
        .collect();

    (result, events)
}

struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();

        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedEvent {
                level: *metadata.level(),
                target: metadata.target().to_owned(),
                message: visitor.message,
                fields: visitor.fields,
            });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.store(field, value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.store(field, format!("{value:?}"));
    }
}

impl FieldVisitor {
    fn store(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_owned(), value);
        }
    }
}

impl Debug for CaptureLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureLayer").finish_non_exhaustive()
    }
}
