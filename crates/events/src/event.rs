use chrono::{DateTime, Utc};

/// A domain event emitted by a sales aggregate.
///
/// Events are facts: immutable, versioned, and appended to the document history in
/// the order they were applied.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "sales.order.confirmed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
