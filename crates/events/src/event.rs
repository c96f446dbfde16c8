use chrono::{DateTime, Utc};

/// A fact about a state change, published after the change was persisted.
///
/// Events are immutable. Consumers must tolerate seeing the same event twice.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "job.migration.pending").
    fn event_type(&self) -> &'static str;

    /// When the underlying state change was written.
    fn occurred_at(&self) -> DateTime<Utc>;
}
