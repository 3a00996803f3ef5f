//! Structured operation reporting shared by every lifecycle entry point.

/// Severity levels used when reporting operation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Single line of output produced by an operation step.
#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub level: OperationLevel,
    pub message: String,
}

/// Aggregated report returned by any lifecycle operation.
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub title: String,
    pub events: Vec<OperationEvent>,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: OperationLevel, message: impl Into<String>) -> OperationEvent {
    OperationEvent {
        level,
        message: message.into(),
    }
}

/// Observer invoked as steps complete, so long-running operations (notably
/// filesystem creation) can surface progress without the core polling or
/// rendering anything itself.
pub type EventObserver<'a> = dyn FnMut(&OperationEvent) + 'a;
