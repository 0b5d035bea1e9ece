use std::borrow::Cow;

/// Log severity, matching the subset of OpenTelemetry `SeverityNumber` /
/// `tracing::Level` that this crate actually emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogSeverity {
    Debug,
    Info,
    Warn,
    /// Used exclusively by `Failure::log` — accumulated errors are always
    /// logged at the highest severity, once.
    Critical,
}

/// A single structured log record. Borrows its fields for the duration of
/// the `Logger::log` call rather than forcing an allocation per record.
#[derive(Debug)]
pub struct LogRecord<'a> {
    pub message: Cow<'a, str>,
    pub severity: LogSeverity,
    pub target: &'static str,
    pub error: Option<&'a (dyn std::error::Error + 'static)>,
}

impl<'a> LogRecord<'a> {
    pub fn new(
        message: impl Into<Cow<'a, str>>,
        severity: LogSeverity,
        target: &'static str,
    ) -> Self {
        LogRecord {
            message: message.into(),
            severity,
            target,
            error: None,
        }
    }

    pub fn with_error(mut self, error: &'a (dyn std::error::Error + 'static)) -> Self {
        self.error = Some(error);
        self
    }
}

/// Host-supplied logging sink.
///
/// `relay-core` depends only on this trait, never on a concrete backend
/// directly — the same decoupling the teacher crate uses to stay portable
/// across hosts that wire up `tracing`, OpenTelemetry, or something
/// bespoke. `log` is the only required method; the rest are convenience
/// wrappers that all funnel through it.
pub trait Logger {
    fn log(&self, record: &LogRecord<'_>);

    fn warn(&self, target: &'static str, message: Cow<'static, str>) {
        self.log(&LogRecord::new(message, LogSeverity::Warn, target));
    }

    fn critical(
        &self,
        target: &'static str,
        message: Cow<'static, str>,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) {
        let mut record = LogRecord::new(message, LogSeverity::Critical, target);
        if let Some(error) = error {
            record = record.with_error(error);
        }
        self.log(&record);
    }
}

/// Default [`Logger`] backed by the `tracing` crate's global dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, record: &LogRecord<'_>) {
        let error = record.error.map(|e| e.to_string()).unwrap_or_default();
        match record.severity {
            LogSeverity::Debug => {
                tracing::debug!(target: record.target, error = %error, "{}", record.message)
            }
            LogSeverity::Info => {
                tracing::info!(target: record.target, error = %error, "{}", record.message)
            }
            LogSeverity::Warn => {
                tracing::warn!(target: record.target, error = %error, "{}", record.message)
            }
            LogSeverity::Critical => {
                tracing::error!(target: record.target, error = %error, "{}", record.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct CapturingLogger {
        messages: RefCell<Vec<(LogSeverity, String)>>,
    }

    impl Logger for CapturingLogger {
        fn log(&self, record: &LogRecord<'_>) {
            self.messages
                .borrow_mut()
                .push((record.severity, record.message.to_string()));
        }
    }

    #[test]
    fn warn_and_critical_route_through_log() {
        let logger = CapturingLogger::default();
        logger.warn("relay_core::test", "unknown event".into());
        logger.critical("relay_core::test", "boom".into(), None);
        let messages = logger.messages.borrow();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], (LogSeverity::Warn, "unknown event".to_string()));
        assert_eq!(messages[1], (LogSeverity::Critical, "boom".to_string()));
    }
}
