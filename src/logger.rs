//! Log sink registration.
//!
//! The library itself logs through the [`log`] facade. In addition, an
//! embedding host can register one sink per [`LogLevel`]; the lifecycle
//! code reports milestones through the `status`/`fatal`/`always` levels,
//! which have no [`log`] equivalent, and the optional [`SinkLogger`] bridge
//! forwards ordinary [`log`] records into the same table.

use std::sync::Arc;

use parking_lot::RwLock;

/// The eight log levels a sink can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Status = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
    Always = 6,
    Trace = 7,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Status => "status",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Always => "always",
            LogLevel::Trace => "trace",
        }
    }
}

/// A registered log sink. Called on the thread that produced the message.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

static SINKS: RwLock<[Option<LogSink>; 8]> =
    RwLock::new([None, None, None, None, None, None, None, None]);

/// Installs `sink` for `level`, replacing any previous sink. Passing `None`
/// unregisters the slot.
pub fn log_register(level: LogLevel, sink: Option<LogSink>) {
    SINKS.write()[level as usize] = sink;
}

/// Clears all registered sinks. Called during final teardown so that a
/// stopped server no longer calls into the host.
pub fn reset_sinks() {
    *SINKS.write() = [None, None, None, None, None, None, None, None];
}

/// Emits `message` to the sink registered for `level`, if any.
pub fn emit(level: LogLevel, message: &str) {
    let sinks = SINKS.read();
    if let Some(sink) = &sinks[level as usize] {
        sink(message);
    }
}

/// Reports a lifecycle milestone (sink table + `log::info!`).
pub(crate) fn status(message: &str) {
    emit(LogLevel::Status, message);
    log::info!("{message}");
}

/// Reports an unrecoverable condition (sink table + `log::error!`).
pub(crate) fn fatal(message: &str) {
    emit(LogLevel::Fatal, message);
    log::error!("{message}");
}

/// A [`log::Log`] implementation that forwards records into the sink table.
///
/// Optional: a host that already configured its own logger does not need
/// this. The mapping is the obvious one; `status`, `fatal` and `always`
/// are reachable only through the library's own milestone reporting.
pub struct SinkLogger;

static SINK_LOGGER: SinkLogger = SinkLogger;

impl SinkLogger {
    /// Installs the bridge as the process-wide logger.
    ///
    /// Fails if another logger is already installed.
    pub fn install() -> Result<(), log::SetLoggerError> {
        log::set_logger(&SINK_LOGGER).map(|()| log::set_max_level(log::LevelFilter::Trace))
    }
}

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        SINKS.read()[level_slot(metadata.level()) as usize].is_some()
    }

    fn log(&self, record: &log::Record<'_>) {
        let level = level_slot(record.level());
        let sinks = SINKS.read();
        if let Some(sink) = &sinks[level as usize] {
            sink(&record.args().to_string());
        }
    }

    fn flush(&self) {}
}

fn level_slot(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sinks_receive_only_their_level() {
        reset_sinks();
        let status_count = Arc::new(AtomicUsize::new(0));
        let counter = status_count.clone();
        log_register(
            LogLevel::Status,
            Some(Arc::new(move |_msg| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        emit(LogLevel::Status, "up");
        emit(LogLevel::Debug, "noise");
        emit(LogLevel::Status, "down");
        assert_eq!(status_count.load(Ordering::SeqCst), 2);

        log_register(LogLevel::Status, None);
        emit(LogLevel::Status, "gone");
        assert_eq!(status_count.load(Ordering::SeqCst), 2);
        reset_sinks();
    }
}
