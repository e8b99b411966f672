// Category-based logging infrastructure
//
// This will be used from multiple threads, so it needs
// to be stateless
use std::sync::RwLock;

#[allow(dead_code, non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    // in order of highest priority
    fatal, // the process can make no further progress
    error,
    warning,
    info,
    debug, // debugging related, fairly verbose
    trace, // absurdly verbose
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::fatal => "fatal",
            LogLevel::error => "error",
            LogLevel::warning => "warning",
            LogLevel::info => "info",
            LogLevel::debug => "debug",
            LogLevel::trace => "trace",
        }
    }

    pub fn get_level(&self) -> u32 {
        match self {
            LogLevel::fatal => 0,
            LogLevel::error => 1,
            LogLevel::warning => 2,
            LogLevel::info => 3,
            LogLevel::debug => 4,
            LogLevel::trace => 5,
        }
    }
}

/// A log sink accepts fully formatted records. The default
/// sink writes to stderr.
pub type LogSink = fn(LogLevel, &str);

lazy_static::lazy_static! {
    static ref SINK: RwLock<LogSink> = RwLock::new(default_sink);

    static ref DEFAULT_LEVEL: u32 = LogLevel::warning.get_level();

    static ref LOG_LEVEL_RAW: u32 = match std::env::var("SQUALL_LOG") {
        Ok(val) => match val.as_str() {
            "fatal" => LogLevel::fatal.get_level(),
            "error" => LogLevel::error.get_level(),
            "warning" => LogLevel::warning.get_level(),
            "info" => LogLevel::info.get_level(),
            "debug" => LogLevel::debug.get_level(),
            "trace" => LogLevel::trace.get_level(),
            _ => *DEFAULT_LEVEL,
        },
        Err(_) => *DEFAULT_LEVEL,
    };
}

fn default_sink(_level: LogLevel, record: &str) {
    eprintln!("{}", record);
}

/// Replace the output sink for all future log records
pub fn set_sink(sink: LogSink) {
    *SINK.write().unwrap() = sink;
}

/// Runtime filter check, used by the macros below.
///
/// Errors always pass. If SQUALL_LOG_MATCH is set, non-error
/// statements must come from a file whose path contains it.
pub fn should_log(level: LogLevel, file: &str) -> bool {
    if level.get_level() <= *DEFAULT_LEVEL {
        return true;
    }
    let mut ret = level.get_level() <= *LOG_LEVEL_RAW;
    if let Ok(m) = std::env::var("SQUALL_LOG_MATCH") {
        ret = ret && file.contains(m.as_str());
    }
    return ret;
}

/// Format and hand one record to the active sink
pub fn emit(level: LogLevel, file: &str, line: u32, args: std::fmt::Arguments) {
    let record = format!(
        "[{:?}]<{}> {}:{} - {}",
        crate::timing::get_current_millis(),
        level.get_name(),
        file,
        line,
        args
    );
    (*SINK.read().unwrap())(level, &record);
}

#[macro_export]
macro_rules! log_internal {
    ($loglevel:expr, $($format_args:tt)+) => ({
        if $crate::logging::should_log($loglevel, file!()) {
            $crate::logging::emit($loglevel, file!(), line!(), format_args!($($format_args)+));
        }
    })
}

#[macro_export]
macro_rules! trace {
    ($($format_args:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::log_internal!($crate::logging::LogLevel::trace, $($format_args)+);
    }};
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::log_internal!($crate::logging::LogLevel::debug, $($format_args)+);
    }};
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => {{
        $crate::log_internal!($crate::logging::LogLevel::info, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! warning {
    ($($format_args:tt)+) => {{
        $crate::log_internal!($crate::logging::LogLevel::warning, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => {{
        $crate::log_internal!($crate::logging::LogLevel::error, $($format_args)+)
    }};
}

/// Log and terminate. The process can make no further progress.
#[macro_export]
macro_rules! fatal {
    ($($format_args:tt)+) => {{
        $crate::log_internal!($crate::logging::LogLevel::fatal, $($format_args)+);
        panic!($($format_args)+);
    }};
}
