use parking_lot::Mutex;
/// Debug logging for devhaven
///
/// Controlled by the DEBUG_LEVEL environment variable:
/// - 0 or unset: No debugging
/// - 1: Errors only
/// - 2: Info level (session lifecycle)
/// - 3: Debug level (refreshes, flow control)
/// - 4: Trace level (raw control-mode traffic)
///
/// All output goes to /tmp/devhaven_debug.log on Unix/macOS,
/// or %TEMP%\devhaven_debug.log on Windows, so stdout stays usable for
/// command output. `log` records from the engine crates are routed to the
/// same file by [`init_log_bridge`].
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Debug level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    Off = 0,
    Error = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl DebugLevel {
    fn from_env() -> Self {
        match std::env::var("DEBUG_LEVEL") {
            Ok(val) => Self::from_number(val.trim().parse::<u8>().unwrap_or(0)),
            Err(_) => DebugLevel::Off,
        }
    }

    fn from_number(n: u8) -> Self {
        match n {
            1 => DebugLevel::Error,
            2 => DebugLevel::Info,
            3 => DebugLevel::Debug,
            4 => DebugLevel::Trace,
            _ => DebugLevel::Off,
        }
    }

    fn from_filter(filter: log::LevelFilter) -> Self {
        match filter {
            log::LevelFilter::Off => DebugLevel::Off,
            log::LevelFilter::Error | log::LevelFilter::Warn => DebugLevel::Error,
            log::LevelFilter::Info => DebugLevel::Info,
            log::LevelFilter::Debug => DebugLevel::Debug,
            log::LevelFilter::Trace => DebugLevel::Trace,
        }
    }
}

/// Path of the debug log file.
pub fn log_path() -> PathBuf {
    #[cfg(unix)]
    let path = PathBuf::from("/tmp/devhaven_debug.log");
    #[cfg(windows)]
    let path = std::env::temp_dir().join("devhaven_debug.log");
    path
}

/// Global debug logger
struct DebugLogger {
    level: DebugLevel,
    file: Option<std::fs::File>,
}

impl DebugLogger {
    fn new() -> Self {
        let mut logger = DebugLogger {
            level: DebugLevel::Off,
            file: None,
        };
        logger.set_level(DebugLevel::from_env());
        logger
    }

    /// Change the level, opening the log file the first time it is needed.
    fn set_level(&mut self, level: DebugLevel) {
        self.level = level;
        if level == DebugLevel::Off || self.file.is_some() {
            return;
        }

        // Failing to open the file leaves file logging off
        if let Ok(file) = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(log_path())
        {
            self.file = Some(file);
            self.write_raw(&format!(
                "\n{}\ndevhaven debug session started at {} (level={:?})\n{}\n",
                "=".repeat(80),
                get_timestamp(),
                level,
                "=".repeat(80)
            ));
        }
    }

    fn write_raw(&mut self, msg: &str) {
        if let Some(ref mut file) = self.file {
            let _ = file.write_all(msg.as_bytes());
            let _ = file.flush();
        }
    }

    fn log(&mut self, level: DebugLevel, category: &str, msg: &str) {
        if level <= self.level {
            let level_str = match level {
                DebugLevel::Error => "ERROR",
                DebugLevel::Info => "INFO ",
                DebugLevel::Debug => "DEBUG",
                DebugLevel::Trace => "TRACE",
                DebugLevel::Off => return,
            };
            self.write_line(level_str, category, msg);
        }
    }

    fn write_line(&mut self, level_str: &str, category: &str, msg: &str) {
        self.write_raw(&format!(
            "[{}] [{}] [{}] {}\n",
            get_timestamp(),
            level_str,
            category,
            msg
        ));
    }
}

static LOGGER: OnceLock<Mutex<DebugLogger>> = OnceLock::new();

fn get_logger() -> &'static Mutex<DebugLogger> {
    LOGGER.get_or_init(|| Mutex::new(DebugLogger::new()))
}

fn get_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}

/// Check if debugging is enabled at given level
pub fn is_enabled(level: DebugLevel) -> bool {
    let logger = get_logger().lock();
    level <= logger.level
}

/// Log a message at specified level
pub fn log(level: DebugLevel, category: &str, msg: &str) {
    let mut logger = get_logger().lock();
    logger.log(level, category, msg);
}

/// Log formatted message
pub fn logf(level: DebugLevel, category: &str, args: fmt::Arguments) {
    if is_enabled(level) {
        log(level, category, &format!("{}", args));
    }
}

// ============================================================================
// `log` crate bridge
// ============================================================================

/// Routes `log` records into the debug file, mirroring them to stderr when
/// `RUST_LOG` is set.
struct LogBridge;

static BRIDGE: LogBridge = LogBridge;
static MIRROR_STDERR: AtomicBool = AtomicBool::new(false);
static LEVEL_OVERRIDDEN: AtomicBool = AtomicBool::new(false);

impl log::Log for LogBridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let target = record.target();
        let level = format!("{:<5}", record.level());
        let message = record.args().to_string();
        get_logger().lock().write_line(&level, target, &message);
        if MIRROR_STDERR.load(Ordering::Relaxed) {
            eprintln!("[{level}] [{target}] {message}");
        }
    }

    fn flush(&self) {}
}

/// Parse a plain `RUST_LOG` level (`info`, `debug`, ...). Per-module
/// directives are not supported; anything else falls back to `info`.
fn rust_log_filter(value: &str) -> log::LevelFilter {
    value.trim().parse().unwrap_or(log::LevelFilter::Info)
}

/// Install the `log` bridge.
///
/// Precedence: `cli_level` (from `--log-level`), then `RUST_LOG`, then the
/// configured level applied later through [`apply_config_level`].
pub fn init_log_bridge(cli_level: Option<log::LevelFilter>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = match (cli_level, rust_log.as_deref()) {
        (Some(level), _) => Some(level),
        (None, Some(value)) => Some(rust_log_filter(value)),
        (None, None) => None,
    };

    if log::set_logger(&BRIDGE).is_err() {
        // Already installed (tests call this more than once)
        return;
    }
    MIRROR_STDERR.store(rust_log.is_some(), Ordering::Relaxed);

    match filter {
        Some(filter) => {
            LEVEL_OVERRIDDEN.store(true, Ordering::Relaxed);
            set_file_level(filter);
        }
        None => log::set_max_level(log::LevelFilter::Off),
    }
}

/// Apply the configured level unless the CLI or `RUST_LOG` chose one.
pub fn apply_config_level(filter: log::LevelFilter) {
    if LEVEL_OVERRIDDEN.load(Ordering::Relaxed) {
        return;
    }
    set_file_level(filter);
}

fn set_file_level(filter: log::LevelFilter) {
    log::set_max_level(filter);
    let mut logger = get_logger().lock();
    let level = DebugLevel::from_filter(filter).max(logger.level);
    logger.set_level(level);
}

// Convenience macros for logging
#[macro_export]
macro_rules! debug_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::debug::logf($crate::debug::DebugLevel::Error, $category, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::debug::logf($crate::debug::DebugLevel::Info, $category, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug_log {
    ($category:expr, $($arg:tt)*) => {
        $crate::debug::logf($crate::debug::DebugLevel::Debug, $category, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug_trace {
    ($category:expr, $($arg:tt)*) => {
        $crate::debug::logf($crate::debug::DebugLevel::Trace, $category, format_args!($($arg)*))
    };
}
