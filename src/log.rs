use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

extern "C" fn flush_log_buffer() {
    globals().log_file.flush().unwrap_or(());
}

/// A poisoned lock still holds a usable log file.
fn globals() -> MutexGuard<'static, LogGlobals> {
    LOG_GLOBALS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The file named by `var`, if it is set and can be opened.
fn log_target(var: &str, options: &OpenOptions) -> Option<File> {
    let filename = var_os(var)?;
    match options.open(&filename) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("vroot: can't open {:?} given in {}: {}", filename, var, e);
            None
        }
    }
}

fn open_log_file() -> Box<dyn Write + Send> {
    let truncate = OpenOptions::new().write(true).create(true).truncate(true).clone();
    let append = OpenOptions::new().append(true).create(true).clone();
    let f: Box<dyn Write + Send> = match log_target("VROOT_LOG_FILE", &truncate)
        .or_else(|| log_target("VROOT_APPEND_LOG_FILE", &append))
    {
        Some(file) => Box::new(file),
        None => Box::new(io::stderr()),
    };

    match env::var("VROOT_LOG_BUFFER").map(|size| size.parse::<usize>()) {
        Ok(Ok(capacity)) => Box::new(BufWriter::with_capacity(capacity, f)),
        Ok(Err(_)) => {
            eprintln!("vroot: VROOT_LOG_BUFFER is not a number, logging unbuffered");
            f
        }
        Err(_) => f,
    }
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let log_file = open_log_file();
        unsafe {
            libc::atexit(flush_log_buffer);
        }

        let (default_level, level_map) = match env::var("VROOT_LOG") {
            Ok(vroot_log) => init_log_levels(&vroot_log),
            Err(_) => (LogWarn, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file,
            default_level,
        })
    };
}

fn parse_level(name: &str) -> Option<LogLevel> {
    match name {
        "fatal" => Some(LogFatal),
        "error" => Some(LogError),
        "warn" => Some(LogWarn),
        "info" => Some(LogInfo),
        "debug" => Some(LogDebug),
        _ => None,
    }
}

/// Parses `all:warn,canon:debug` style settings. Unknown levels are ignored.
fn init_log_levels(vroot_log: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut levels = HashMap::new();
    let mut default_level = LogWarn;
    for setting in vroot_log.split(',') {
        let (module, level) = match setting.find(':') {
            Some(colon) => (setting[..colon].trim(), setting[colon + 1..].trim()),
            None => continue,
        };
        match (module, parse_level(level)) {
            (_, None) => (),
            ("all", Some(level)) => default_level = level,
            (module, Some(level)) => {
                levels.insert(module.to_owned(), level);
            }
        }
    }
    (default_level, levels)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    match path.file_stem() {
        Some(stem) => stem.to_string_lossy().to_string(),
        None => filename.to_owned(),
    }
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        log_module.to_owned()
    } else {
        let name = filename_to_module_name(filename);
        let level = get_log_level(&name, l);
        let m = LogModule { level, name };
        l.log_modules_cache.insert(filename.to_owned(), m.clone());
        m
    }
}

/// Raise the default level. Used by `-v`; never lowers what VROOT_LOG asked for.
pub fn raise_default_level(level: LogLevel) {
    let mut l = globals();
    if level > l.default_level {
        l.default_level = level;
        l.log_modules_cache.clear();
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct LogLine {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl LogLine {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> Option<LogLine> {
        let mut lock = globals();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if enabled {
            let mut stream = LogLine {
                message: Vec::new(),
                enabled,
                lock,
            };
            if level == LogDebug {
                write!(stream, "[{}] ", m.name).unwrap_or(());
            } else {
                write_prefix(&mut stream, level, filename, line, module_path);
            }

            Some(stream)
        } else {
            None
        }
    }
}

/// Low level. Use is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str, _line: u32, _func_name: &str) -> bool {
    level <= get_log_module(filename, &mut globals()).level
}

impl Drop for LogLine {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap_or(0);
            // Flushes self.message *to* the log file, not the log file itself.
            self.flush().unwrap_or(());
        }
    }
}

impl Write for LogLine {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend these were written even if the stream is not enabled,
        // otherwise write!() reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    _module_path: &str,
) {
    let err = errno();
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap_or(());
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// This is almost always not the method you want. Use log!() macro instead
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> Option<LogLine> {
    LogLine::new(log_level, filename, line, module_path, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// After this program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            if let Some(mut stream) = maybe_stream {
                write!(stream, $($args)+).unwrap_or(());
            }
        }
    };
}

macro_rules! is_logging {
    ($log_level:expr) => {
        crate::log::is_logging($log_level, file!(), line!(), module_path!())
    };
}

/// Logs the message, prints the backtrace to stderr and aborts.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                if let Some(mut stream) = maybe_stream {
                    write!(stream, $($args)+).unwrap_or(());
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

/// Output to stderr always. No backtrace -- simply exit.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::stderr;
            crate::log::write_prefix(&mut stderr(), crate::log::LogLevel::LogFatal, file!(), line!(), module_path!());
            eprintln!($($args)+);
            std::process::exit(1);
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    flush_log_buffer();
    eprintln!("=== Start vroot backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End vroot backtrace");
    std::process::abort();
}

/// Assert with the tracee context (pid and current syscall) in the message.
macro_rules! ed_assert {
    ($tracee:expr, $cond:expr) => {
        ed_assert!($tracee, $cond, "")
    };
    ($tracee:expr, $cond:expr, $($args:tt)+) => {
        {
            let t: &crate::tracee::Tracee = $tracee;
            if !$cond {
                fatal!(
                    "\n (tracee {} in {})\n -> Assertion `{}' failed to hold. {}",
                    t.pid,
                    t.syscall_name(),
                    stringify!($cond),
                    format!($($args)+)
                );
            }
        }
    };
}

macro_rules! ed_assert_eq {
    ($tracee:expr, $cond1:expr, $cond2:expr) => {
        {
            let t: &crate::tracee::Tracee = $tracee;
            let val1 = $cond1;
            let val2 = $cond2;
            if val1 != val2 {
                fatal!(
                    "\n (tracee {} in {})\n -> Assertion `{} == {}` failed to hold.\n    Left: `{:?}`, Right: `{:?}`",
                    t.pid,
                    t.syscall_name(),
                    stringify!($cond1),
                    stringify!($cond2),
                    val1,
                    val2
                );
            }
        }
    };
}
