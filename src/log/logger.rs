use crate::{
    config::ServerConfig,
    log::{log_level::LogLevel, log_msg::LogMsg, logger_handle::LoggerHandle},
};

use std::{
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::mpsc::{self, TrySendError},
    thread,
    time::{SystemTime, UNIX_EPOCH},
};

/// Flush every 100 lines when debugging, to see crashes near real-time.
#[cfg(feature = "log-debug")]
const FLUSH_BATCH_SIZE: u32 = 100;

#[cfg(not(feature = "log-debug"))]
const FLUSH_BATCH_SIZE: u32 = 1_000;

/// Bounded, non-blocking logger writing to a per-process file.
///
/// Producers enqueue through cloned `LoggerHandle`s; one `logger-worker`
/// thread drains the queue and writes. Warn and Error lines are mirrored to
/// stderr so an operator sees them without opening the file.
pub struct Logger {
    handle: LoggerHandle,
    thread: Option<thread::JoinHandle<()>>,
    file_path: PathBuf,
}

impl Logger {
    /// Starts the server logger where `[Logging]` in the config says,
    /// defaulting to `logs/` next to the executable.
    #[must_use]
    pub fn start_server(cap: usize, config: &ServerConfig) -> Self {
        let dir = config.log_dir.as_deref().map_or_else(
            || exe_dir_fallback_cwd().join("logs"),
            |d| expand_path(&d.to_string_lossy()),
        );
        Self::start_in_dir(dir, Some(&config.log_filename), cap)
    }

    /// Starts the logger in `logs/` next to the executable.
    ///
    /// # Example Filename
    /// `target/debug/logs/roomcall-20251102_023045-pid1234.log`
    #[must_use]
    pub fn start_default(app_name: Option<&str>, cap: usize) -> Self {
        let base = exe_dir_fallback_cwd().join("logs");
        Self::start_in_dir(base, app_name, cap)
    }

    /// Creates `dir` if needed and spawns the writer thread on a fresh
    /// `<name>-<timestamp>-pid<pid>.log` file. `cap` bounds the queue.
    pub fn start_in_dir<D: AsRef<Path>>(dir: D, app_name: Option<&str>, cap: usize) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let _ = fs::create_dir_all(&dir);

        let ts = timestamp_for_filename();
        let pid = std::process::id();
        let fname = match app_name {
            Some(name) => format!("{name}-{ts}-pid{pid}.log"),
            None => format!("{ts}-pid{pid}.log"),
        };
        let file_path = dir.join(fname);

        let (tx, rx) = mpsc::sync_channel::<LogMsg>(cap.max(1));
        let handle = LoggerHandle {
            tx,
            min_level: compiled_min_level(),
        };

        let file_path_clone = file_path.clone();
        let thread = thread::Builder::new()
            .name("logger-worker".into())
            .spawn(move || {
                // Target file, then a temp file, then nowhere. Never panic.
                let writer: Box<dyn Write + Send> = if let Ok(f) = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&file_path_clone)
                {
                    Box::new(f)
                } else {
                    let fallback = std::env::temp_dir().join("roomcall-fallback.log");
                    match OpenOptions::new().create(true).append(true).open(&fallback) {
                        Ok(f) => Box::new(f),
                        Err(_) => Box::new(io::sink()),
                    }
                };
                let mut out = BufWriter::new(writer);
                let mut lines_written: u32 = 0;

                while let Ok(m) = rx.recv() {
                    let line = m.format_line();
                    let _ = writeln!(&mut out, "{line}");
                    if m.level >= LogLevel::Warn {
                        eprintln!("{line}");
                    }
                    lines_written = lines_written.wrapping_add(1);
                    if lines_written % FLUSH_BATCH_SIZE == 0 {
                        let _ = out.flush();
                    }
                }
                let _ = out.flush();
            })
            .ok();

        Self {
            handle,
            thread,
            file_path,
        }
    }

    /// Enqueues one line without blocking; dropped when the queue is full.
    ///
    /// # Errors
    /// Returns the rejected `LogMsg` inside `TrySendError`.
    pub fn try_log<S: Into<String>>(
        &self,
        level: LogLevel,
        text: S,
        target: &'static str,
    ) -> Result<(), TrySendError<LogMsg>> {
        self.handle.try_log(level, text, target)
    }

    #[must_use]
    pub fn handle(&self) -> LoggerHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Closes this logger's own sender and waits for the writer to drain.
    /// Returns early only once every cloned handle is dropped as well.
    pub fn shutdown(self) {
        let Self { handle, thread, .. } = self;
        drop(handle);
        if let Some(t) = thread {
            let _ = t.join();
        }
    }
}

/// Lowest level whose macros are compiled in.
fn compiled_min_level() -> LogLevel {
    if cfg!(feature = "log-trace") {
        LogLevel::Trace
    } else if cfg!(feature = "log-debug") {
        LogLevel::Debug
    } else if cfg!(feature = "log-info") {
        LogLevel::Info
    } else if cfg!(feature = "log-warn") {
        LogLevel::Warn
    } else {
        LogLevel::Error
    }
}

/// Locates the `logs` directory next to the executable (target/{debug,release}),
/// or falls back to the current working directory on error.
fn exe_dir_fallback_cwd() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Generates a human-readable timestamp for filenames without external dependencies.
///
/// Output Format: `YYYYMMDD_HHMMSS` (e.g., `20251102_023045`)
fn timestamp_for_filename() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    unix_to_utc(secs).map_or_else(
        |_| format!("unix_{secs}"), // graceful fallback, never panics
        |tm| {
            format!(
                "{:04}{:02}{:02}_{:02}{:02}{:02}",
                tm.year, tm.mon, tm.day, tm.hour, tm.min, tm.sec
            )
        },
    )
}

#[derive(Clone, Copy, Debug)]
struct SimpleUtc {
    year: i32,
    mon: u32,
    day: u32,
    hour: u32,
    min: u32,
    sec: u32,
}

#[derive(Debug)]
enum UtcConvError {
    Year,
    Month,
    Day,
}

/// Minimal UTC conversion (Civl Time) to avoid importing `chrono`.
///
/// Implements the algorithm to convert UNIX timestamp to a Gregorian date.
/// Note: not a `const fn` because it uses `Result/try_from`.
///
/// # Errors
///
/// Returns a [`UtcConvError`] if the calculated components generally overflow or
/// cannot be represented in standard integer types:
///
/// * [`UtcConvError::Year`] - If the calculated year does not fit in an `i32`.
/// * [`UtcConvError::Month`] - If the month cannot be converted to `u32` (unlikely by algorithm design).
/// * [`UtcConvError::Day`] - If the day cannot be converted to `u32` (unlikely by algorithm design).
#[allow(clippy::missing_const_for_fn, clippy::many_single_char_names)]
fn unix_to_utc(mut s: u64) -> Result<SimpleUtc, UtcConvError> {
    use std::convert::TryFrom;

    let sec = (s % 60) as u32;
    s /= 60;
    let min = (s % 60) as u32;
    s /= 60;
    let hour = (s % 24) as u32;
    s /= 24;

    // Use i128 to prevent overflow during intermediate calculations.
    let z: i128 = i128::from(s) + 719_468;

    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097; // [0, 146096]
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = doy - (153 * mp + 2) / 5 + 1; // [1, 31]
    let m = mp + if mp < 10 { 3 } else { -9 }; // [1, 12]

    let year_i = y + i128::from(m <= 2);

    let year = i32::try_from(year_i).map_err(|_| UtcConvError::Year)?;
    let mon = u32::try_from(m).map_err(|_| UtcConvError::Month)?;
    let day = u32::try_from(d).map_err(|_| UtcConvError::Day)?;

    Ok(SimpleUtc {
        year,
        mon,
        day,
        hour,
        min,
        sec,
    })
}

/// Expands tilde (`~`) in file paths to the user's home directory.
fn expand_path(path_str: &str) -> PathBuf {
    if path_str.starts_with("~") {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .ok()
            .map(PathBuf::from);

        if let Some(mut home_path) = home {
            if path_str == "~" {
                return home_path;
            }
            if path_str.starts_with("~/") || path_str.starts_with("~\\") {
                home_path.push(&path_str[2..]);
                return home_path;
            }
        }
    }
    PathBuf::from(path_str)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::logger_warn;

    #[test]
    fn unix_epoch_converts_to_1970() {
        let tm = unix_to_utc(0).unwrap();
        assert_eq!((tm.year, tm.mon, tm.day), (1970, 1, 1));
        // 2024-02-29 12:34:56 UTC
        let tm = unix_to_utc(1_709_210_096).unwrap();
        assert_eq!(
            (tm.year, tm.mon, tm.day, tm.hour, tm.min, tm.sec),
            (2024, 2, 29, 12, 34, 56)
        );
    }

    #[test]
    fn writes_lines_to_named_file() {
        let dir = std::env::temp_dir().join(format!("roomcall-logger-test-{}", std::process::id()));
        let logger = Logger::start_in_dir(&dir, Some("unit"), 16);
        let path = logger.file_path().to_path_buf();
        assert!(
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("unit-") && n.ends_with(".log"))
        );

        logger_warn!(logger, "sweeper lagging by {} ms", 12);
        logger.shutdown();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[WARN]"));
        assert!(content.contains("sweeper lagging by 12 ms"));
        let _ = fs::remove_dir_all(&dir);
    }
}
