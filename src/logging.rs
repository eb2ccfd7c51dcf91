//! Structured logging with timestamps, source locations, and ANSI colour.
//!
//! Provides the [`mlog!`] macro for consistent log output in the format:
//!
//! ```text
//! 20260808T14:02:51.310 - src/queue.rs:187 - queue: job refresh-user-... dropped
//! ```
//!
//! When writing to a terminal, output is colour-coded: timestamps and source
//! locations are dimmed, and conversation/user ids get consistent colours
//! derived from their content so the same entity is easy to follow across
//! lines.
//!
//! By default log lines go to stderr.  Call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor; installing a custom writer also
//! disables ANSI colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
/// Detects whether stderr supports ANSI colours.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Replace the log writer.  All subsequent [`mlog!`] output goes to `w`,
/// without colour codes.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap() = w;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Palette for id hashing; bright variants first for contrast.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m",
    "\x1b[31m", "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m",
];

/// Pick a deterministic colour for the given string.
fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format a conversation id with consistent colour and truncation,
/// e.g. `c-9d4f02ab`.
pub fn conv(id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{}c-{short}{RESET}", hash_colour(id))
    } else {
        format!("c-{short}")
    }
}

/// Format a user id with consistent colour and truncation, e.g. `u-77ce10b4`.
pub fn user(id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{}u-{short}{RESET}", hash_colour(id))
    } else {
        format!("u-{short}")
    }
}

/// Format a job id with a consistent colour.  Job ids are human-readable
/// (`refresh-conversation-...`), so no truncation is applied.
pub fn job(id: &str) -> String {
    if colour_enabled() {
        format!("{}{id}{RESET}", hash_colour(id))
    } else {
        id.to_string()
    }
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let elapsed = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();

    let day_secs = secs % 86400;
    let (hours, minutes, seconds) = (day_secs / 3600, (day_secs % 3600) / 60, day_secs % 60);

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let z = (secs / 86400) as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let mut year = yoe as i64 + era * 400;
    if month <= 2 {
        year += 1;
    }

    format!("{year:04}{month:02}{day:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Write a single log line to the current writer.
///
/// Called by the [`mlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line to the current writer with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// mlog!("queue: started {} worker(s)", n);
/// mlog!("refresh-conversation: {} exited", logging::conv(&id));
/// ```
#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_ids() {
        assert_eq!(truncate_id("0123456789abcdef"), "01234567");
        assert_eq!(truncate_id("short"), "short");
    }

    #[test]
    fn plain_formatting_without_colour() {
        COLOUR_ENABLED.store(false, Ordering::Relaxed);
        assert_eq!(conv("9d4f02ab-1111-2222"), "c-9d4f02ab");
        assert_eq!(user("77ce10b4-3333-4444"), "u-77ce10b4");
        assert_eq!(job("refresh-asset-xyz"), "refresh-asset-xyz");
    }

    #[test]
    fn hash_colour_is_deterministic() {
        assert_eq!(hash_colour("abc"), hash_colour("abc"));
    }
}
