//! Small parsing and system helpers shared across the crate

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, SubframeError};

/// Parse a byte-size string with optional binary suffix (k/M/G/T/P).
///
/// Decimal values are accepted: `"1.5M"` gives 1.5 * 1024 * 1024.
/// Returns `None` when the string is not a number or carries an
/// unknown suffix.
pub fn parse_byte_size(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let (num, suffix) = match s.find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-') {
        Some(ix) => (&s[..ix], &s[ix..]),
        None => (s, ""),
    };
    let v: f64 = num.parse().ok()?;
    if v < 0.0 {
        return None;
    }
    let mult: u64 = match suffix {
        "" => 1,
        "k" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1u64 << 40,
        "P" => 1u64 << 50,
        _ => return None,
    };
    Some((v * mult as f64) as u64)
}

/// Format a byte count for logs, scaled to the nearest binary prefix.
pub fn format_byte_size(value: u64) -> String {
    const PREFIXES: [&str; 6] = ["", "ki", "Mi", "Gi", "Ti", "Pi"];
    let mut scaled = value as f64;
    let mut ix = 0;
    while scaled >= 1024.0 && ix < PREFIXES.len() - 1 {
        scaled /= 1024.0;
        ix += 1;
    }
    if ix == 0 {
        format!("{} B", value)
    } else {
        format!("{:.3} {}B", scaled, PREFIXES[ix])
    }
}

/// Parse a comma-separated `key=value` option string.
///
/// Entries without a `=` are ignored, as is surrounding whitespace.
pub fn parse_key_values(input: &str) -> Vec<(String, String)> {
    input
        .split(',')
        .filter_map(|item| {
            let item = item.trim();
            let (k, v) = item.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Parse a comma-separated list of trimmed, non-empty strings.
pub fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Free bytes available for a named resource.
///
/// A resource containing a `/` is taken as a filesystem path and queried
/// with statvfs; anything else is looked up as a `/proc/meminfo` entry
/// (values there are in kB).
pub fn free_bytes_for_resource(resource: &str) -> Result<u64> {
    if resource.contains('/') {
        let stat = nix::sys::statvfs::statvfs(resource).map_err(|e| SubframeError::Io {
            message: format!("statvfs {} failed: {}", resource, e),
            source: None,
        })?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    } else {
        meminfo_bytes(resource)
    }
}

fn meminfo_bytes(keyword: &str) -> Result<u64> {
    // keep the keyword simple, it ends up in a line match
    if !keyword
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '(' || c == ')' || c == '_')
    {
        return Err(SubframeError::config(
            "checkResources",
            format!("suspicious meminfo keyword: {}", keyword),
        ));
    }
    let contents = std::fs::read_to_string("/proc/meminfo")
        .map_err(|e| SubframeError::from_io(e, "reading /proc/meminfo"))?;
    for line in contents.lines() {
        let Some(rest) = line.strip_prefix(keyword) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let value = rest
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse::<u64>()
            .map_err(|_| {
                SubframeError::config("checkResources", format!("bad meminfo line: {}", line))
            })?;
        return Ok(value * 1024);
    }
    Err(SubframeError::config(
        "checkResources",
        format!("no /proc/meminfo entry: {}", keyword),
    ))
}

/// Microseconds elapsed since the first call in this process.
///
/// Monotonic, suitable for page-acquisition timestamps stored in atomics.
pub fn monotonic_micros() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Rate limiter for repeated diagnostics.
///
/// `fire()` succeeds at most once per interval and reports how many
/// attempts were suppressed since the previous success.
#[derive(Debug)]
pub struct RateLimitedToken {
    interval_us: u64,
    last_fire_us: AtomicU64,
    suppressed: AtomicU64,
}

impl RateLimitedToken {
    /// Create a token firing at most once per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_us: interval.as_micros() as u64,
            last_fire_us: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Try to fire; on success returns the number of suppressed attempts
    pub fn fire(&self) -> Option<u64> {
        let now = monotonic_micros().max(1);
        let last = self.last_fire_us.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_us {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match self
            .last_fire_us
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => Some(self.suppressed.swap(0, Ordering::Relaxed)),
            Err(_) => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}
