//! Append-only log sink backed by an mmap'd file.
//!
//! Writers format a complete line, reserve a region of the mapping with a
//! `fetch_add` on the shared cursor, and copy their bytes in — no lock on
//! the hot path, so no writer ever blocks on another. Records never wrap:
//! a record that does not fit the remaining region is cut with a `…`
//! marker and the mapping rotates. ERROR and FATAL records flush their
//! region to disk before returning so a crash right after still shows the
//! last line.
//!
//! The [`MmapLayer`] adapter feeds `tracing` events into the sink; the
//! rest of the code keeps logging through the ordinary `tracing` macros.
//! An opt-in stderr mirror writes whole lines with single `write` calls.

use std::cell::UnsafeCell;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};

use glyphchat_protocol::config::LogLevel;

pub const DEFAULT_MAP_SIZE: usize = 4 * 1024 * 1024;
/// Hard cap per formatted message.
pub const MAX_RECORD_BYTES: usize = 4096;
const TRUNCATION_MARKER: &[u8] = "\u{2026}\n".as_bytes();

struct Mapping {
    map: UnsafeCell<MmapMut>,
    len: usize,
    cursor: AtomicUsize,
}

// Writers only touch disjoint regions handed out by the atomic cursor,
// so concurrent raw copies cannot alias.
unsafe impl Sync for Mapping {}
unsafe impl Send for Mapping {}

enum AppendResult {
    /// Region written; offset and length for an optional flush.
    Written { offset: usize, len: usize },
    /// Mapping is full (record possibly truncated in); rotate.
    Full,
}

impl Mapping {
    fn create(path: &Path, len: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map: UnsafeCell::new(map),
            len,
            cursor: AtomicUsize::new(0),
        })
    }

    fn append(&self, record: &[u8]) -> AppendResult {
        let offset = self.cursor.fetch_add(record.len(), Ordering::SeqCst);
        if offset >= self.len {
            return AppendResult::Full;
        }
        let available = self.len - offset;
        let n = record.len().min(available);
        // SAFETY: [offset, offset + n) was exclusively reserved by the
        // fetch_add above; no other writer can hold an overlapping range.
        unsafe {
            let map = &mut *self.map.get();
            map[offset..offset + n].copy_from_slice(&record[..n]);
            if n < record.len() && available >= TRUNCATION_MARKER.len() {
                let mark_at = offset + n - TRUNCATION_MARKER.len().min(n);
                map[mark_at..mark_at + TRUNCATION_MARKER.len()]
                    .copy_from_slice(TRUNCATION_MARKER);
            }
        }
        if n < record.len() {
            AppendResult::Full
        } else {
            AppendResult::Written { offset, len: n }
        }
    }

    fn flush_range(&self, offset: usize, len: usize) {
        // SAFETY: flush only reads the mapping metadata.
        let map = unsafe { &*self.map.get() };
        let _ = map.flush_range(offset, len);
    }

    fn used(&self) -> usize {
        self.cursor.load(Ordering::SeqCst).min(self.len)
    }
}

pub struct MmapSink {
    mapping: RwLock<Arc<Mapping>>,
    rotate_lock: Mutex<()>,
    path: PathBuf,
    map_size: usize,
    level: LogLevel,
    mirror_stderr: std::sync::atomic::AtomicBool,
    rotations: AtomicU64,
}

impl MmapSink {
    pub fn create(path: impl Into<PathBuf>, level: LogLevel) -> std::io::Result<Arc<Self>> {
        Self::with_map_size(path, level, DEFAULT_MAP_SIZE)
    }

    pub fn with_map_size(
        path: impl Into<PathBuf>,
        level: LogLevel,
        map_size: usize,
    ) -> std::io::Result<Arc<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mapping = Mapping::create(&path, map_size)?;
        Ok(Arc::new(Self {
            mapping: RwLock::new(Arc::new(mapping)),
            rotate_lock: Mutex::new(()),
            path,
            map_size,
            level,
            mirror_stderr: std::sync::atomic::AtomicBool::new(false),
            rotations: AtomicU64::new(0),
        }))
    }

    /// Opt into mirroring records to stderr (level-filtered like the file).
    pub fn set_stderr_mirror(&self, on: bool) {
        self.mirror_stderr.store(on, Ordering::Relaxed);
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Append one record. `file`/`line` locate the call site.
    pub fn write(
        &self,
        level: LogLevel,
        target: &str,
        file: Option<&str>,
        line: Option<u32>,
        message: &str,
    ) {
        if level < self.level {
            return;
        }

        let mut record = String::with_capacity(message.len().min(MAX_RECORD_BYTES) + 96);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let _ = write!(
            record,
            "{}.{:03} [{}] {:?} {}",
            now.as_secs(),
            now.subsec_millis(),
            level_name(level),
            std::thread::current().id(),
            target,
        );
        if let (Some(file), Some(line)) = (file, line) {
            let _ = write!(record, " {file}:{line}");
        }
        let _ = write!(record, " {message}");
        if record.len() > MAX_RECORD_BYTES {
            record.truncate(MAX_RECORD_BYTES);
        }
        record.push('\n');

        if self.mirror_stderr.load(Ordering::Relaxed) {
            // One write call per record keeps mirror lines whole too.
            let _ = std::io::stderr().write_all(record.as_bytes());
        }

        let mapping = Arc::clone(&self.mapping.read());
        match mapping.append(record.as_bytes()) {
            AppendResult::Written { offset, len } => {
                if level >= LogLevel::Error {
                    mapping.flush_range(offset, len);
                }
            }
            AppendResult::Full => {
                self.rotate(&mapping);
                // One retry into the fresh mapping; a second Full means
                // the record alone exceeds the map and stays truncated.
                let fresh = Arc::clone(&self.mapping.read());
                if let AppendResult::Written { offset, len } = fresh.append(record.as_bytes())
                    && level >= LogLevel::Error
                {
                    fresh.flush_range(offset, len);
                }
            }
        }
    }

    /// Swap in a fresh mapping; the filled file is renamed aside.
    /// In-flight writers keep finishing into the old mapping.
    fn rotate(&self, full: &Arc<Mapping>) {
        let _guard = self.rotate_lock.lock();
        // Lost the race: someone already swapped a fresh mapping in.
        if !Arc::ptr_eq(full, &self.mapping.read()) {
            return;
        }
        let rotated = self.path.with_extension("1");
        full.flush_range(0, full.used());
        if let Err(e) = std::fs::rename(&self.path, &rotated) {
            // Keep logging into the old mapping rather than lose records.
            eprintln!("log rotation rename failed: {e}");
            return;
        }
        match Mapping::create(&self.path, self.map_size) {
            Ok(fresh) => {
                *self.mapping.write() = Arc::new(fresh);
                self.rotations.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                eprintln!("log rotation remap failed: {e}");
            }
        }
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Dev => "DEV",
        LogLevel::Debug => "DEBUG",
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
        LogLevel::Fatal => "FATAL",
    }
}

fn level_from_tracing(level: &tracing::Level) -> LogLevel {
    match *level {
        tracing::Level::TRACE => LogLevel::Dev,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

/// `tracing` layer that forwards events into the sink.
pub struct MmapLayer {
    sink: Arc<MmapSink>,
}

impl MmapLayer {
    pub fn new(sink: Arc<MmapSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for MmapLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        self.sink.write(
            level_from_tracing(meta.level()),
            meta.target(),
            meta.file(),
            meta.line(),
            &visitor.line,
        );
    }
}

#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            if !self.line.is_empty() {
                self.line.insert(0, ' ');
                self.line.insert_str(0, value);
            } else {
                self.line.push_str(value);
            }
        } else {
            let _ = write!(self.line, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let rendered = format!("{value:?}");
            if self.line.is_empty() {
                self.line = rendered;
            } else {
                self.line.insert(0, ' ');
                self.line.insert_str(0, &rendered);
            }
        } else {
            let _ = write!(self.line, " {}={:?}", field.name(), value);
        }
    }
}

/// Per-call-site state behind the rate-limited logging macros. Each
/// macro expansion gets its own static gate, so different sites limit
/// independently.
pub struct RateGate {
    state: AtomicU64,
}

impl RateGate {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// True on the first call and then at most once per `interval_ms`.
    pub fn allow_every(&self, interval_ms: u64) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let last = self.state.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < interval_ms {
            return false;
        }
        self.state
            .compare_exchange(last, now.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// True on calls 0, n, 2n, ...
    pub fn allow_nth(&self, n: u64) -> bool {
        let count = self.state.fetch_add(1, Ordering::Relaxed);
        n != 0 && count % n == 0
    }

    /// True exactly once.
    pub fn allow_once(&self) -> bool {
        self.state.swap(1, Ordering::Relaxed) == 0
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Log at most once per interval (milliseconds) per call site.
#[macro_export]
macro_rules! log_every {
    ($interval_ms:expr, $level:ident, $($arg:tt)*) => {{
        static GATE: $crate::logsink::RateGate = $crate::logsink::RateGate::new();
        if GATE.allow_every($interval_ms) {
            tracing::$level!($($arg)*);
        }
    }};
}

/// Log every nth call per call site (first call always logs).
#[macro_export]
macro_rules! log_nth {
    ($n:expr, $level:ident, $($arg:tt)*) => {{
        static GATE: $crate::logsink::RateGate = $crate::logsink::RateGate::new();
        if GATE.allow_nth($n) {
            tracing::$level!($($arg)*);
        }
    }};
}

/// Log exactly once per call site.
#[macro_export]
macro_rules! log_once {
    ($level:ident, $($arg:tt)*) => {{
        static GATE: $crate::logsink::RateGate = $crate::logsink::RateGate::new();
        if GATE.allow_once() {
            tracing::$level!($($arg)*);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_log(path: &Path) -> String {
        let bytes = std::fs::read(path).unwrap();
        let used = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        String::from_utf8_lossy(&bytes[..used]).to_string()
    }

    #[test]
    fn records_land_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.log");
        let sink = MmapSink::create(&path, LogLevel::Debug).unwrap();
        sink.write(LogLevel::Info, "test", Some("a.rs"), Some(10), "hello log");
        sink.write(LogLevel::Error, "test", None, None, "boom");
        let contents = read_log(&path);
        assert!(contents.contains("[INFO]"));
        assert!(contents.contains("hello log"));
        assert!(contents.contains("a.rs:10"));
        assert!(contents.contains("[ERROR]"));
        assert!(contents.contains("boom"));
    }

    #[test]
    fn level_filter_drops_quiet_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.log");
        let sink = MmapSink::create(&path, LogLevel::Warn).unwrap();
        sink.write(LogLevel::Info, "test", None, None, "invisible");
        sink.write(LogLevel::Warn, "test", None, None, "visible");
        let contents = read_log(&path);
        assert!(!contents.contains("invisible"));
        assert!(contents.contains("visible"));
    }

    #[test]
    fn rotation_renames_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.log");
        let sink = MmapSink::with_map_size(&path, LogLevel::Debug, 512).unwrap();
        for i in 0..64 {
            sink.write(LogLevel::Info, "test", None, None, &format!("record {i}"));
        }
        assert!(sink.rotations() > 0, "small map must rotate");
        assert!(path.with_extension("1").exists());
        // New mapping keeps accepting records.
        sink.write(LogLevel::Info, "test", None, None, "after rotation");
        let contents = read_log(&path);
        assert!(contents.contains("after rotation") || sink.rotations() > 1);
    }

    #[test]
    fn concurrent_writers_never_interleave_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.log");
        let sink = MmapSink::with_map_size(&path, LogLevel::Debug, DEFAULT_MAP_SIZE).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        sink.write(
                            LogLevel::Info,
                            "race",
                            None,
                            None,
                            &format!("w{t:02}-{i:04}-{}", "x".repeat(40)),
                        );
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let contents = read_log(&path);
        let mut seen = 0;
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            // Every complete record carries exactly one writer tag and
            // the full payload; a torn record would break the pattern.
            assert!(
                line.matches("w").count() >= 1 && line.ends_with(&"x".repeat(40)),
                "interleaved record: {line:?}"
            );
            seen += 1;
        }
        assert!(seen > 0);
    }

    #[test]
    fn oversized_record_is_cut_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.log");
        let sink = MmapSink::with_map_size(&path, LogLevel::Debug, 256).unwrap();
        sink.write(LogLevel::Info, "test", None, None, &"y".repeat(1024));
        let contents = read_log(&path.with_extension("1")).to_string()
            + &read_log(&path);
        assert!(contents.contains('\u{2026}'), "missing truncation marker");
    }

    #[test]
    fn rate_gate_nth_and_once() {
        let gate = RateGate::new();
        let allowed: Vec<bool> = (0..7).map(|_| gate.allow_nth(3)).collect();
        assert_eq!(allowed, vec![true, false, false, true, false, false, true]);

        let gate = RateGate::new();
        assert!(gate.allow_once());
        assert!(!gate.allow_once());
        assert!(!gate.allow_once());
    }

    #[test]
    fn rate_gate_every_allows_first_and_throttles() {
        let gate = RateGate::new();
        assert!(gate.allow_every(60_000));
        assert!(!gate.allow_every(60_000));
    }

    #[test]
    fn independent_call_sites_do_not_share_state() {
        let a = RateGate::new();
        let b = RateGate::new();
        assert!(a.allow_once());
        assert!(b.allow_once());
    }
}
