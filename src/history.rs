//! Bounded, gap-aware time series of the measured spin rate.
//!
//! [`History`] holds a pair of parallel sequences (timestamps and values)
//! with an explicitly tracked capacity. Points are appended indefinitely;
//! when the arrays fill up, one decision function either compacts (discarding
//! the oldest block when at least the retention window of data would remain)
//! or grows by one block. This bounds memory to roughly the retention window
//! worth of samples while keeping reallocation cost amortized.
//!
//! Values are a tagged union: a real reading, or a masked marker that renders
//! as a gap in the plot and as `--` in log files (used across disconnects).
//!
//! Persistence comes in two forms: a one-shot [`History::save_history`] of
//! everything currently held, and incremental logging
//! ([`History::begin_logging`] / [`History::end_logging`]) that appends only
//! not-yet-flushed samples to a log file and renames it after each flush so
//! the file name always encodes the exact start/end timestamps of its current
//! contents. A flush also happens right before any buffer reallocation, so a
//! resize can never lose pending samples.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeDelta};
use tracing::debug;

use crate::error::{MasError, MasResult};

/// Reallocation block size, in points. Controls how often the arrays are
/// compacted or grown.
pub const HISTORY_BLOCK: usize = 1000;

/// Timestamp format used in log lines and log file names.
const TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// A single history value: a spin rate reading, or a masked gap marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// A measured spin rate in Hz.
    Value(i64),
    /// An intentional gap (e.g. the connection was down).
    Masked,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::Value(v) => fmt::Display::fmt(v, f),
            Sample::Masked => f.pad("--"),
        }
    }
}

/// How a full buffer makes room for the next point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResizePlan {
    new_capacity: usize,
    keep: usize,
}

/// Updatable store of a parameter's value over time.
///
/// Holds time/value pairs in insertion order (timestamps non-decreasing) and
/// keeps at least `history_length` worth of recent points before allowing the
/// oldest block to be discarded.
pub struct History {
    times: Vec<DateTime<Local>>,
    values: Vec<Sample>,
    capacity: usize,
    block: usize,
    history_length: TimeDelta,
    log_dir: PathBuf,
    can_save: bool,
    logging: bool,
    log_start: DateTime<Local>,
    log_end: DateTime<Local>,
}

impl History {
    /// Create an empty history retaining at least `history_length` of data.
    ///
    /// `log_dir` names the directory save and log files are written to; when
    /// it is `None` the working directory is used. If the directory does not
    /// exist or is not writable, saving is disabled (checked once, here).
    pub fn new(history_length: TimeDelta, log_dir: Option<&Path>) -> Self {
        Self::with_block(history_length, log_dir, HISTORY_BLOCK)
    }

    fn with_block(history_length: TimeDelta, log_dir: Option<&Path>, block: usize) -> Self {
        let (log_dir, can_save) = match log_dir {
            None => (PathBuf::new(), true),
            Some(dir) => (dir.to_path_buf(), dir_writable(dir)),
        };

        let capacity = block * 2;
        let now = Local::now();
        Self {
            times: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
            block,
            history_length,
            log_dir,
            can_save,
            logging: false,
            log_start: now,
            log_end: now,
        }
    }

    /// Number of filled points.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Whether the history holds no points yet.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Current allocated capacity, in points.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The retention window.
    pub fn history_length(&self) -> TimeDelta {
        self.history_length
    }

    /// Whether save/log operations are available.
    pub fn can_save(&self) -> bool {
        self.can_save
    }

    /// Whether incremental logging is currently active.
    pub fn is_logging(&self) -> bool {
        self.logging
    }

    /// Append a data point.
    ///
    /// Timestamps must be non-decreasing. When the arrays are full this
    /// first flushes pending log data (if logging) and reallocates, so the
    /// call can touch the filesystem and fail with an I/O error.
    pub fn add_point(&mut self, time: DateTime<Local>, value: Sample) -> MasResult<()> {
        debug_assert!(
            self.times.last().map_or(true, |last| *last <= time),
            "history timestamps must be non-decreasing"
        );
        if self.times.len() == self.capacity {
            self.make_room()?;
        }
        self.times.push(time);
        self.values.push(value);
        Ok(())
    }

    /// Decide between compaction and growth for a full buffer.
    ///
    /// If dropping the oldest block still leaves at least `history_length`
    /// between the block boundary and the newest sample, the buffer is
    /// compacted at the same capacity; otherwise it grows by one block and
    /// every sample is kept.
    fn resize_plan(&self) -> ResizePlan {
        let newest = self.times[self.times.len() - 1];
        let span = newest.signed_duration_since(self.times[self.block]);
        if span >= self.history_length {
            ResizePlan {
                new_capacity: self.capacity,
                keep: self.capacity - self.block,
            }
        } else {
            ResizePlan {
                new_capacity: self.capacity + self.block,
                keep: self.capacity,
            }
        }
    }

    /// Reallocate a full buffer, flushing pending log data first so nothing
    /// is lost across the resize.
    fn make_room(&mut self) -> MasResult<()> {
        if self.logging {
            self.write_log()?;
        }

        let plan = self.resize_plan();
        debug!(
            capacity = plan.new_capacity,
            keep = plan.keep,
            "history arrays full, reallocating"
        );

        let start = self.times.len() - plan.keep;
        let mut times = Vec::with_capacity(plan.new_capacity);
        let mut values = Vec::with_capacity(plan.new_capacity);
        times.extend_from_slice(&self.times[start..]);
        values.extend_from_slice(&self.values[start..]);
        self.times = times;
        self.values = values;
        self.capacity = plan.new_capacity;
        Ok(())
    }

    /// The suffix of points within `window` of the most recent sample.
    ///
    /// Located by binary search over the sorted timestamp prefix. Returns
    /// `None` when fewer than two points exist (nothing to draw a line with).
    pub fn active_range(&self, window: TimeDelta) -> Option<(&[DateTime<Local>], &[Sample])> {
        if self.times.len() <= 1 {
            return None;
        }
        let start_time = *self.times.last()? - window;
        let start = self.times.partition_point(|t| *t < start_time);
        Some((&self.times[start..], &self.values[start..]))
    }

    /// Write every filled point to a new file named from the first and last
    /// timestamps. A no-op (returning `None`) with fewer than two points.
    pub fn save_history(&self) -> MasResult<Option<PathBuf>> {
        if self.times.len() <= 1 {
            return Ok(None);
        }
        if !self.can_save {
            return Err(MasError::Persistence(
                "log directory is not writable".into(),
            ));
        }

        let path = self.save_name(self.times[0], self.times[self.times.len() - 1]);
        let mut writer = BufWriter::new(fs::File::create(&path)?);
        self.write_points(&mut writer, 0..self.times.len())?;
        writer.flush()?;
        debug!(path = %path.display(), points = self.times.len(), "history saved");
        Ok(Some(path))
    }

    /// Start incremental logging. The log window begins now; only samples
    /// stamped after this moment get flushed.
    ///
    /// # Panics
    /// Panics if logging is already active - that is a caller bug.
    pub fn begin_logging(&mut self) -> MasResult<()> {
        assert!(!self.logging, "cannot begin logging while logging is active");
        if !self.can_save {
            return Err(MasError::Persistence(
                "log directory is not writable".into(),
            ));
        }
        let now = Local::now();
        self.log_start = now;
        self.log_end = now;
        self.logging = true;
        Ok(())
    }

    /// Flush samples collected since the last flush to the log file, then
    /// rename it so its name reflects the new end timestamp.
    ///
    /// # Panics
    /// Panics if logging is not active - that is a caller bug.
    pub fn write_log(&mut self) -> MasResult<()> {
        assert!(self.logging, "cannot write log data while logging is inactive");
        if !self.can_save {
            return Err(MasError::Persistence(
                "log directory is not writable".into(),
            ));
        }

        let old_path = self.save_name(self.log_start, self.log_end);
        let new_end = match self.times.last() {
            Some(last) => *last,
            None => self.log_end,
        };
        let new_path = self.save_name(self.log_start, new_end);

        let start = self.times.partition_point(|t| *t <= self.log_end);
        {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&old_path)?;
            let mut writer = BufWriter::new(file);
            self.write_points(&mut writer, start..self.times.len())?;
            writer.flush()?;
        }
        if new_path != old_path {
            fs::rename(&old_path, &new_path)?;
        }
        debug!(
            path = %new_path.display(),
            points = self.times.len() - start,
            "log flushed"
        );

        self.log_end = new_end;
        Ok(())
    }

    /// Flush any unlogged samples and stop incremental logging.
    ///
    /// # Panics
    /// Panics if logging is not active - that is a caller bug.
    pub fn end_logging(&mut self) -> MasResult<()> {
        assert!(self.logging, "cannot end logging while logging is inactive");
        self.write_log()?;
        self.logging = false;
        let now = Local::now();
        self.log_start = now;
        self.log_end = now;
        Ok(())
    }

    /// File path for a span of samples.
    fn save_name(&self, start: DateTime<Local>, end: DateTime<Local>) -> PathBuf {
        let name = format!("{}__{}_spin_log.dat", stamp(start), stamp(end));
        self.log_dir.join(name)
    }

    fn write_points(&self, writer: &mut impl Write, range: Range<usize>) -> MasResult<()> {
        for i in range {
            writeln!(writer, "{} {:>6}", stamp(self.times[i]), self.values[i])?;
        }
        Ok(())
    }
}

/// Format a timestamp for log lines and file names.
fn stamp(time: DateTime<Local>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Whether `dir` exists and looks writable.
fn dir_writable(dir: &Path) -> bool {
    match fs::metadata(dir) {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(_) => false,
    }
}
