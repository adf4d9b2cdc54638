//! # Track logger
//!
//! Owns the currently open daily log file (spec.md 3 Ownership) and drives
//! the [`crate::track`] encoder into it through a write-through buffer, with
//! size-bounded retention and a GPS/monotonic-clock sanity filter.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use crate::fmt::{error, info, warn};
use crate::host::fs::{Directory, File, FileSystem, MAX_NAME_LEN};
use crate::track::{TrackEncoder, TrackPoint, TrackVersion};

/// Runtime-tunable sizes (spec.md 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoggerConfig {
    pub max_total_bytes: u32,
    pub sanity_max_jump: Duration,
    pub full_block_interval: u32,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 520 * 1024,
            sanity_max_jump: Duration::from_secs(3600),
            full_block_interval: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum LoggerError {
    FileOpenFailed,
    WriteShort,
    FlushFailed,
}

/// A calendar date, used only to decide when to rotate to a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

fn file_name(date: Date) -> String<MAX_NAME_LEN> {
    let mut s = String::new();
    let _ = write!(s, "{:04}{:02}{:02}.gpx", date.year, date.month, date.day);
    s
}

/// `BUF` is the write-through buffer capacity (spec.md 6 default 4096).
pub struct TrackLogger<FS: FileSystem, const BUF: usize = 4096> {
    fs: FS,
    config: LoggerConfig,
    version: TrackVersion,
    current_date: Option<Date>,
    file: Option<FS::File>,
    buffer: Vec<u8, BUF>,
    encoder: TrackEncoder,
    last_accepted: Option<(u32, Instant)>,
}

impl<FS: FileSystem, const BUF: usize> TrackLogger<FS, BUF> {
    pub fn new(fs: FS, config: LoggerConfig, version: TrackVersion) -> Self {
        let full_block_interval = config.full_block_interval;
        Self {
            fs,
            config,
            version,
            current_date: None,
            file: None,
            buffer: Vec::new(),
            encoder: TrackEncoder::new(version, full_block_interval),
            last_accepted: None,
        }
    }

    /// Reject a point whose GPS timestamp jumped implausibly relative to the
    /// monotonic clock's elapsed time since the last accepted point
    /// (spec.md 4.7, P10).
    fn passes_sanity_filter(&self, point: &TrackPoint, now: Instant) -> bool {
        let Some((last_gps, last_mono)) = self.last_accepted else { return true };
        let gps_delta_s = (point.timestamp as i64 - last_gps as i64).unsigned_abs();
        let mono_delta_s = (now - last_mono).as_secs();
        let drift = gps_delta_s.abs_diff(mono_delta_s);
        drift <= self.config.sanity_max_jump.as_secs()
    }

    /// Encode and append `point`, rotating the file if `date` differs from
    /// the currently open day. Silently drops points that fail the sanity
    /// filter (spec.md 7: not an error, just not logged).
    pub async fn record(&mut self, point: TrackPoint, date: Date, now: Instant) -> Result<(), LoggerError> {
        if !self.passes_sanity_filter(&point, now) {
            warn!("track logger: rejecting point, implausible timestamp jump");
            return Ok(());
        }

        if self.current_date != Some(date) {
            self.rotate(date).await?;
        }

        let mut encoded = [0u8; crate::track::MAX_BLOCK_LEN];
        let len = self.encoder.encode(point, &mut encoded).map_err(|_| LoggerError::WriteShort)?;

        if self.buffer.len() + len > self.buffer.capacity() {
            self.flush().await?;
        }
        self.buffer.extend_from_slice(&encoded[..len]).map_err(|_| LoggerError::WriteShort)?;
        self.last_accepted = Some((point.timestamp, now));
        Ok(())
    }

    /// Force the write-through buffer to storage.
    pub async fn flush(&mut self) -> Result<(), LoggerError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(file) = self.file.as_mut() else {
            self.buffer.clear();
            return Err(LoggerError::FlushFailed);
        };
        let written = file.write(&self.buffer).await.map_err(|_| LoggerError::FlushFailed)?;
        if written != self.buffer.len() {
            self.file = None;
            self.buffer.clear();
            return Err(LoggerError::WriteShort);
        }
        file.flush().await.map_err(|_| LoggerError::FlushFailed)?;
        self.buffer.clear();
        Ok(())
    }

    async fn rotate(&mut self, date: Date) -> Result<(), LoggerError> {
        if self.file.is_some() {
            if self.flush().await.is_err() {
                error!("track logger: flush failed during rotation, dropping current file");
            }
            self.file = None;
            if let Err(e) = self.retention_sweep().await {
                error!("track logger: retention sweep failed: {:?}", e);
            }
        }

        let name = file_name(date);
        let file = self.fs.open(&name, true).await.map_err(|_| LoggerError::FileOpenFailed)?;
        self.file = Some(file);
        self.current_date = Some(date);
        self.encoder.reset();
        self.last_accepted = None;
        info!("track logger: rotated to new daily file");
        Ok(())
    }

    /// Sum the sizes of `.gpx` files in lexicographic (== chronological)
    /// order, deleting the oldest while the total exceeds the retention cap
    /// (spec.md 4.7, P9).
    pub async fn retention_sweep(&mut self) -> Result<(), LoggerError> {
        let mut names: Vec<(String<MAX_NAME_LEN>, u32), 64> = Vec::new();
        let mut dir = self.fs.open_dir("/").await.map_err(|_| LoggerError::FileOpenFailed)?;
        while let Ok(Some(entry)) = dir.next().await {
            if entry.is_dir || !entry.name.ends_with(".gpx") {
                continue;
            }
            let _ = names.push((entry.name, entry.size));
        }
        names.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut total: u64 = names.iter().map(|(_, size)| *size as u64).sum();
        let cap = self.config.max_total_bytes as u64;
        let mut idx = 0;
        while total > cap && names.len() - idx > 1 {
            let (name, size) = &names[idx];
            if self.fs.delete(name).await.is_ok() {
                total -= *size as u64;
            }
            idx += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fs::{FileEntry, FsError};

    struct MemFile {
        data: Vec<u8, 8192>,
    }

    impl File for MemFile {
        async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }

        async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
            self.data.extend_from_slice(buf).map_err(|_| FsError::Io)?;
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), FsError> {
            Ok(())
        }

        async fn size(&mut self) -> Result<u32, FsError> {
            Ok(self.data.len() as u32)
        }
    }

    struct EmptyDir;
    impl Directory for EmptyDir {
        async fn next(&mut self) -> Result<Option<FileEntry>, FsError> {
            Ok(None)
        }
    }

    struct MemFs;

    impl MemFs {
        fn new() -> Self {
            Self
        }
    }

    impl FileSystem for MemFs {
        type File = MemFile;
        type Dir = EmptyDir;

        async fn open(&mut self, path: &str, _append: bool) -> Result<Self::File, FsError> {
            let _ = path;
            Ok(MemFile { data: Vec::new() })
        }

        async fn open_dir(&mut self, _path: &str) -> Result<Self::Dir, FsError> {
            Ok(EmptyDir)
        }

        async fn delete(&mut self, _path: &str) -> Result<(), FsError> {
            Ok(())
        }
    }

    fn block_on<F: core::future::Future>(mut fut: F) -> F::Output {
        use core::pin::Pin;
        use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(core::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
        loop {
            if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
                return v;
            }
        }
    }

    #[test]
    fn first_write_rotates_into_a_named_file() {
        let fs = MemFs::new();
        let mut logger: TrackLogger<MemFs, 4096> =
            TrackLogger::new(fs, LoggerConfig::default(), TrackVersion::V2);
        let date = Date { year: 2026, month: 7, day: 26 };
        let point = TrackPoint::new(1000, 10, 20, 1);
        block_on(logger.record(point, date, Instant::from_millis(0))).unwrap();
        assert_eq!(logger.current_date, Some(date));
    }

    #[test]
    fn sanity_filter_rejects_a_wild_timestamp_jump() {
        let fs = MemFs::new();
        let mut logger: TrackLogger<MemFs, 4096> =
            TrackLogger::new(fs, LoggerConfig::default(), TrackVersion::V2);
        let date = Date { year: 2026, month: 7, day: 26 };
        let t0 = Instant::from_millis(0);
        block_on(logger.record(TrackPoint::new(1000, 10, 20, 1), date, t0)).unwrap();

        let t1 = t0 + Duration::from_secs(10);
        // GPS jumped by 10000s while only 10s of monotonic time passed.
        block_on(logger.record(TrackPoint::new(11000, 10, 20, 1), date, t1)).unwrap();
        assert_eq!(logger.last_accepted, Some((1000, t0)));
    }

    #[test]
    fn file_name_formats_as_yyyymmdd_gpx() {
        let name = file_name(Date { year: 2026, month: 7, day: 6 });
        assert_eq!(name.as_str(), "20260706.gpx");
    }
}
