//! Persisted event files.
//!
//! A file is a sequence of codec-encoded [`Event`] records in one of two framings,
//! fixed for the whole file when it is opened:
//!
//! - [`FileVersion::V1`]: records laid end to end. Skipping `n` records means
//!   decoding and discarding them.
//! - [`FileVersion::V2`]: every record is wrapped in a `u32` length prefix, so a
//!   reader skips `n` records by reading each length and seeking past the body.
//!
//! [`FileDeserializer`] is the streaming byte source behind [`FileReader`]. Short
//! reads are retried with a fixed backoff up to a bounded number of attempts,
//! which lets a reader follow a file that a data collector is still writing.

use super::{BufferSerializer, Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// On-disk record framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileVersion {
    /// Records laid end to end.
    V1,
    /// Records wrapped in a `u32` length prefix.
    #[default]
    V2,
}

impl TryFrom<u32> for FileVersion {
    type Error = DaqError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FileVersion::V1),
            2 => Ok(FileVersion::V2),
            other => Err(DaqError::Configuration(format!(
                "unsupported event file version {other}"
            ))),
        }
    }
}

/// How long a reader keeps waiting for bytes that are not there yet.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Consecutive zero-byte reads tolerated before giving up.
    pub max_retries: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1000,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Streaming, buffered byte source over a file.
pub struct FileDeserializer {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
    start: usize,
    stop: usize,
    fail_on_eof: bool,
    retry: RetryPolicy,
    interrupt: Arc<AtomicBool>,
}

impl FileDeserializer {
    /// Open `path` for reading.
    ///
    /// With `fail_on_eof` set, hitting end of file in the middle of a value is an
    /// immediate [`DaqError::ReadUnderrun`]; otherwise the reader waits for the
    /// file to grow according to `retry`.
    pub fn open(path: impl AsRef<Path>, fail_on_eof: bool, retry: RetryPolicy) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            DaqError::FileRead(format!("unable to open {}: {e}", path.display()))
        })?;
        Ok(Self {
            path,
            file,
            buf: vec![0u8; DEFAULT_BUFFER_SIZE],
            start: 0,
            stop: 0,
            fail_on_eof,
            retry,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle that aborts a blocked read with [`DaqError::Interrupted`].
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    fn level(&self) -> usize {
        self.stop - self.start
    }

    /// Make sure at least `min` bytes are buffered.
    ///
    /// `min == 0` performs a single non-blocking attempt, used by `has_data`.
    fn fill_buffer(&mut self, min: usize) -> AppResult<()> {
        if self.level() == 0 {
            self.start = 0;
            self.stop = 0;
        }
        if self.buf.len() - self.start < min {
            // shift the unread tail to the front, grow if one value is larger than the buffer
            self.buf.copy_within(self.start..self.stop, 0);
            self.stop -= self.start;
            self.start = 0;
            if self.buf.len() < min {
                self.buf.resize(min, 0);
            }
        }

        let read = self.file.read(&mut self.buf[self.stop..])?;
        self.stop += read;

        let mut failed_attempts = 0u32;
        while self.level() < min {
            if self.fail_on_eof {
                return Err(DaqError::ReadUnderrun {
                    needed: min,
                    available: self.level(),
                });
            }
            if self.interrupt.swap(false, Ordering::SeqCst) {
                return Err(DaqError::Interrupted);
            }
            if failed_attempts >= self.retry.max_retries {
                return Err(DaqError::FileRead(format!(
                    "{}: too many failed attempts (reading 0 bytes)",
                    self.path.display()
                )));
            }
            std::thread::sleep(self.retry.backoff);
            let bytes = self.file.read(&mut self.buf[self.stop..])?;
            if bytes == 0 {
                failed_attempts += 1;
            } else {
                failed_attempts = 0;
            }
            self.stop += bytes;
        }
        Ok(())
    }

    /// Consume `len` bytes without decoding them, seeking past whatever is not buffered.
    pub fn skip_bytes(&mut self, len: u64) -> AppResult<()> {
        let buffered = self.level() as u64;
        if len <= buffered {
            self.start += len as usize;
            return Ok(());
        }
        let rest = len - buffered;
        if self.fail_on_eof {
            let position = self.file.stream_position()?;
            let remaining = self.file.metadata()?.len().saturating_sub(position);
            if rest > remaining {
                return Err(DaqError::ReadUnderrun {
                    needed: usize::try_from(len).unwrap_or(usize::MAX),
                    available: usize::try_from(buffered + remaining).unwrap_or(usize::MAX),
                });
            }
        }
        self.start = 0;
        self.stop = 0;
        let rest = i64::try_from(rest)
            .map_err(|_| DaqError::FileRead(format!("skip of {len} bytes out of range")))?;
        self.file.seek(SeekFrom::Current(rest))?;
        Ok(())
    }
}

impl Deserializer for FileDeserializer {
    fn deserialize(&mut self, dst: &mut [u8]) -> AppResult<()> {
        if self.level() < dst.len() {
            self.fill_buffer(dst.len())?;
        }
        dst.copy_from_slice(&self.buf[self.start..self.start + dst.len()]);
        self.start += dst.len();
        Ok(())
    }

    fn pre_deserialize(&mut self, dst: &mut [u8]) -> AppResult<()> {
        if self.level() < dst.len() {
            self.fill_buffer(dst.len())?;
        }
        dst.copy_from_slice(&self.buf[self.start..self.start + dst.len()]);
        Ok(())
    }

    fn has_data(&mut self) -> AppResult<bool> {
        if self.level() == 0 {
            self.fill_buffer(0)?;
        }
        Ok(self.level() > 0)
    }
}

/// Reads events from a persisted file.
pub struct FileReader {
    de: FileDeserializer,
    version: FileVersion,
    records_read: u64,
}

impl FileReader {
    /// Open a finished file: end of file inside a record is an error.
    pub fn open(path: impl AsRef<Path>, version: FileVersion) -> AppResult<Self> {
        Self::with_options(path, version, true, RetryPolicy::default())
    }

    /// Open a file that may still be growing.
    pub fn follow(path: impl AsRef<Path>, version: FileVersion, retry: RetryPolicy) -> AppResult<Self> {
        Self::with_options(path, version, false, retry)
    }

    fn with_options(
        path: impl AsRef<Path>,
        version: FileVersion,
        fail_on_eof: bool,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        Ok(Self {
            de: FileDeserializer::open(path, fail_on_eof, retry)?,
            version,
            records_read: 0,
        })
    }

    /// Framing this reader was opened with.
    pub fn version(&self) -> FileVersion {
        self.version
    }

    /// Records consumed so far, skipped ones included.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Handle that interrupts a blocked read.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.de.interrupt_handle()
    }

    /// Skip `skip` records and return the one after them.
    ///
    /// Returns `Ok(None)` when the file ends before that record starts.
    pub fn read_event(&mut self, skip: usize) -> AppResult<Option<Event>> {
        for _ in 0..skip {
            if !self.de.has_data()? {
                debug!(skipped = self.records_read, "end of file while skipping");
                return Ok(None);
            }
            match self.version {
                FileVersion::V1 => {
                    Event::decode(&mut self.de)?;
                }
                FileVersion::V2 => {
                    let len = u32::decode(&mut self.de)?;
                    self.de.skip_bytes(u64::from(len))?;
                }
            }
            self.records_read += 1;
        }

        if !self.de.has_data()? {
            return Ok(None);
        }
        let event = match self.version {
            FileVersion::V1 => Event::decode(&mut self.de)?,
            FileVersion::V2 => {
                let mut record = BufferSerializer::decode(&mut self.de)?;
                let event = Event::decode(&mut record)?;
                if !record.is_empty() {
                    warn!(trailing = record.len(), "record longer than its event");
                }
                event
            }
        };
        self.records_read += 1;
        Ok(Some(event))
    }
}

impl Iterator for FileReader {
    type Item = AppResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_event(0).transpose()
    }
}

/// Appends events to a file.
pub struct FileWriter {
    path: PathBuf,
    out: BufWriter<File>,
    version: FileVersion,
    bytes_written: u64,
    events_written: u64,
}

impl FileWriter {
    /// Create (or truncate) `path`.
    pub fn create(path: impl AsRef<Path>, version: FileVersion) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            version,
            bytes_written: 0,
            events_written: 0,
        })
    }

    /// Append one event using this file's framing.
    pub fn write_event(&mut self, event: &Event) -> AppResult<()> {
        match self.version {
            FileVersion::V1 => event.encode(self)?,
            FileVersion::V2 => {
                let record = BufferSerializer::encode_value(event)?;
                record.encode(self)?;
            }
        }
        self.events_written += 1;
        Ok(())
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes handed to the file so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Events appended so far.
    pub fn events_written(&self) -> u64 {
        self.events_written
    }
}

impl Serializer for FileWriter {
    fn serialize(&mut self, data: &[u8]) -> AppResult<()> {
        self.out.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!(path = %self.path.display(), "flush on close failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn sample(n: u32) -> Event {
        let mut ev = Event::new("RawEvent", 3, 1);
        ev.set_event_n(n);
        ev.add_block(0, vec![n as u8; (n as usize % 5) + 1]);
        ev.set_tag("index", n.to_string());
        ev
    }

    fn write_file(version: FileVersion, count: u32) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path(), version).unwrap();
        for n in 0..count {
            writer.write_event(&sample(n)).unwrap();
        }
        writer.flush().unwrap();
        file
    }

    #[test]
    fn reads_back_in_order_for_both_versions() {
        for version in [FileVersion::V1, FileVersion::V2] {
            let file = write_file(version, 6);
            let reader = FileReader::open(file.path(), version).unwrap();
            let numbers: Vec<u32> = reader.map(|ev| ev.unwrap().event_n()).collect();
            assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5], "{version:?}");
        }
    }

    #[test]
    fn skip_returns_the_following_record() {
        for version in [FileVersion::V1, FileVersion::V2] {
            let file = write_file(version, 10);
            let mut reader = FileReader::open(file.path(), version).unwrap();
            let ev = reader.read_event(4).unwrap().unwrap();
            assert_eq!(ev.event_n(), 4);
            assert_eq!(reader.read_event(0).unwrap().unwrap().event_n(), 5);
            assert_eq!(reader.records_read(), 6);
        }
    }

    #[test]
    fn skipping_past_the_end_yields_none() {
        let file = write_file(FileVersion::V2, 3);
        let mut reader = FileReader::open(file.path(), FileVersion::V2).unwrap();
        assert!(reader.read_event(5).unwrap().is_none());
    }

    #[test]
    fn v2_records_carry_their_length() {
        let file = write_file(FileVersion::V2, 1);
        let raw = std::fs::read(file.path()).unwrap();
        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        assert_eq!(len + 4, raw.len());
    }

    #[test]
    fn truncated_record_fails_fast_when_eof_is_fatal() {
        let file = write_file(FileVersion::V1, 2);
        let raw = std::fs::read(file.path()).unwrap();
        std::fs::write(file.path(), &raw[..raw.len() - 3]).unwrap();

        let mut reader = FileReader::open(file.path(), FileVersion::V1).unwrap();
        assert!(reader.read_event(0).unwrap().is_some());
        assert!(matches!(
            reader.read_event(0),
            Err(DaqError::ReadUnderrun { .. })
        ));
    }

    #[test]
    fn skipping_a_truncated_record_fails_fast_when_eof_is_fatal() {
        let file = write_file(FileVersion::V2, 3);
        let raw = std::fs::read(file.path()).unwrap();
        std::fs::write(file.path(), &raw[..raw.len() - 3]).unwrap();

        let mut reader = FileReader::open(file.path(), FileVersion::V2).unwrap();
        assert!(matches!(
            reader.read_event(3),
            Err(DaqError::ReadUnderrun { .. })
        ));
    }

    #[test]
    fn following_reader_gives_up_after_retry_budget() {
        let file = write_file(FileVersion::V1, 1);
        let raw = std::fs::read(file.path()).unwrap();
        std::fs::write(file.path(), &raw[..raw.len() - 1]).unwrap();

        let retry = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(1),
        };
        let mut reader = FileReader::follow(file.path(), FileVersion::V1, retry).unwrap();
        assert!(matches!(reader.read_event(0), Err(DaqError::FileRead(_))));
    }

    #[test]
    fn unknown_version_number_is_rejected() {
        assert!(FileVersion::try_from(3).is_err());
        assert_eq!(FileVersion::try_from(1).unwrap(), FileVersion::V1);
    }

    #[test]
    fn writer_counts_bytes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path(), FileVersion::V2).unwrap();
        writer.write_event(&sample(1)).unwrap();
        writer.flush().unwrap();
        let on_disk = std::fs::metadata(file.path()).unwrap().len();
        assert_eq!(writer.bytes_written(), on_disk);
        assert_eq!(writer.events_written(), 1);
    }
}
