//! Single-writer append path: owns the queue's exclusive lock, the active
//! segment's writer window, and the offset semaphore.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame;
use crate::lockfile;
use crate::mmap::MappedWindow;
use crate::params::Params;
use crate::segment;
use crate::semaphore::{self, OffsetSemaphore};
use crate::{Error, Result};

pub struct Publisher {
    root: PathBuf,
    params: Params,
    semaphore: OffsetSemaphore,
    segment_start: u64,
    writer: MappedWindow,
}

/// Opens the last segment read-only and replays it with the frame scanner
/// to find the last complete record boundary. A torn tail (partial frame,
/// zeroed bytes from a crash) naturally truncates here, never hard-errors.
fn recover_last_position(path: &Path, params: &Params) -> Result<u64> {
    let mut reader = match MappedWindow::reader(path, params.window_size, params.page_size) {
        Ok(reader) => reader,
        Err(Error::Empty) => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut last_position = 0u64;
    loop {
        match frame::scan_next(&mut reader) {
            Ok(Some(_)) => last_position = reader.last_position(),
            Ok(None) => return Ok(last_position),
            Err(err) => return Err(err),
        }
    }
}

fn crosses_roll_threshold(last_position: u64, params: &Params) -> bool {
    last_position > params.max_file_size && last_position > params.window_size as u64
}

impl Publisher {
    /// Acquires exclusive ownership of the queue directory, recovers the
    /// writer's resume position from the last segment (if any), rolls to a
    /// fresh segment if recovery lands past the roll thresholds, and
    /// resyncs the offset semaphore before any new record is written.
    pub fn open(root: impl AsRef<Path>, params: Option<Params>) -> Result<Self> {
        let root = root.as_ref();
        let params = params.unwrap_or_default();
        if !params.is_valid() {
            return Err(Error::InvalidArgument("max_file_size must exceed window_size"));
        }

        lockfile::ensure_queue_dir(root)?;
        let lock_path = semaphore::lock_path_for(root);
        let semaphore = OffsetSemaphore::open_server(&lock_path, Duration::from_millis(params.sync_throttle_ms))?;

        let segments = segment::list(root)?;
        let (mut segment_start, mut last_position) = match segments.last() {
            Some(&start) => {
                let path = segment::segment_path(root, start);
                (start, recover_last_position(&path, &params)?)
            }
            None => (0u64, 0u64),
        };

        if crosses_roll_threshold(last_position, &params) {
            segment_start += last_position;
            last_position = 0;
        }

        semaphore.set(segment_start + last_position)?;

        let path = segment::segment_path(root, segment_start);
        let mut writer = MappedWindow::writer(&path, params.window_size, params.page_size)?;
        if last_position != 0 {
            writer.seek(last_position)?;
        }

        log::info!(
            "publisher opened {} at segment {segment_start:016X} position {last_position}",
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            params,
            semaphore,
            segment_start,
            writer,
        })
    }

    /// Current committed logical offset (the value last sent to the
    /// semaphore's `last_value`, not yet necessarily visible to readers).
    pub fn committed_offset(&self) -> u64 {
        self.segment_start + self.writer.last_position()
    }

    fn after_push(&mut self) -> Result<u64> {
        let relative = self.writer.last_position();
        let committed = self.segment_start + relative;
        self.semaphore.signal(committed);
        if crosses_roll_threshold(relative, &self.params) {
            self.roll(committed)?;
        }
        Ok(committed)
    }

    fn roll(&mut self, new_start: u64) -> Result<()> {
        self.writer.flush()?;
        let path = segment::segment_path(&self.root, new_start);
        self.writer = MappedWindow::writer(&path, self.params.window_size, self.params.page_size)?;
        self.segment_start = new_start;
        log::debug!("segment roll to {new_start:016X}");
        Ok(())
    }

    /// Appends one framed record, signals the new committed offset, and
    /// rolls to a fresh segment if the roll thresholds were crossed. Rolling
    /// happens strictly after the record is complete — never mid-record.
    pub fn push(&mut self, payload: &[u8]) -> Result<u64> {
        frame::put(&mut self.writer, payload)?;
        self.after_push()
    }

    /// Same as `push`, but the record's payload is the concatenation of
    /// `buffers`; a reader cannot distinguish it from a single flat push of
    /// the same total length.
    pub fn push_vectored(&mut self, buffers: &[&[u8]]) -> Result<u64> {
        frame::put_vectored(&mut self.writer, buffers)?;
        self.after_push()
    }

    /// Tears down a queue directory entirely: removes the semaphore set,
    /// releases and unlinks the lock file, and unlinks every segment. Never
    /// called on the steady path.
    pub fn cleanup_all(root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        let lock_path = semaphore::lock_path_for(root);
        OffsetSemaphore::cleanup_all(&lock_path)?;
        for start in segment::list(root).unwrap_or_default() {
            let _ = std::fs::remove_file(segment::segment_path(root, start));
        }
        Ok(())
    }
}
