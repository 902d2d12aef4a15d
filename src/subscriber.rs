//! Tails a queue directory: resolves logical offsets to segments, blocks on
//! the offset semaphore for new data, and streams frames to a caller
//! callback in strict offset order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame;
use crate::lockfile;
use crate::mmap::MappedWindow;
use crate::params::Params;
use crate::segment;
use crate::semaphore::{self, SemaphoreClient};
use crate::{Error, Result};

pub struct Subscriber {
    root: PathBuf,
    params: Params,
    client: SemaphoreClient,
    segments: Vec<u64>,
    reader: Option<(u64, MappedWindow)>,
}

impl Subscriber {
    /// Verifies the queue directory's permissions and attaches to its
    /// semaphore set read-only. Tolerates the publisher being absent or
    /// never having run past directory creation — it can still follow
    /// whatever data already exists and block for more.
    pub fn open(root: impl AsRef<Path>, params: Option<Params>) -> Result<Self> {
        let root = root.as_ref();
        let params = params.unwrap_or_default();
        lockfile::check_owner_only_dir(root)?;
        let lock_path = semaphore::lock_path_for(root);
        let client = SemaphoreClient::open(&lock_path)?;
        let segments = segment::list(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            params,
            client,
            segments,
            reader: None,
        })
    }

    fn find_segment(&self, from: u64) -> Option<u64> {
        self.segments.iter().rev().find(|&&start| start <= from).copied()
    }

    /// Opens (or repositions) the reader window so it's seeked to `from`
    /// within the segment containing it. Re-enumerates segments if the
    /// cached list can't resolve `from` or disagrees with the currently
    /// open segment.
    fn ensure_reader(&mut self, from: u64) -> Result<()> {
        let mut candidate = self.find_segment(from);
        let stale = match (&self.reader, candidate) {
            (_, None) => true,
            (Some((current, _)), Some(found)) => *current != found,
            (None, Some(_)) => false,
        };
        if stale {
            self.segments = segment::list(&self.root)?;
            candidate = self.find_segment(from);
        }
        let start = candidate.ok_or(Error::NotFound)?;

        let need_open = match &self.reader {
            Some((current, _)) => *current != start,
            None => true,
        };
        if need_open {
            let path = segment::segment_path(&self.root, start);
            let window = MappedWindow::reader(&path, self.params.window_size, self.params.page_size)?;
            self.reader = Some((start, window));
        }
        let (segment_start, window) = self.reader.as_mut().expect("just populated");
        window.seek(from - *segment_start)?;
        Ok(())
    }

    /// Blocks (up to `timeout_ms`) until data past `from` is visible, then
    /// delivers every complete frame from `from` onward to `handler(id,
    /// payload)` until the handler returns `false` or the segment's
    /// available data is exhausted. Returns the offset to resume from.
    /// Never errors on end-of-data — a `from`-equal-to-return means "wait
    /// and call again."
    pub fn pull<F>(&mut self, from: u64, mut handler: F, timeout_ms: u64) -> Result<u64>
    where
        F: FnMut(u64, &[u8]) -> bool,
    {
        let mut latest = self.client.get()?;
        if from >= latest {
            latest = self.client.wait_next(from, Some(Duration::from_millis(timeout_ms)))?;
            if latest <= from {
                return Ok(from);
            }
        }

        self.ensure_reader(from)?;
        let (segment_start, window) = self.reader.as_mut().expect("ensure_reader populates reader");
        let segment_start = *segment_start;

        loop {
            match frame::scan_next(window)? {
                Some(frame) => {
                    let id = segment_start + frame.id;
                    let keep_going = handler(id, frame.payload);
                    if !keep_going {
                        return Ok(segment_start + window.last_position());
                    }
                }
                None => return Ok(segment_start + window.last_position()),
            }
        }
    }

    /// Positions the read cursor at the greatest committed offset without
    /// delivering any records.
    pub fn seek_to_end(&mut self) -> Result<u64> {
        let latest = self.client.get()?;
        if latest == 0 {
            return Ok(0);
        }
        self.ensure_reader(latest)?;
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Publisher;

    #[test]
    fn seek_to_end_skips_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut publisher = Publisher::open(dir.path(), None).unwrap();
        publisher.push(b"one").unwrap();
        let boundary = publisher.push(b"two").unwrap();
        // `signal` only sets the atomic last_value; give the flusher thread
        // a moment to publish it through `semctl` before reading it back.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut subscriber = Subscriber::open(dir.path(), None).unwrap();
        let at_end = subscriber.seek_to_end().unwrap();
        assert_eq!(at_end, boundary);

        publisher.push(b"three").unwrap();
        let mut seen = Vec::new();
        subscriber
            .pull(at_end, |_id, payload| {
                seen.push(payload.to_vec());
                true
            }, 200)
            .unwrap();
        assert_eq!(seen, vec![b"three".to_vec()]);
    }

    #[test]
    fn pull_times_out_without_new_data() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Publisher::open(dir.path(), None).unwrap();
        let mut subscriber = Subscriber::open(dir.path(), None).unwrap();
        let next = subscriber.pull(0, |_, _| true, 50).unwrap();
        assert_eq!(next, 0);
        drop(publisher);
    }
}
