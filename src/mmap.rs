//! Page-aligned sliding mmap window over a single file.
//!
//! One concrete type with a mode flag (writer vs. reader) rather than two
//! types sharing a virtual base — the source's split between writer/reader
//! mmap implementations added no leverage once ported, per the design notes.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{Error, Result};

enum Backing {
    Writer(MmapMut),
    Reader(Mmap),
}

struct Aligned {
    file_offset: usize,
    size: usize,
    cursor: usize,
}

/// `(ptr, size, file_offset, cursor)` per spec.md §3 — `last_position =
/// file_offset + cursor`.
pub struct MappedWindow {
    file: File,
    backing: Backing,
    file_offset: usize,
    size: usize,
    cursor: usize,
    page_size: usize,
    window_size: usize,
    remaps: u64,
}

fn align_window(offset: u64, size: usize, page_size: usize) -> Aligned {
    let offset = offset as usize;
    if offset % page_size == 0 {
        Aligned {
            file_offset: offset,
            size,
            cursor: 0,
        }
    } else {
        let aligned_offset = (offset / page_size) * page_size;
        Aligned {
            file_offset: aligned_offset,
            size: size + 2 * page_size,
            cursor: offset - aligned_offset,
        }
    }
}

fn ensure_file_len(file: &File, required: u64) -> Result<()> {
    let current = file.metadata()?.len();
    if current < required {
        file.set_len(required)?;
    }
    Ok(())
}

fn open_rdwr_or_create(path: &Path) -> Result<File> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(Into::into),
        Err(err) => Err(err.into()),
    }
}

impl MappedWindow {
    /// Opens (creating if absent) `path` for writing and maps `[0,
    /// window_size)`, extending the file first if it is shorter.
    pub fn writer(path: &Path, window_size: usize, page_size: usize) -> Result<Self> {
        let file = open_rdwr_or_create(path)?;
        ensure_file_len(&file, window_size as u64)?;
        let mmap = unsafe {
            MmapOptions::new()
                .offset(0)
                .len(window_size)
                .map_mut(&file)
        }
        .map_err(Error::MmapFailed)?;
        Ok(Self {
            file,
            backing: Backing::Writer(mmap),
            file_offset: 0,
            size: window_size,
            cursor: 0,
            page_size,
            window_size,
            remaps: 0,
        })
    }

    /// Opens `path` read-only and maps `[0, min(window_size, file_size))`.
    pub fn reader(path: &Path, window_size: usize, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(Error::Empty);
        }
        let mapped_size = window_size.min(file_len as usize);
        let mmap = unsafe { MmapOptions::new().offset(0).len(mapped_size).map(&file) }
            .map_err(Error::MmapFailed)?;
        Ok(Self {
            file,
            backing: Backing::Reader(mmap),
            file_offset: 0,
            size: mapped_size,
            cursor: 0,
            page_size,
            window_size,
            remaps: 0,
        })
    }

    #[inline]
    pub fn last_position(&self) -> u64 {
        (self.file_offset + self.cursor) as u64
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    #[inline]
    pub fn remap_count(&self) -> u64 {
        self.remaps
    }

    fn is_writer(&self) -> bool {
        matches!(self.backing, Backing::Writer(_))
    }

    /// `get_ptr()`: the byte at the current cursor plus how many bytes
    /// remain in the mapped window after it. Valid only until the next
    /// `advance`/`seek`/`write`/`get` that causes a remap.
    pub fn get_ptr(&self) -> Result<(*const u8, usize)> {
        if self.cursor >= self.size {
            return Err(Error::Exhausted);
        }
        let base = match &self.backing {
            Backing::Writer(m) => m.as_ptr(),
            Backing::Reader(m) => m.as_ptr(),
        };
        Ok((unsafe { base.add(self.cursor) }, self.size - self.cursor))
    }

    pub fn advance(&mut self, n: usize) -> Result<usize> {
        if self.cursor + n > self.size {
            return Err(Error::Exhausted);
        }
        self.cursor += n;
        Ok(self.size - self.cursor)
    }

    fn remap_writer(&mut self, target_offset: u64, min_additional: usize) -> Result<()> {
        let aligned = align_window(target_offset, self.window_size, self.page_size);
        let required = (aligned.file_offset + aligned.size.max(min_additional)) as u64;
        ensure_file_len(&self.file, required)?;
        let mmap = unsafe {
            MmapOptions::new()
                .offset(aligned.file_offset as u64)
                .len(aligned.size)
                .map_mut(&self.file)
        }
        .map_err(Error::MmapFailed)?;
        self.backing = Backing::Writer(mmap);
        self.file_offset = aligned.file_offset;
        self.size = aligned.size;
        self.cursor = aligned.cursor;
        self.remaps += 1;
        Ok(())
    }

    fn remap_reader(&mut self, target_offset: u64, align_size_down: bool) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        if target_offset > file_len {
            return Err(Error::Exhausted);
        }
        let aligned = align_window(target_offset, self.window_size, self.page_size);
        let avail = file_len.saturating_sub(aligned.file_offset as u64) as usize;
        let mut mapped_size = aligned.size.min(avail);
        if align_size_down {
            mapped_size = (mapped_size / self.page_size) * self.page_size;
        }
        if mapped_size == 0 || aligned.cursor > mapped_size {
            return Err(Error::Exhausted);
        }
        let mmap = unsafe {
            MmapOptions::new()
                .offset(aligned.file_offset as u64)
                .len(mapped_size)
                .map(&self.file)
        }
        .map_err(Error::MmapFailed)?;
        self.backing = Backing::Reader(mmap);
        self.file_offset = aligned.file_offset;
        self.size = mapped_size;
        self.cursor = aligned.cursor;
        self.remaps += 1;
        Ok(())
    }

    /// Writer `write`: copies `data` into the window, remapping (and
    /// extending the file) whenever the window fills up, until all of
    /// `data` has been written. Returns the new `last_position`.
    pub fn write(&mut self, mut data: &[u8]) -> Result<u64> {
        if !self.is_writer() {
            return Err(Error::InvalidArgument("write on a reader window"));
        }
        loop {
            if data.is_empty() {
                return Ok(self.last_position());
            }
            if self.remaining() == 0 {
                let target = self.last_position();
                self.remap_writer(target, data.len())?;
                continue;
            }
            let n = self.remaining().min(data.len());
            match &mut self.backing {
                Backing::Writer(m) => {
                    m[self.cursor..self.cursor + n].copy_from_slice(&data[..n]);
                }
                Backing::Reader(_) => unreachable!("checked is_writer above"),
            }
            self.cursor += n;
            data = &data[n..];
        }
    }

    /// Reader `get`: remaps at `last_position` if fewer than `min_size`
    /// bytes remain in the window, then returns a pointer to the current
    /// cursor and how many bytes are available from it.
    pub fn get(&mut self, min_size: usize) -> Result<(*const u8, usize)> {
        if !matches!(self.backing, Backing::Reader(_)) {
            return Err(Error::InvalidArgument("get on a writer window"));
        }
        if self.remaining() < min_size {
            let target = self.last_position();
            self.remap_reader(target, false)?;
        }
        if self.remaining() == 0 {
            return Err(Error::Exhausted);
        }
        self.get_ptr()
    }

    /// Remaps so that `last_position() == pos`. The writer extends the file
    /// first if needed; the reader must not exceed file size.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        match &self.backing {
            Backing::Writer(_) => self.remap_writer(pos, 0),
            Backing::Reader(_) => self.remap_reader(pos, true),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match &self.backing {
            Backing::Writer(m) => m.flush().map_err(Error::MmapFailed),
            Backing::Reader(_) => Ok(()),
        }
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        if let Backing::Writer(m) = &self.backing {
            if let Err(err) = m.flush() {
                log::warn!("msync failed on drop: {err}");
            }
            if let Err(err) = self.file.sync_data() {
                log::warn!("sync_data failed on drop: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page() -> usize {
        4096
    }

    #[test]
    fn writer_write_and_reader_get_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.sq");
        let mut writer = MappedWindow::writer(&path, 64 * 1024, page()).unwrap();
        let pos = writer.write(b"hello world").unwrap();
        assert_eq!(pos, 11);
        writer.flush().unwrap();
        drop(writer);

        let mut reader = MappedWindow::reader(&path, 64 * 1024, page()).unwrap();
        let (ptr, avail) = reader.get(11).unwrap();
        assert!(avail >= 11);
        let got = unsafe { std::slice::from_raw_parts(ptr, 11) };
        assert_eq!(got, b"hello world");
    }

    #[test]
    fn reader_on_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.sq");
        let err = MappedWindow::reader(&path, 4096, page()).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn writer_remaps_across_small_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.sq");
        // A window far smaller than the payload forces several remaps.
        let mut writer = MappedWindow::writer(&path, page(), page()).unwrap();
        let payload = vec![0xABu8; page() * 3 + 17];
        let pos = writer.write(&payload).unwrap();
        assert_eq!(pos, payload.len() as u64);
        assert!(writer.remap_count() >= 3);
    }

    #[test]
    fn seek_repositions_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.sq");
        let mut writer = MappedWindow::writer(&path, page(), page()).unwrap();
        writer.seek(page() as u64 + 10).unwrap();
        assert_eq!(writer.last_position(), page() as u64 + 10);
        writer.write(b"x").unwrap();
    }
}
