//! Configuration bundle recognized by `Publisher`/`Subscriber` constructors.

const DEFAULT_SYNC_THROTTLE_MS: u64 = 1;
const DEFAULT_WINDOW_SIZE: usize = 80 * 1024 * 1024;
const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

fn host_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Recognized keys: `sync_throttle_ms`, `window_size`, `max_file_size`,
/// `page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Flusher thread wake interval, in milliseconds.
    pub sync_throttle_ms: u64,
    /// `MappedWindow` default size, in bytes.
    pub window_size: usize,
    /// Segment roll threshold, in bytes. Must exceed `window_size`.
    pub max_file_size: u64,
    /// Alignment unit for mmap. Defaults to the host page size.
    pub page_size: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            sync_throttle_ms: DEFAULT_SYNC_THROTTLE_MS,
            window_size: DEFAULT_WINDOW_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            page_size: host_page_size(),
        }
    }
}

impl Params {
    /// `max_file_size` must exceed `window_size` per the segment roll rule
    /// in spec.md §4.6.
    pub fn is_valid(&self) -> bool {
        self.max_file_size as usize > self.window_size
    }
}
