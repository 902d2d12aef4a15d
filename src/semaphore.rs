//! Mixed-radix 64-bit progress counter over a 5-semaphore SysV set.
//!
//! `v = s[0] + s[1]*B + s[2]*B^2 + s[3]*B^3 + s[4]*B^4`, `B = 16000`. Chosen
//! well below `SEMVMX` (32767 on most Unix, see `examples/original_source/
//! src/queue/sys_params.hh`) to leave overflow headroom for the carry
//! procedure in `send_signal`.
//!
//! The design goal is a *blocking* wait primitive a subscriber can park in
//! without polling: SysV `semop` blocks on a per-counter value, and no single
//! counter can hold a u64, so the value is spread across five and a client
//! blocks on whichever one it can show has advanced.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use libc::{c_int, c_short, c_ushort, key_t, sembuf};

use crate::{Error, Result};

pub const DIGIT_COUNT: usize = 5;
const RADIX: u64 = 16000;
const STEP_CAP: u64 = RADIX * 9 / 10;

fn digits_of(mut value: u64) -> [u16; DIGIT_COUNT] {
    let mut digits = [0u16; DIGIT_COUNT];
    for slot in digits.iter_mut() {
        *slot = (value % RADIX) as u16;
        value /= RADIX;
    }
    digits
}

fn value_of(digits: &[u16; DIGIT_COUNT]) -> u64 {
    let mut value = 0u64;
    for &digit in digits.iter().rev() {
        value = value * RADIX + digit as u64;
    }
    value
}

fn last_os_error() -> Error {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EIDRM) => Error::QueueGone,
        _ => Error::IoFailed(err),
    }
}

fn retry_eintr<F: FnMut() -> c_int>(mut call: F) -> Result<c_int> {
    loop {
        let res = call();
        if res >= 0 {
            return Ok(res);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(last_os_error());
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
union semun {
    val: c_int,
    buf: *mut libc::semid_ds,
    array: *mut c_ushort,
}

fn semget_create(key: key_t) -> Result<c_int> {
    match retry_eintr(|| unsafe {
        libc::semget(key, DIGIT_COUNT as c_int, libc::IPC_CREAT | libc::IPC_EXCL | 0o600)
    }) {
        Ok(id) => {
            setall(id, [0u16; DIGIT_COUNT])?;
            Ok(id)
        }
        Err(Error::IoFailed(err)) if err.raw_os_error() == Some(libc::EEXIST) => {
            semget_existing(key)
        }
        Err(err) => Err(err),
    }
}

fn semget_existing(key: key_t) -> Result<c_int> {
    retry_eintr(|| unsafe { libc::semget(key, DIGIT_COUNT as c_int, 0) })
        .map_err(|_| Error::NotFound)
}

fn getall(semid: c_int) -> Result<u64> {
    let mut raw = [0u16; DIGIT_COUNT];
    let arg = semun {
        array: raw.as_mut_ptr(),
    };
    retry_eintr(|| unsafe { libc::semctl(semid, 0, libc::GETALL, arg) })?;
    Ok(value_of(&raw))
}

fn setall(semid: c_int, digits: [u16; DIGIT_COUNT]) -> Result<()> {
    let mut raw = digits;
    let arg = semun {
        array: raw.as_mut_ptr(),
    };
    retry_eintr(|| unsafe { libc::semctl(semid, 0, libc::SETALL, arg) })?;
    Ok(())
}

fn sem_op(semid: c_int, ops: &mut [sembuf]) -> Result<bool> {
    let res = unsafe { libc::semop(semid, ops.as_mut_ptr(), ops.len()) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(false),
        Some(libc::EINTR) => Ok(false), // spurious: caller's loop re-evaluates state.
        Some(libc::EIDRM) => Err(Error::QueueGone),
        _ => Err(Error::IoFailed(err)),
    }
}

fn sembuf(sem_num: usize, sem_op: i32, nowait: bool) -> sembuf {
    libc::sembuf {
        sem_num: sem_num as c_ushort,
        sem_op: sem_op as c_short,
        sem_flg: if nowait { libc::IPC_NOWAIT as c_short } else { 0 },
    }
}

/// Attempts the overflow-carry two-op group `s[from] -= B; s[to] += 1`,
/// both `IPC_NOWAIT`. A no-op (returns `Ok(false)`) when `s[from] < B`.
fn try_carry(semid: c_int, from: usize, to: usize) -> Result<bool> {
    let mut ops = [
        self::sembuf(from, -(RADIX as i32), true),
        self::sembuf(to, 1, true),
    ];
    sem_op(semid, &mut ops)
}

/// Publishes `delta` onto `s[0]`, carrying overflow into higher digits.
/// Never goes backwards: every step either lands entirely or not at all.
fn send_signal(semid: c_int, mut delta: u64) -> Result<()> {
    while delta > 0 {
        let step = delta.min(STEP_CAP);

        // Attempt the atomic "increment s0, and if it overflowed, carry
        // into s1" group first; only fall back to a plain increment when
        // there's no overflow to carry (the compound group fails as a
        // whole, including the increment, if the NOWAIT op can't proceed).
        let mut compound = [
            self::sembuf(0, step as i32, false),
            self::sembuf(0, -(RADIX as i32), true),
            self::sembuf(1, 1, false),
        ];
        if !sem_op(semid, &mut compound)? {
            let mut plain = [self::sembuf(0, step as i32, false)];
            sem_op(semid, &mut plain)?;
        }

        for (from, to) in [(1, 2), (2, 3), (3, 4)] {
            try_carry(semid, from, to)?;
        }

        delta -= step;
    }
    Ok(())
}

/// Detects whether digit `i` has advanced past `threshold` via the
/// decrement-then-increment nowait trick: the nowait decrement only
/// succeeds (and is immediately undone by the unconditional increment) when
/// `s[i] > threshold`.
fn try_detect_advance(semid: c_int, i: usize, threshold: u16) -> Result<bool> {
    let step = threshold as i32 + 1;
    let mut ops = [self::sembuf(i, -step, true), self::sembuf(i, step, false)];
    sem_op(semid, &mut ops)
}

#[cfg(target_os = "linux")]
fn bounded_wait_on_index0(semid: c_int, timeout: Duration) -> Result<()> {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let mut ops = [self::sembuf(0, 0, false)];
    let res = unsafe { libc::semtimedop(semid, ops.as_mut_ptr(), 1, &ts) };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
        Some(libc::EIDRM) => Err(Error::QueueGone),
        _ => Err(Error::IoFailed(err)),
    }
}

#[cfg(not(target_os = "linux"))]
fn bounded_wait_on_index0(_semid: c_int, timeout: Duration) -> Result<()> {
    std::thread::sleep(timeout);
    Ok(())
}

fn ftok_key(lock_path: &Path) -> Result<key_t> {
    let c_path = std::ffi::CString::new(lock_path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::InvalidArgument("lock path contains NUL"))?;
    let key = unsafe { libc::ftok(c_path.as_ptr(), 1) };
    if key == -1 {
        return Err(Error::NotFound);
    }
    Ok(key)
}

fn open_lock_file_create(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .map_err(Into::into)
}

fn flock_exclusive(file: &File) -> Result<()> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Err(Error::AlreadyOpen);
    }
    Err(err.into())
}

/// Publisher-side handle: owns the exclusive lock on `sync.lck`, the
/// semaphore set, and the flusher thread that propagates `signal`'d values
/// into the kernel out of band.
pub struct OffsetSemaphore {
    semid: c_int,
    _lock_file: File,
    last_value: Arc<AtomicU64>,
    sent_value: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    flusher: Option<JoinHandle<()>>,
}

impl OffsetSemaphore {
    /// Acquires the exclusive `flock` on `lock_path` (creating it if
    /// absent), attaches or creates the semaphore set keyed off it, and
    /// spawns the flusher thread. Failure to acquire the lock is fatal:
    /// `AlreadyOpen`.
    pub fn open_server(lock_path: &Path, sync_throttle: Duration) -> Result<Self> {
        let lock_file = open_lock_file_create(lock_path)?;
        flock_exclusive(&lock_file)?;

        let key = ftok_key(lock_path)?;
        let semid = semget_create(key)?;

        let last_value = Arc::new(AtomicU64::new(0));
        let sent_value = Arc::new(AtomicU64::new(getall(semid)?));
        let stop = Arc::new(AtomicBool::new(false));

        let flusher = {
            let last_value = Arc::clone(&last_value);
            let sent_value = Arc::clone(&sent_value);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(sync_throttle);
                    let last = last_value.load(Ordering::Acquire);
                    let sent = sent_value.load(Ordering::Acquire);
                    if last > sent {
                        if let Err(err) = send_signal(semid, last - sent) {
                            log::warn!("offset semaphore flush failed: {err}");
                            continue;
                        }
                        match getall(semid) {
                            Ok(observed) => sent_value.store(observed, Ordering::Release),
                            Err(err) => log::warn!("offset semaphore re-read failed: {err}"),
                        }
                    }
                }
            })
        };

        Ok(Self {
            semid,
            _lock_file: lock_file,
            last_value,
            sent_value,
            stop,
            flusher: Some(flusher),
        })
    }

    /// Non-blocking, constant time: the flusher thread does the kernel work
    /// out of band. This is the main reason `push` stays cheap.
    pub fn signal(&self, v: u64) {
        self.last_value.store(v, Ordering::Release);
    }

    /// Synchronously stores `v`. Used at startup/resume, where the flusher's
    /// throttled catch-up would otherwise race a subscriber reading a stale
    /// value.
    pub fn set(&self, v: u64) -> Result<()> {
        setall(self.semid, digits_of(v))?;
        self.sent_value.store(v, Ordering::Release);
        self.last_value.store(v, Ordering::Release);
        Ok(())
    }

    pub fn get(&self) -> Result<u64> {
        getall(self.semid)
    }

    /// `IPC_RMID`s the semaphore set, releases the `flock`, and unlinks the
    /// lock file. Used for tests and explicit resets; never called on the
    /// steady path.
    pub fn cleanup_all(lock_path: &Path) -> Result<()> {
        if let Ok(key) = ftok_key(lock_path) {
            if let Ok(semid) = semget_existing(key) {
                let _ = retry_eintr(|| unsafe {
                    libc::semctl(semid, 0, libc::IPC_RMID, semun { val: 0 })
                });
            }
        }
        match std::fs::remove_file(lock_path) {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}

impl Drop for OffsetSemaphore {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.take() {
            if handle.join().is_err() {
                log::warn!("offset semaphore flusher thread panicked");
            }
        }
    }
}

/// Subscriber-side read-only handle.
pub struct SemaphoreClient {
    semid: c_int,
}

impl SemaphoreClient {
    /// Opens the semaphore set read-only via `ftok`. Fails with `NotFound`
    /// if the lock file (and thus the set) was never created by a
    /// publisher.
    pub fn open(lock_path: &Path) -> Result<Self> {
        let key = ftok_key(lock_path)?;
        let semid = semget_existing(key)?;
        Ok(Self { semid })
    }

    pub fn get(&self) -> Result<u64> {
        getall(self.semid)
    }

    /// Reacquire loop: returns as soon as the observed value exceeds
    /// `prev`, or `prev` unchanged once `timeout` elapses.
    pub fn wait_next(&self, prev: u64, timeout: Option<Duration>) -> Result<u64> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let current = self.get()?;
            if current > prev {
                return Ok(current);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(prev);
                }
            }

            let digits = digits_of(prev);
            let mut detected = false;
            for i in (0..DIGIT_COUNT).rev() {
                if try_detect_advance(self.semid, i, digits[i])? {
                    detected = true;
                    break;
                }
            }
            if detected {
                continue;
            }

            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(20));
            let bound = remaining.min(Duration::from_millis(20));
            bounded_wait_on_index0(self.semid, bound)?;
        }
    }
}

pub(crate) fn lock_path_for(root: &Path) -> PathBuf {
    root.join("sync.lck")
}
