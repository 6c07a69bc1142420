//! Unix (macOS/Linux) shared memory and wake-up primitives.
//!
//! # Shared Memory Lifecycle
//!
//! 1. The owning process creates the object with `shm_open(O_CREAT | O_EXCL)`,
//!    sizes it with `ftruncate` and maps it `PROT_READ | PROT_WRITE`
//! 2. The owner initializes the header
//! 3. Other processes `shm_open(O_RDWR)`, size the mapping with `fstat` and
//!    validate the header themselves
//! 4. The owner unlinks the object when it is dropped
//!
//! # Latches
//!
//! - **Linux**: `futex` wait/wake on a 32-bit word inside the mapping
//!   (non-private, so it works across processes)
//! - **macOS**: short sleeps while polling the word

use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use libc::{
    c_int, c_uint, c_void, close, fstat, ftruncate, mmap, munmap, off_t, shm_open, shm_unlink,
    MAP_FAILED, MAP_SHARED, O_CREAT, O_EXCL, O_RDWR, PROT_READ, PROT_WRITE, S_IRUSR, S_IWUSR,
};
use tracing::{debug, error};

use crate::error::{StreamError, StreamResult};

/// macOS limits shm names to 31 chars including the leading '/'.
const MAX_SHM_NAME: usize = 31;

/// Build a POSIX shm name from a prefix and an id, truncated to the portable
/// length limit.
pub fn shm_name(prefix: &str, id: &str) -> String {
    let mut name = format!("/{}_{}", prefix, id);
    name.truncate(MAX_SHM_NAME);
    name
}

/// One mapping of a POSIX shared memory object.
///
/// The creating side owns the object and unlinks it on drop; openers only
/// unmap.
pub struct SharedRegion {
    ptr: *mut u8,
    fd: c_int,
    size: usize,
    name: String,
    owner: bool,
}

// SAFETY: The region is plain shared memory. All cross-thread coordination on
// its contents goes through atomics stored inside it.
unsafe impl Send for SharedRegion {}
// SAFETY: See above; `SharedRegion` itself has no interior mutability.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create, size and map a new zero-filled object. Fails if it exists.
    pub fn create(name: &str, size: usize) -> StreamResult<Self> {
        let c_name = CString::new(name).map_err(|e| StreamError::SharedMemory(e.to_string()))?;

        unsafe {
            let fd = shm_open(
                c_name.as_ptr(),
                O_CREAT | O_EXCL | O_RDWR,
                (S_IRUSR | S_IWUSR) as c_uint,
            );
            if fd == -1 {
                let err = std::io::Error::last_os_error();
                return Err(StreamError::SharedMemory(format!(
                    "shm_open failed for '{}': {}",
                    name, err
                )));
            }

            if ftruncate(fd, size as off_t) == -1 {
                let err = std::io::Error::last_os_error();
                close(fd);
                shm_unlink(c_name.as_ptr());
                return Err(StreamError::SharedMemory(format!("ftruncate failed: {}", err)));
            }

            let ptr = match map(fd, size) {
                Ok(ptr) => ptr,
                Err(e) => {
                    close(fd);
                    shm_unlink(c_name.as_ptr());
                    return Err(e);
                }
            };

            ptr::write_bytes(ptr, 0, size);

            debug!(name = %name, size = size, "created shared region");

            Ok(Self {
                ptr,
                fd,
                size,
                name: name.to_string(),
                owner: true,
            })
        }
    }

    /// Open and map an existing object at its full size.
    pub fn open(name: &str) -> StreamResult<Self> {
        let c_name = CString::new(name).map_err(|e| StreamError::SharedMemory(e.to_string()))?;

        unsafe {
            let fd = shm_open(c_name.as_ptr(), O_RDWR, 0);
            if fd == -1 {
                let err = std::io::Error::last_os_error();
                return Err(StreamError::SharedMemory(format!(
                    "shm_open failed for '{}': {}",
                    name, err
                )));
            }

            let mut stat: libc::stat = std::mem::zeroed();
            if fstat(fd, &mut stat) == -1 {
                let err = std::io::Error::last_os_error();
                close(fd);
                return Err(StreamError::SharedMemory(format!("fstat failed: {}", err)));
            }
            let size = stat.st_size as usize;
            if size == 0 {
                close(fd);
                return Err(StreamError::InvalidHeader(format!(
                    "shared region '{}' is empty",
                    name
                )));
            }

            let ptr = match map(fd, size) {
                Ok(ptr) => ptr,
                Err(e) => {
                    close(fd);
                    return Err(e);
                }
            };

            Ok(Self {
                ptr,
                fd,
                size,
                name: name.to_string(),
                owner: false,
            })
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr as *mut c_void, self.size);
            close(self.fd);
        }
        if self.owner {
            if let Err(e) = unlink(&self.name) {
                error!(name = %self.name, error = %e, "failed to unlink shared region");
            }
        }
    }
}

unsafe fn map(fd: c_int, size: usize) -> StreamResult<*mut u8> {
    let ptr = mmap(
        ptr::null_mut(),
        size,
        PROT_READ | PROT_WRITE,
        MAP_SHARED,
        fd,
        0,
    );
    if ptr == MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return Err(StreamError::Mmap(format!("mmap failed: {}", err)));
    }
    Ok(ptr as *mut u8)
}

/// Remove a shared memory object by name. Missing objects are fine.
pub fn unlink(name: &str) -> StreamResult<()> {
    let c_name = CString::new(name).map_err(|e| StreamError::SharedMemory(e.to_string()))?;

    unsafe {
        if shm_unlink(c_name.as_ptr()) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(StreamError::SharedMemory(format!(
                    "shm_unlink failed: {}",
                    err
                )));
            }
        }
    }
    Ok(())
}

/// Block while `word == expected`, up to `timeout`. Spurious returns are
/// allowed; callers re-check their condition.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let timeout = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });

    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const c_int,
            libc::FUTEX_WAIT,
            expected as c_int,
            timeout.as_ref().map_or(ptr::null(), |t| t as *const _),
            ptr::null::<c_int>(),
            0,
        );
    }
}

/// Wake every waiter blocked on `word`.
#[cfg(target_os = "linux")]
pub fn futex_wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const c_int,
            libc::FUTEX_WAKE,
            c_int::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<c_int>(),
            0,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let slice = timeout
        .unwrap_or(Duration::from_millis(10))
        .min(Duration::from_millis(10));
    if word.load(Ordering::Acquire) == expected {
        std::thread::sleep(slice);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_word: &AtomicU32) {}

/// Set a latch word and wake its waiters.
pub fn latch_set(word: &AtomicU32) {
    word.store(1, Ordering::Release);
    futex_wake_all(word);
}

/// Clear a latch word.
pub fn latch_reset(word: &AtomicU32) {
    word.store(0, Ordering::Release);
}

/// Wait until the latch is set or `timeout` elapses. Returns whether it is
/// set.
pub fn latch_wait(word: &AtomicU32, timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    loop {
        if word.load(Ordering::Acquire) != 0 {
            return true;
        }
        let remaining = match deadline {
            Some(deadline) => {
                let now = std::time::Instant::now();
                if now >= deadline {
                    return false;
                }
                Some(deadline - now)
            }
            None => None,
        };
        futex_wait(word, 0, remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn unique_name() -> String {
        shm_name("sbt", &uuid::Uuid::new_v4().simple().to_string())
    }

    #[test]
    fn test_shm_name_truncated() {
        let name = shm_name("psb", "0123456789abcdef0123456789abcdef");
        assert!(name.starts_with("/psb_0123"));
        assert_eq!(name.len(), MAX_SHM_NAME);
        assert_eq!(shm_name("psb", "7"), "/psb_7");
    }

    #[test]
    fn test_create_open_share_bytes() {
        let name = unique_name();
        let owner = SharedRegion::create(&name, 4096).unwrap();
        let opened = SharedRegion::open(&name).unwrap();

        assert!(owner.is_owner());
        assert!(!opened.is_owner());
        assert_eq!(opened.size(), 4096);

        unsafe {
            *owner.as_ptr().add(100) = 42;
            assert_eq!(*opened.as_ptr().add(100), 42);
        }
    }

    #[test]
    fn test_create_twice_fails() {
        let name = unique_name();
        let _owner = SharedRegion::create(&name, 1024).unwrap();
        assert!(matches!(
            SharedRegion::create(&name, 1024),
            Err(StreamError::SharedMemory(_))
        ));
    }

    #[test]
    fn test_owner_drop_unlinks() {
        let name = unique_name();
        drop(SharedRegion::create(&name, 1024).unwrap());
        assert!(SharedRegion::open(&name).is_err());
    }

    #[test]
    fn test_latch_wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        assert!(!latch_wait(&word, Some(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_latch_set_wakes_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = word.clone();
            std::thread::spawn(move || latch_wait(&word, Some(Duration::from_secs(5))))
        };

        std::thread::sleep(Duration::from_millis(20));
        latch_set(&word);
        assert!(waiter.join().unwrap());

        latch_reset(&word);
        assert_eq!(word.load(Ordering::Acquire), 0);
    }
}
