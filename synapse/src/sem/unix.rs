//! POSIX semaphore backend (`sem_init` / `sem_open` family).
//!
//! `rustix` has no semaphore coverage, so this module talks to `libc`
//! directly; errno values are still reported through `rustix::io::Errno` for
//! consistent formatting with the rest of the crate.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use super::{Result, SemError};
use crate::trace;

const POSIX_NAME_MAX: usize = 251; // NAME_MAX minus the "sem." prefix some libcs add

/// A validated POSIX named semaphore name.
///
/// Like shared memory object names: a leading `/`, no further slashes,
/// bounded length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemName(String);

impl SemName {
    /// Validates and wraps a named semaphore name.
    ///
    /// # Errors
    ///
    /// Returns [`SemError::InvalidName`] when the name doesn't meet the
    /// POSIX `sem_open` requirements.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if !name.starts_with('/') {
            return Err(SemError::InvalidName {
                name,
                reason: "name must start with '/'",
            });
        }

        if name[1..].contains('/') {
            return Err(SemError::InvalidName {
                name,
                reason: "name must not contain additional '/' characters",
            });
        }

        if name.len() > POSIX_NAME_MAX {
            return Err(SemError::InvalidName {
                name,
                reason: "name length must be <= 251 bytes",
            });
        }

        if name.as_bytes().contains(&0) {
            return Err(SemError::InvalidName {
                name,
                reason: "name must not contain NUL bytes",
            });
        }

        Ok(Self(name))
    }

    /// Returns the validated name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_cstring(&self) -> CString {
        // Validated NUL-free in new().
        CString::new(self.0.clone()).expect("SemName is NUL-free")
    }
}

impl fmt::Display for SemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Converts a relative timeout to the absolute CLOCK_REALTIME deadline
/// `sem_timedwait` expects.
fn absolute_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out-pointer for clock_gettime.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &raw mut now) } == -1 {
        return Err(SemError::sys("clock_gettime"));
    }

    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= NANOS_PER_SEC {
        sec += 1;
        nsec -= NANOS_PER_SEC;
    }

    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

/// Shared wait/post logic over a raw `sem_t` pointer.
///
/// # Safety
///
/// `sem` must point to a live, initialized POSIX semaphore.
unsafe fn sem_post(sem: *mut libc::sem_t, max_count: Option<u32>) -> Result<()> {
    if let Some(max) = max_count {
        let mut value: libc::c_int = 0;
        // SAFETY: sem is live per the caller contract; value is a valid
        // out-pointer.
        if unsafe { libc::sem_getvalue(sem, &raw mut value) } == -1 {
            return Err(SemError::sys("sem_getvalue"));
        }
        if value >= max as libc::c_int {
            return Err(SemError::MaxCount);
        }
    }

    // SAFETY: sem is live per the caller contract.
    if unsafe { libc::sem_post(sem) } == -1 {
        return Err(SemError::sys("sem_post"));
    }
    Ok(())
}

/// # Safety
///
/// As for [`sem_post`].
unsafe fn sem_try_wait(sem: *mut libc::sem_t) -> Result<()> {
    loop {
        // SAFETY: sem is live per the caller contract.
        if unsafe { libc::sem_trywait(sem) } == 0 {
            return Ok(());
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => return Err(SemError::WouldBlock),
            Some(libc::EINTR) => continue,
            _ => return Err(SemError::sys("sem_trywait")),
        }
    }
}

/// # Safety
///
/// As for [`sem_post`].
unsafe fn sem_wait(sem: *mut libc::sem_t, timeout: Option<Duration>) -> Result<()> {
    match timeout {
        None => loop {
            // SAFETY: sem is live per the caller contract.
            if unsafe { libc::sem_wait(sem) } == 0 {
                return Ok(());
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return Err(SemError::sys("sem_wait")),
            }
        },
        Some(duration) => {
            let deadline = absolute_deadline(duration)?;
            loop {
                // SAFETY: sem is live per the caller contract; deadline is a
                // valid timespec.
                if unsafe { libc::sem_timedwait(sem, &raw const deadline) } == 0 {
                    return Ok(());
                }
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::ETIMEDOUT) => return Err(SemError::Timeout),
                    Some(libc::EINTR) => continue,
                    _ => return Err(SemError::sys("sem_timedwait")),
                }
            }
        }
    }
}

/// Process-local counting semaphore.
///
/// An optional `max_count` reproduces the ceiling semantics of Windows-style
/// semaphores: a post that would exceed it fails with [`SemError::MaxCount`]
/// (checked best-effort via `sem_getvalue`).
pub struct Semaphore {
    // Boxed: sem_t must never move once initialized.
    sem: Box<UnsafeCell<libc::sem_t>>,
    max_count: Option<u32>,
}

// SAFETY: POSIX semaphore operations are thread-safe by specification.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Creates a semaphore with the given initial count and optional ceiling.
    ///
    /// # Errors
    ///
    /// [`SemError::Sys`] when `sem_init` rejects the count (`EINVAL` beyond
    /// `SEM_VALUE_MAX`).
    pub fn new(initial: u32, max_count: Option<u32>) -> Result<Self> {
        // SAFETY: sem_init fully initializes the zeroed sem_t storage.
        let sem = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        // SAFETY: fresh storage, pshared=0 (threads of this process only).
        if unsafe { libc::sem_init(sem.get(), 0, initial as libc::c_uint) } == -1 {
            return Err(SemError::sys("sem_init"));
        }
        Ok(Self { sem, max_count })
    }

    /// Increments the count, waking one waiter if any.
    ///
    /// # Errors
    ///
    /// [`SemError::MaxCount`] when a configured ceiling would be exceeded,
    /// [`SemError::Sys`] on syscall failure.
    pub fn post(&self) -> Result<()> {
        // SAFETY: self.sem is initialized for the lifetime of Self.
        unsafe { sem_post(self.sem.get(), self.max_count) }
    }

    /// Decrements the count without blocking.
    ///
    /// # Errors
    ///
    /// [`SemError::WouldBlock`] when the count is zero.
    pub fn try_wait(&self) -> Result<()> {
        // SAFETY: self.sem is initialized for the lifetime of Self.
        unsafe { sem_try_wait(self.sem.get()) }
    }

    /// Decrements the count, blocking until it is positive or the timeout
    /// expires. `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// [`SemError::Timeout`] when the timed wait expires.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        // SAFETY: self.sem is initialized for the lifetime of Self.
        unsafe { sem_wait(self.sem.get(), timeout) }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: initialized in new(), never used after drop.
        unsafe {
            let _ = libc::sem_destroy(self.sem.get());
        }
    }
}

/// Named, cross-process counting semaphore.
///
/// The creating endpoint unlinks the name on drop; openers leave it for the
/// creator to clean up, mirroring the shared memory Creator/Opener split.
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: SemName,
    unlink_on_drop: bool,
}

// SAFETY: POSIX semaphore operations are thread-safe by specification, and
// the handle targets a kernel object, not thread-local state.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates a new named semaphore with the given initial count.
    ///
    /// Unlinks the name on drop. Fails with `EEXIST` if the name is taken.
    ///
    /// # Errors
    ///
    /// [`SemError::Sys`] from `sem_open`.
    pub fn create(name: SemName, initial: u32) -> Result<Self> {
        let cname = name.to_cstring();
        // SAFETY: cname is a valid NUL-terminated string; O_CREAT|O_EXCL
        // passes mode and value per the sem_open contract.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::mode_t,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(SemError::sys("sem_open"));
        }
        let Some(sem) = NonNull::new(sem) else {
            return Err(SemError::sys("sem_open"));
        };
        trace::debug!(name = %name, "named semaphore created");
        Ok(Self {
            sem,
            name,
            unlink_on_drop: true,
        })
    }

    /// Opens an existing named semaphore.
    ///
    /// Does not unlink on drop.
    ///
    /// # Errors
    ///
    /// [`SemError::Sys`] (`ENOENT` when no such semaphore exists).
    pub fn open(name: SemName) -> Result<Self> {
        let cname = name.to_cstring();
        // SAFETY: cname is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(SemError::sys("sem_open"));
        }
        let Some(sem) = NonNull::new(sem) else {
            return Err(SemError::sys("sem_open"));
        };
        trace::debug!(name = %name, "named semaphore opened");
        Ok(Self {
            sem,
            name,
            unlink_on_drop: false,
        })
    }

    /// Returns the semaphore's name.
    #[must_use]
    pub fn name(&self) -> &SemName {
        &self.name
    }

    /// Increments the count, waking one waiter in any process.
    ///
    /// # Errors
    ///
    /// [`SemError::Sys`] on syscall failure.
    pub fn post(&self) -> Result<()> {
        // SAFETY: self.sem is a live sem_open handle.
        unsafe { sem_post(self.sem.as_ptr(), None) }
    }

    /// Decrements the count without blocking.
    ///
    /// # Errors
    ///
    /// [`SemError::WouldBlock`] when the count is zero.
    pub fn try_wait(&self) -> Result<()> {
        // SAFETY: self.sem is a live sem_open handle.
        unsafe { sem_try_wait(self.sem.as_ptr()) }
    }

    /// Decrements the count, blocking until it is positive or the timeout
    /// expires. `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// [`SemError::Timeout`] when the timed wait expires.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        // SAFETY: self.sem is a live sem_open handle.
        unsafe { sem_wait(self.sem.as_ptr(), timeout) }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: handle from sem_open, closed exactly once.
        unsafe {
            let _ = libc::sem_close(self.sem.as_ptr());
        }
        if self.unlink_on_drop {
            let cname = self.name.to_cstring();
            // SAFETY: valid NUL-terminated string.
            unsafe {
                let _ = libc::sem_unlink(cname.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_try_wait() {
        let sem = Semaphore::new(0, None).unwrap();
        assert!(matches!(sem.try_wait(), Err(SemError::WouldBlock)));

        sem.post().unwrap();
        sem.try_wait().unwrap();
        assert!(matches!(sem.try_wait(), Err(SemError::WouldBlock)));
    }

    #[test]
    fn initial_count_is_consumable() {
        let sem = Semaphore::new(3, None).unwrap();
        sem.try_wait().unwrap();
        sem.try_wait().unwrap();
        sem.try_wait().unwrap();
        assert!(matches!(sem.try_wait(), Err(SemError::WouldBlock)));
    }

    #[test]
    fn timed_wait_times_out() {
        let sem = Semaphore::new(0, None).unwrap();
        let start = std::time::Instant::now();
        let result = sem.wait(Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(SemError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn max_count_is_enforced() {
        let sem = Semaphore::new(0, Some(2)).unwrap();
        sem.post().unwrap();
        sem.post().unwrap();
        assert!(matches!(sem.post(), Err(SemError::MaxCount)));

        sem.try_wait().unwrap();
        sem.post().unwrap();
    }

    #[test]
    fn wakes_a_blocked_waiter() {
        let sem = std::sync::Arc::new(Semaphore::new(0, None).unwrap());

        let waiter = {
            let sem = std::sync::Arc::clone(&sem);
            std::thread::spawn(move || sem.wait(Some(Duration::from_secs(5))))
        };

        std::thread::sleep(Duration::from_millis(20));
        sem.post().unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn name_validation() {
        assert!(SemName::new("/valid").is_ok());
        assert!(matches!(
            SemName::new("missing-slash"),
            Err(SemError::InvalidName { reason, .. }) if reason == "name must start with '/'"
        ));
        assert!(matches!(
            SemName::new("/a/b"),
            Err(SemError::InvalidName { reason, .. })
                if reason == "name must not contain additional '/' characters"
        ));
        let too_long = format!("/{}", "a".repeat(251));
        assert!(SemName::new(too_long).is_err());
    }

    #[test]
    fn named_create_open_post_wait() {
        let name = SemName::new(format!("/synapse-sem-{}", std::process::id())).unwrap();
        let cname = CString::new(name.as_str()).unwrap();
        // SAFETY: clean up any leftover from a previous crashed run.
        unsafe {
            let _ = libc::sem_unlink(cname.as_ptr());
        }

        let creator = match NamedSemaphore::create(name.clone(), 0) {
            Ok(sem) => sem,
            Err(err @ SemError::Sys { .. }) => {
                eprintln!("skipping named_create_open_wait: {err}");
                return;
            }
            Err(err) => panic!("unexpected error: {err}"),
        };
        let opener = NamedSemaphore::open(name).unwrap();

        creator.post().unwrap();
        opener.try_wait().unwrap();
        assert!(matches!(opener.try_wait(), Err(SemError::WouldBlock)));

        opener.post().unwrap();
        creator.wait(Some(Duration::from_millis(100))).unwrap();
    }

    #[test]
    fn named_open_missing_fails() {
        let name = SemName::new("/synapse-sem-definitely-missing").unwrap();
        assert!(matches!(
            NamedSemaphore::open(name),
            Err(SemError::Sys { op: "sem_open", .. })
        ));
    }
}
