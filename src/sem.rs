//! Named counting semaphores (§4.6, §6 "Named OS objects").
//!
//! Neither the standard library nor any crate already in this workspace's
//! dependency set exposes POSIX named semaphores, so this is a thin
//! `libc`-backed wrapper around `sem_open`/`sem_post`/`sem_timedwait` —
//! the one primitive collaborator §1 calls out of scope that still has to
//! be implemented rather than merely assumed.

#![cfg(unix)]

use std::ffi::CString;
use std::io;
use std::time::Duration;

/// A process-shared, named POSIX semaphore.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
    owner: bool,
}

// `sem_t` accessed through `sem_open` is safe to share across threads; the
// kernel serialises the underlying operations.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn leading_slash(name: &str) -> CString {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(full).expect("semaphore name must not contain NUL")
}

impl NamedSemaphore {
    /// Creates a new named semaphore (or attaches to an existing one of the
    /// same name) with initial value `value`, owning it for unlink-on-drop.
    pub fn create(name: &str, value: u32) -> io::Result<Self> {
        let cname = leading_slash(name);
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::mode_t,
                value as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(NamedSemaphore {
            sem: sem as *mut libc::sem_t,
            name: cname,
            owner: true,
        })
    }

    /// Attaches to an existing named semaphore without taking ownership of
    /// its lifetime (no unlink on drop).
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let cname = leading_slash(name);
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(NamedSemaphore {
            sem: sem as *mut libc::sem_t,
            name: cname,
            owner: false,
        })
    }

    pub fn post(&self) -> io::Result<()> {
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Non-blocking claim attempt. `Ok(true)` on success, `Ok(false)` if
    /// already at zero.
    pub fn try_wait(&self) -> io::Result<bool> {
        let rc = unsafe { libc::sem_trywait(self.sem) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    /// Blocks until `timeout` elapses or the semaphore can be claimed.
    /// `Ok(true)` means claimed, `Ok(false)` means the timeout expired —
    /// used for the 500 ms server-side `recv` wait and the SHM client's
    /// `stop` wait.
    pub fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        let mut sec = now.tv_sec as i64 + timeout.as_secs() as i64;
        if nsec >= 1_000_000_000 {
            nsec -= 1_000_000_000;
            sec += 1;
        }
        let deadline = libc::timespec {
            tv_sec: sec as libc::time_t,
            tv_nsec: nsec as libc::c_long,
        };
        loop {
            let rc = unsafe { libc::sem_timedwait(self.sem, &deadline) };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_trywait_claims_one_unit() {
        let name = format!("urpc-test-sem-{}", std::process::id());
        let sem = NamedSemaphore::create(&name, 0).unwrap();
        assert!(!sem.try_wait().unwrap());
        sem.post().unwrap();
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
    }

    #[test]
    fn timed_wait_times_out_when_never_posted() {
        let name = format!("urpc-test-sem-timeout-{}", std::process::id());
        let sem = NamedSemaphore::create(&name, 0).unwrap();
        let claimed = sem.timed_wait(Duration::from_millis(50)).unwrap();
        assert!(!claimed);
    }

    #[test]
    fn timed_wait_succeeds_when_posted() {
        let name = format!("urpc-test-sem-posted-{}", std::process::id());
        let sem = NamedSemaphore::create(&name, 1).unwrap();
        let claimed = sem.timed_wait(Duration::from_secs(1)).unwrap();
        assert!(claimed);
    }
}
