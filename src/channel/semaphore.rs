//! Counting semaphores living inside the channel mapping.
//!
//! Each semaphore is one `AtomicU32` in the shared header. Posting and polling
//! are plain atomic operations; blocking waits park on a process-shared futex
//! so readers in other processes are woken by the producer's post.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Pending posts a semaphore holds before further posts are dropped
pub const SEM_VALUE_MAX: u32 = 10;

/// Add one pending post, saturating at [`SEM_VALUE_MAX`]; waiters are woken either way
pub fn post(sem: &AtomicU32) {
    let _ = sem.fetch_update(Ordering::Release, Ordering::Relaxed, |v| {
        (v < SEM_VALUE_MAX).then_some(v + 1)
    });
    futex_wake(sem);
}

/// Decrement if positive; never blocks
pub fn try_wait(sem: &AtomicU32) -> bool {
    sem.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        .is_ok()
}

/// Drop every pending post, returning how many were discarded
pub fn flush(sem: &AtomicU32) -> u32 {
    sem.swap(0, Ordering::AcqRel)
}

/// Block until a post is available or `timeout` elapses
pub fn wait_timeout(sem: &AtomicU32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if try_wait(sem) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        futex_wait(sem, 0, deadline - now);
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(sem: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: `sem` is a valid, aligned u32 inside a live shared mapping and
    // `ts` outlives the call. Spurious returns are handled by the caller loop.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            sem.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(sem: &AtomicU32) {
    // SAFETY: `sem` is a valid, aligned u32 inside a live shared mapping.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            sem.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(sem: &AtomicU32, expected: u32, timeout: Duration) {
    if sem.load(Ordering::Acquire) == expected {
        std::thread::sleep(timeout.min(Duration::from_micros(100)));
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_sem: &AtomicU32) {}
