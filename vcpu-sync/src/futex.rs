//! Raw `futex(2)` calls on a 32-bit atomic word.
//!
//! These go straight to the syscall (no libc wrapper state, no allocation)
//! so that [`wake_all`] may run inside a signal handler.

use std::ptr;
use std::sync::atomic::AtomicU32;

/// Outcome of a `FUTEX_WAIT` that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken by `FUTEX_WAKE` (or spuriously).
    Woken,
    /// The word no longer held the expected value (`EAGAIN`).
    Changed,
    /// A signal arrived before the wake (`EINTR`).
    Interrupted,
}

/// Blocks while `word` holds `expected`.
///
/// Returns the raw errno for anything other than `EAGAIN` and `EINTR`.
pub(crate) fn wait(word: &AtomicU32, expected: u32) -> Result<WaitOutcome, i32> {
    // SAFETY: `word` is a live, aligned 32-bit atomic for the duration of
    // the call; a null timeout blocks indefinitely.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    };
    if ret == 0 {
        return Ok(WaitOutcome::Woken);
    }
    match errno() {
        libc::EAGAIN => Ok(WaitOutcome::Changed),
        libc::EINTR => Ok(WaitOutcome::Interrupted),
        err => Err(err),
    }
}

/// Wakes every thread blocked on `word`. Signal-safe.
#[inline]
pub(crate) fn wake_all(word: &AtomicU32) -> Result<usize, i32> {
    // SAFETY: as for `wait`; FUTEX_WAKE ignores the trailing arguments.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    };
    if ret < 0 {
        Err(errno())
    } else {
        Ok(ret as usize)
    }
}

#[inline]
fn errno() -> i32 {
    // SAFETY: errno is thread local and always readable.
    unsafe { *libc::__errno_location() }
}
