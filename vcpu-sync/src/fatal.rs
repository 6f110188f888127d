//! Process termination for broken invariants.
//!
//! Once a futex call fails or a page table node cannot be translated, the
//! vCPU protocol or the guest memory view can no longer be trusted, so
//! there is no unwinding: the process aborts after printing a diagnostic.

use std::fmt;

/// Aborts with `msg` using only `write(2)` and `abort(3)`.
///
/// Safe to call from a signal handler: no allocation, no locks, no logger.
#[inline(never)]
pub fn throw(msg: &'static str) -> ! {
    const PREFIX: &[u8] = b"fatal error: ";
    // SAFETY: writes from valid static buffers to stderr; the results are
    // ignored because there is nothing left to do if stderr is gone.
    unsafe {
        libc::write(libc::STDERR_FILENO, PREFIX.as_ptr().cast(), PREFIX.len());
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::abort()
    }
}

/// Aborts after reporting `args`. Not for signal context.
#[cold]
pub fn die(args: fmt::Arguments<'_>) -> ! {
    if log::log_enabled!(log::Level::Error) {
        log::error!("fatal error: {}", args);
        log::logger().flush();
    } else {
        eprintln!("fatal error: {}", args);
    }
    std::process::abort()
}

/// Logs and aborts, `format!`-style.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::die(format_args!($($arg)*))
    };
}
