use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use crate::fatal;
use crate::futex::{self, WaitOutcome};

/// Who currently owns a vCPU.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    /// Running host code. Initial state.
    User = 0,
    /// Inside `KVM_RUN`, executing guest code.
    Guest = 1,
    /// Was in `Guest` and a host thread is (or is about to be) parked in
    /// [`AtomicVcpuState::wait`] until it leaves.
    Waiter = 2,
}

impl VcpuState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::User,
            1 => Self::Guest,
            2 => Self::Waiter,
            _ => fatal::throw("corrupt vCPU state word"),
        }
    }
}

/// The vCPU state, stored in a futex word.
///
/// Transitions:
/// - `User -> Guest`: [`enter_guest`](Self::enter_guest), run loop only.
/// - `Guest -> Waiter`: [`wait`](Self::wait), any host thread.
/// - `Guest | Waiter -> User`: [`leave_guest`](Self::leave_guest), run loop
///   only, which wakes waiters when it replaces `Waiter`.
///
/// Exactly one thread drives a given vCPU through `KVM_RUN`.
pub struct AtomicVcpuState {
    word: AtomicU32,
}

impl AtomicVcpuState {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(VcpuState::User as u32),
        }
    }

    pub fn load(&self) -> VcpuState {
        VcpuState::from_raw(self.word.load(Ordering::Acquire))
    }

    pub fn store(&self, state: VcpuState) {
        self.word.store(state as u32, Ordering::Release);
    }

    /// Moves from `from` to `to`, or returns the state actually observed.
    pub fn compare_exchange(&self, from: VcpuState, to: VcpuState) -> Result<(), VcpuState> {
        self.word
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(VcpuState::from_raw)
    }

    /// Claims the vCPU for guest execution. Returns false unless it was in
    /// `User`, in which case `KVM_RUN` must not be issued.
    pub fn enter_guest(&self) -> bool {
        self.compare_exchange(VcpuState::User, VcpuState::Guest).is_ok()
    }

    /// Returns the vCPU to host code after `KVM_RUN` exits.
    pub fn leave_guest(&self) {
        let prev = self.word.swap(VcpuState::User as u32, Ordering::AcqRel);
        if prev == VcpuState::Waiter as u32 {
            self.notify();
        }
    }

    /// Wakes every thread blocked in [`wait`](Self::wait), whatever the
    /// current state.
    ///
    /// Callable from a signal handler: it issues one raw syscall and never
    /// allocates. A failed wake aborts the process, since a waiter could
    /// otherwise sleep forever.
    #[inline]
    pub fn notify(&self) {
        if futex::wake_all(&self.word).is_err() {
            fatal::throw("futex wake error");
        }
    }

    /// Blocks until the vCPU is out of guest mode.
    ///
    /// Returns immediately, without touching the state, if the vCPU is not
    /// in `Guest`. Otherwise announces itself by moving to `Waiter` and
    /// sleeps on the word until [`notify`](Self::notify) or a state change.
    ///
    /// There is no timeout. Signal interruptions are retried without an
    /// upper bound.
    pub fn wait(&self) {
        if self
            .compare_exchange(VcpuState::Guest, VcpuState::Waiter)
            .is_err()
        {
            return; // Nothing to wait for.
        }
        debug!("waiting for vCPU to leave guest mode");
        loop {
            match futex::wait(&self.word, VcpuState::Waiter as u32) {
                Ok(WaitOutcome::Interrupted) => continue,
                Ok(WaitOutcome::Changed) | Ok(WaitOutcome::Woken) => break,
                Err(errno) => crate::fatal!("futex wait error: errno {}", errno),
            }
        }
    }
}

impl Default for AtomicVcpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicVcpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicVcpuState").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = AtomicVcpuState::new();
        assert_eq!(state.load(), VcpuState::User);
    }

    #[test]
    fn test_wait_fast_path() {
        let state = AtomicVcpuState::new();
        state.wait();
        assert_eq!(state.load(), VcpuState::User);
    }

    #[test]
    fn test_enter_and_leave_guest() {
        let state = AtomicVcpuState::new();
        assert!(state.enter_guest());
        assert_eq!(state.load(), VcpuState::Guest);
        assert!(!state.enter_guest());

        state.leave_guest();
        assert_eq!(state.load(), VcpuState::User);
    }

    #[test]
    fn test_enter_guest_refused_while_waiter() {
        let state = AtomicVcpuState::new();
        state.store(VcpuState::Waiter);
        assert!(!state.enter_guest());
        assert_eq!(state.load(), VcpuState::Waiter);
    }

    #[test]
    fn test_compare_exchange_reports_observed() {
        let state = AtomicVcpuState::new();
        assert_eq!(
            state.compare_exchange(VcpuState::Guest, VcpuState::Waiter),
            Err(VcpuState::User)
        );
        assert_eq!(state.compare_exchange(VcpuState::User, VcpuState::Guest), Ok(()));
        assert_eq!(state.load(), VcpuState::Guest);
    }

    #[test]
    fn test_leave_guest_releases_waiter_state() {
        let state = AtomicVcpuState::new();
        state.store(VcpuState::Waiter);
        state.leave_guest();
        assert_eq!(state.load(), VcpuState::User);
    }

    #[test]
    fn test_notify_with_no_waiters() {
        let state = AtomicVcpuState::new();
        state.notify();
        state.store(VcpuState::Guest);
        state.notify();
        assert_eq!(state.load(), VcpuState::Guest);
    }

    #[test]
    fn test_debug_shows_state() {
        let state = AtomicVcpuState::new();
        assert_eq!(format!("{:?}", state), "AtomicVcpuState(User)");
    }
}
