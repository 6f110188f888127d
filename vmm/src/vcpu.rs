/// vCPU run loop on top of the vcpu-sync handoff state
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kvm_bindings::KVM_EXIT_HLT;
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, info, warn};
use vcpu_sync::Vcpu;

/// Why a single `KVM_RUN` returned, detached from the borrowed run data.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Halt,
    Io { port: u16, write: bool },
    Interrupted,
    Other(String),
}

/// Drives one vCPU: owns its fd, shares its handoff state.
pub struct VcpuManager {
    fd: VcpuFd,
    vcpu: Arc<Vcpu>,
}

impl VcpuManager {
    pub fn new(fd: VcpuFd, vcpu: Arc<Vcpu>) -> Self {
        Self { fd, vcpu }
    }

    pub fn vcpu(&self) -> &Arc<Vcpu> {
        &self.vcpu
    }

    /// Flat real mode, starting at guest physical `entry`.
    pub fn setup_real_mode(&self, entry: u64) -> Result<()> {
        let mut sregs = self.fd.get_sregs().context("Failed to get sregs")?;
        sregs.cs.base = 0;
        sregs.cs.selector = 0;
        self.fd.set_sregs(&sregs).context("Failed to set sregs")?;

        let regs = kvm_bindings::kvm_regs {
            rip: entry,
            rflags: 0x2,
            ..Default::default()
        };
        self.fd.set_regs(&regs).context("Failed to set regs")?;
        Ok(())
    }

    fn run_once(&mut self) -> Result<Exit> {
        let state = self.vcpu.state();
        if !state.enter_guest() {
            bail!("vCPU {} not in host mode: {:?}", self.vcpu.id(), state.load());
        }
        let exit = match self.fd.run() {
            Ok(VcpuExit::Hlt) => Ok(Exit::Halt),
            Ok(VcpuExit::IoOut(port, _)) => Ok(Exit::Io { port, write: true }),
            Ok(VcpuExit::IoIn(port, _)) => Ok(Exit::Io { port, write: false }),
            Ok(other) => Ok(Exit::Other(format!("{:?}", other))),
            Err(e) if e.errno() == libc::EINTR => Ok(Exit::Interrupted),
            Err(e) => Err(e),
        };
        state.leave_guest();
        exit.with_context(|| format!("KVM_RUN failed on vCPU {}", self.vcpu.id()))
    }

    /// Runs the vCPU until the guest halts.
    pub fn run(&mut self) -> Result<()> {
        info!("vCPU {} run loop starting", self.vcpu.id());
        loop {
            let exit = self.run_once()?;
            // SAFETY: this thread just left KVM_RUN and is the only one
            // entering it for this vCPU.
            let reason = unsafe { self.vcpu.run_data().get() }.exit_reason;
            debug!("vCPU {} exit {:?} (reason {})", self.vcpu.id(), exit, reason);

            match exit {
                Exit::Halt => {
                    if reason != KVM_EXIT_HLT {
                        warn!("vCPU {} halted but run data reports {}", self.vcpu.id(), reason);
                    }
                    info!("vCPU {} halted", self.vcpu.id());
                    return Ok(());
                }
                Exit::Interrupted => {
                    // Kicked by the supervisor; acknowledge and resume.
                    info!("vCPU {} kicked", self.vcpu.id());
                    self.vcpu.run_data().set_immediate_exit(false);
                }
                Exit::Io { port, write } => {
                    let dir = if write { "out" } else { "in" };
                    debug!("vCPU {} port {:#x} {}", self.vcpu.id(), port, dir);
                }
                Exit::Other(desc) => bail!("vCPU {} unhandled exit: {}", self.vcpu.id(), desc),
            }
        }
    }
}
