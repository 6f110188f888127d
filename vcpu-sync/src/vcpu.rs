use std::os::fd::AsRawFd;

use log::info;

use crate::{AtomicVcpuState, Result, RunData};

/// Host-side handoff state of one vCPU.
///
/// Holds the state word shared with waiters and the vCPU's run data
/// mapping. The fd itself stays with the caller (the thread issuing
/// `KVM_RUN`).
#[derive(Debug)]
pub struct Vcpu {
    id: u32,
    state: AtomicVcpuState,
    run_data: RunData,
}

impl Vcpu {
    /// Maps the run data of `fd`; the vCPU starts in host mode.
    pub fn new(id: u32, fd: &impl AsRawFd, run_data_size: usize) -> Result<Self> {
        let run_data = RunData::map(fd, run_data_size)?;
        info!("vCPU {} run data at {:p}", id, run_data.as_ptr());
        Ok(Self {
            id,
            state: AtomicVcpuState::new(),
            run_data,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> &AtomicVcpuState {
        &self.state
    }

    pub fn run_data(&self) -> &RunData {
        &self.run_data
    }

    /// Releases the run data. Consumes the vCPU, so this happens once.
    pub fn destroy(self) -> Result<()> {
        info!("destroying vCPU {}", self.id);
        self.run_data.unmap()
    }
}
