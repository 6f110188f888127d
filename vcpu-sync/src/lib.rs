//! vCPU handoff and guest memory bridging for the KVM sandbox
//!
//! The host control thread and the thread running a vCPU agree on who owns
//! the vCPU through a single futex word (see [`AtomicVcpuState`]). Waiting
//! for a vCPU to leave guest mode costs one compare-and-swap when it is
//! already out, and one `futex(2)` call otherwise.
//!
//! The crate also owns the per-vCPU `kvm_run` mapping ([`RunData`]) and the
//! host-virtual to guest-physical lookup ([`PhysicalMap`]) used when page
//! table nodes are handed to the hypervisor.
//!
//! Linux only: relies on `futex(2)` and the KVM vCPU mmap interface.

pub mod error;
pub mod fatal;
mod futex;
pub mod physical;
pub mod run_data;
pub mod state;
pub mod translate;
pub mod vcpu;

pub use error::{Error, Result};
pub use physical::{PhysicalMap, PhysicalRegion, PhysicalRegions, Resolved};
pub use run_data::{run_data_size, RunData};
pub use state::{AtomicVcpuState, VcpuState};
pub use translate::{NodeTranslator, PageTableNode, PhysicalTranslator};
pub use vcpu::Vcpu;

/// Host and guest page size.
pub const PAGE_SIZE: usize = 4096;
