use std::io;

use thiserror::Error;

/// Recoverable failures while setting up or tearing down a vCPU.
///
/// Protocol violations (a failing futex call, an untranslatable page table
/// node) are not represented here: they terminate the process via
/// [`crate::fatal`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("error mapping run data")]
    MapRunData(#[source] io::Error),

    #[error("error unmapping run data")]
    UnmapRunData(#[source] io::Error),

    #[error("invalid run data size {0:#x}")]
    InvalidRunDataSize(usize),

    #[error("failed to query vCPU mmap size")]
    GetVcpuMmapSize(#[source] kvm_ioctls::Error),

    #[error("empty physical region at {virt:#x}")]
    EmptyRegion { virt: usize },

    #[error("physical region at {virt:#x} overflows the address space")]
    RegionOverflow { virt: usize },

    #[error("physical regions at {first:#x} and {second:#x} overlap")]
    OverlappingRegions { first: usize, second: usize },

    #[error("guest memory region at {0:#x} has no host mapping")]
    RegionsFromGuestMemory(u64),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
