use anyhow::{bail, Context, Result};
use kvm_bindings::{kvm_userspace_memory_region, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VmFd};
use log::info;
use serde::{Deserialize, Serialize};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use vcpu_sync::{
    run_data_size, NodeTranslator, PageTableNode, PhysicalRegions, PhysicalTranslator, Vcpu,
};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

mod vcpu;

use vcpu::VcpuManager;

/// Guest physical address of the boot code (a single `hlt`).
const GUEST_CODE: u64 = 0x1000;
/// Guest physical address of the page table root node.
const PT_ROOT: u64 = 0x2000;

/// VMM configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct VmmConfig {
    /// Guest physical memory size in bytes
    mem_size: usize,
    /// Number of vCPUs
    num_vcpus: u32,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            mem_size: 1 << 30, // 1 GiB
            num_vcpus: 1,
        }
    }
}

impl VmmConfig {
    /// Reads a JSON config; missing fields take their defaults.
    fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        if config.num_vcpus == 0 {
            bail!("num_vcpus must be at least 1");
        }
        if config.mem_size < 4 * vcpu_sync::PAGE_SIZE || config.mem_size % vcpu_sync::PAGE_SIZE != 0
        {
            bail!("mem_size {:#x} is not a usable page multiple", config.mem_size);
        }
        Ok(config)
    }
}

/// Main VMM structure managing the guest VM
struct Vmm {
    kvm: Kvm,
    vm: VmFd,
    guest_memory: GuestMemoryMmap<()>,
    physical: PhysicalRegions,
    config: VmmConfig,
}

impl Vmm {
    fn new(config: VmmConfig) -> Result<Self> {
        let kvm = Kvm::new().context("Failed to open /dev/kvm")?;
        let vm = kvm.create_vm().context("Failed to create VM")?;

        info!("Created KVM VM: fd={}", vm.as_raw_fd());
        info!(
            "Config: mem_size={}MB, vcpus={}",
            config.mem_size >> 20,
            config.num_vcpus
        );

        let guest_memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), config.mem_size)])
            .context("Failed to create guest memory")?;
        let physical = PhysicalRegions::from_guest_memory(&guest_memory)
            .context("Failed to build physical memory map")?;

        Ok(Self {
            kvm,
            vm,
            guest_memory,
            physical,
            config,
        })
    }

    /// Setup KVM memory slots
    fn setup_memory(&mut self) -> Result<()> {
        info!("Setting up KVM memory slots");

        for (slot, region) in self.guest_memory.iter().enumerate() {
            let mem_region = kvm_userspace_memory_region {
                slot: slot as u32,
                flags: 0,
                guest_phys_addr: region.start_addr().raw_value(),
                memory_size: region.len(),
                userspace_addr: region.as_ptr() as u64,
            };

            unsafe {
                self.vm
                    .set_user_memory_region(mem_region)
                    .context("Failed to set KVM memory region")?;
            }

            info!(
                "Mapped slot {}: GPA 0x{:x}, size 0x{:x}",
                slot, mem_region.guest_phys_addr, mem_region.memory_size
            );
        }

        Ok(())
    }

    /// Places the boot code and checks that a page table node in guest
    /// memory translates back to its guest physical address.
    fn setup_guest(&self) -> Result<()> {
        self.guest_memory
            .write_slice(&[0xf4], GuestAddress(GUEST_CODE))
            .context("Failed to write boot code")?;

        let host = self
            .guest_memory
            .get_host_address(GuestAddress(PT_ROOT))
            .context("Page table root outside guest memory")?;
        // SAFETY: PT_ROOT is page aligned and lies in mapped guest memory
        // that lives as long as `self`; no vCPU runs yet.
        let root = unsafe { &*(host as *const PageTableNode) };

        let translator = NodeTranslator::new(&self.physical);
        let physical = translator.translate_to_physical(root);
        if physical != GuestAddress(PT_ROOT) {
            bail!("Page table root at {:p} translated to {:#x}", host, physical.0);
        }
        info!("Page table root {:p} -> GPA {:#x}", host, physical.0);
        Ok(())
    }

    /// Create and configure vCPUs
    fn create_vcpus(&self) -> Result<Vec<VcpuManager>> {
        let size = run_data_size(&self.kvm).context("Failed to get run data size")?;
        let cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .context("Failed to get supported CPUID")?;

        let mut vcpus = Vec::new();
        for i in 0..self.config.num_vcpus {
            let fd = self
                .vm
                .create_vcpu(i as u64)
                .context(format!("Failed to create vCPU {}", i))?;
            fd.set_cpuid2(&cpuid).context("Failed to set CPUID")?;

            let vcpu = Vcpu::new(i, &fd, size).context(format!("Failed to map vCPU {}", i))?;
            let manager = VcpuManager::new(fd, Arc::new(vcpu));
            manager.setup_real_mode(GUEST_CODE)?;

            info!("Created vCPU {}", i);
            vcpus.push(manager);
        }

        Ok(vcpus)
    }

    fn run(&mut self) -> Result<()> {
        self.setup_memory()?;
        self.setup_guest()?;

        let managers = self.create_vcpus()?;
        let vcpus: Vec<Arc<Vcpu>> = managers.iter().map(|m| m.vcpu().clone()).collect();

        let handles: Vec<_> = managers
            .into_iter()
            .map(|mut manager| thread::spawn(move || manager.run()))
            .collect();

        // Supervisor side of the handoff: kick each vCPU out of KVM_RUN and
        // block until it is out of guest mode.
        for vcpu in &vcpus {
            vcpu.run_data().set_immediate_exit(true);
            vcpu.state().wait();
            info!("vCPU {} observed in host mode", vcpu.id());
        }

        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("vCPU thread panicked"),
            }
        }

        for vcpu in vcpus {
            let vcpu = Arc::try_unwrap(vcpu)
                .map_err(|_| anyhow::anyhow!("vCPU still referenced at teardown"))?;
            let id = vcpu.id();
            vcpu.destroy()
                .with_context(|| format!("Failed to destroy vCPU {}", id))?;
        }

        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => VmmConfig::load(Path::new(&path))?,
        None => VmmConfig::default(),
    };
    info!("VMM starting");

    let mut vmm = Vmm::new(config)?;
    vmm.run()?;

    info!("All vCPUs halted");
    Ok(())
}
