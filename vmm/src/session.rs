//! VM and vCPU lifecycle: everything between opening `/dev/kvm` and the first
//! `KVM_RUN`.

use crate::arch;
use crate::error::{Error, Result};
use crate::memory::MemoryLayout;
use crate::transcript::{record, OutputSink};
use kvm_bindings::{kvm_run, kvm_userspace_memory_region, KVM_API_VERSION, KVM_MEM_READONLY};
use kvm_ioctls::{Cap, Kvm, VcpuFd, VmFd};
use std::os::fd::AsRawFd;

/// The stable KVM API version.
pub const EXPECTED_API_VERSION: i32 = KVM_API_VERSION as i32;

/// Open handles of a configured VM with a single vCPU.
///
/// The shared `kvm_run` area is mapped by, and lives as long as, `vcpu`.
pub struct VmHandles {
    pub vcpu: VcpuFd,
    pub vm: VmFd,
    pub kvm: Kvm,
}

/// Create the VM, register guest memory and prepare the vCPU to start at
/// `entry_address`.
///
/// Every step is fatal on failure. Handles acquired before the failing step
/// are released, and recorded, on the way out.
pub fn create_and_configure(
    layout: &mut MemoryLayout,
    entry_address: u64,
    vcpu_id: u64,
    sink: &mut dyn OutputSink,
) -> Result<VmHandles> {
    let kvm = Kvm::new().map_err(Error::syscall("open /dev/kvm"))?;

    let version = kvm.get_api_version();
    if version != EXPECTED_API_VERSION {
        release(kvm, "/dev/kvm", sink);
        return Err(Error::IncompatibleApi {
            expected: EXPECTED_API_VERSION,
            found: version,
        });
    }
    record!(sink, Info, "KVM API version {}", version);

    record!(sink, Info, "Creating VM");
    let vm = match kvm.create_vm() {
        Ok(vm) => vm,
        Err(e) => {
            release(kvm, "/dev/kvm", sink);
            return Err(Error::syscall("KVM_CREATE_VM")(e));
        }
    };
    record!(sink, Info, "Created KVM VM: fd={}", vm.as_raw_fd());

    record!(sink, Info, "Setting up memory");
    if let Err(e) = register_regions(&vm, layout, sink) {
        release(vm, "VM", sink);
        release(kvm, "/dev/kvm", sink);
        return Err(e);
    }

    record!(sink, Info, "Creating VCPU");
    let vcpu = match vm.create_vcpu(vcpu_id) {
        Ok(vcpu) => vcpu,
        Err(e) => {
            release(vm, "VM", sink);
            release(kvm, "/dev/kvm", sink);
            return Err(Error::syscall("KVM_CREATE_VCPU")(e));
        }
    };

    let handles = VmHandles { vcpu, vm, kvm };
    if let Err(e) = handles.prepare_vcpu(entry_address, sink) {
        handles.close(sink);
        return Err(e);
    }
    Ok(handles)
}

/// Hand every region of `layout` that KVM does not know yet to the VM.
///
/// Slots are assigned in registration order starting at 0. Read-only regions
/// additionally need `KVM_CAP_READONLY_MEM`; with it, guest writes to them
/// exit as MMIO instead of landing in memory.
pub fn register_regions(
    vm: &VmFd,
    layout: &mut MemoryLayout,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    if !vm.check_extension(Cap::UserMemory) {
        return Err(Error::CapabilityUnavailable("KVM_CAP_USER_MEMORY"));
    }

    let mut next_slot = layout.next_free_slot();

    for region in layout.regions_mut().filter(|r| r.slot().is_none()) {
        let mut flags = 0;
        if region.flags().read_only {
            if !vm.check_extension(Cap::ReadonlyMem) {
                return Err(Error::CapabilityUnavailable("KVM_CAP_READONLY_MEM"));
            }
            flags |= KVM_MEM_READONLY;
        }

        let mem_region = kvm_userspace_memory_region {
            slot: next_slot,
            flags,
            guest_phys_addr: region.guest_phys_addr(),
            memory_size: region.size() as u64,
            userspace_addr: region.host_addr(),
        };

        // SAFETY: the host mapping is owned by the layout, which outlives the VM.
        unsafe {
            vm.set_user_memory_region(mem_region)
                .map_err(Error::syscall("KVM_SET_USER_MEMORY_REGION"))?;
        }
        region.set_slot(next_slot);

        record!(
            sink,
            Info,
            "Mapped slot {} '{}': GPA 0x{:x}, size 0x{:x}{}",
            next_slot,
            region.name(),
            mem_region.guest_phys_addr,
            mem_region.memory_size,
            if flags & KVM_MEM_READONLY != 0 { ", read-only" } else { "" }
        );
        next_slot += 1;
    }

    Ok(())
}

impl VmHandles {
    /// vCPU init, run area check and entry point.
    fn prepare_vcpu(&self, entry_address: u64, sink: &mut dyn OutputSink) -> Result<()> {
        arch::init_vcpu(&self.kvm, &self.vm, &self.vcpu, sink)?;

        let mmap_size = self
            .kvm
            .get_vcpu_mmap_size()
            .map_err(Error::syscall("KVM_GET_VCPU_MMAP_SIZE"))?;
        let required = std::mem::size_of::<kvm_run>();
        if mmap_size < required {
            return Err(Error::RunAreaTooSmall {
                found: mmap_size,
                required,
            });
        }
        record!(sink, Info, "Mapped vCPU run area of {} bytes", mmap_size);

        arch::set_program_counter(&self.vm, &self.vcpu, entry_address, sink)
    }

    /// Release vCPU, VM and device handles, in that order.
    ///
    /// Closing cannot fail from the caller's point of view; each release is
    /// recorded in the transcript.
    pub fn close(self, sink: &mut dyn OutputSink) {
        let VmHandles { vcpu, vm, kvm } = self;
        release(vcpu, "vCPU", sink);
        release(vm, "VM", sink);
        release(kvm, "/dev/kvm", sink);
    }
}

/// Close one handle and record it.
fn release<T: AsRawFd>(handle: T, what: &str, sink: &mut dyn OutputSink) {
    let fd = handle.as_raw_fd();
    drop(handle);
    record!(sink, Info, "Closed {} fd={}", what, fd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionFlags;
    use crate::transcript::Transcript;

    #[test]
    fn test_expected_api_version() {
        assert_eq!(EXPECTED_API_VERSION, 12);
    }

    #[test]
    fn test_release_is_recorded() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = file.as_raw_fd();
        let mut transcript = Transcript::new();

        release(file, "vCPU", &mut transcript);
        assert_eq!(transcript.lines(), &[format!("Closed vCPU fd={}", fd)]);
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn test_register_regions_assigns_slots() {
        let kvm = Kvm::new().unwrap();
        let vm = kvm.create_vm().unwrap();
        let mut layout = MemoryLayout::new();
        layout
            .register("rom", 0x0, 0x1000, RegionFlags::READ_WRITE)
            .unwrap();
        layout
            .register("ram", 0x0400_0000, 0x1000, RegionFlags::READ_WRITE)
            .unwrap();

        let mut transcript = Transcript::new();
        register_regions(&vm, &mut layout, &mut transcript).unwrap();
        let slots: Vec<_> = layout.regions().map(|r| r.slot()).collect();
        assert_eq!(slots, vec![Some(0), Some(1)]);

        // Regions added later continue the numbering.
        layout
            .register("mmio", 0x1000_0000, 0x1000, RegionFlags::READ_WRITE)
            .unwrap();
        register_regions(&vm, &mut layout, &mut transcript).unwrap();
        assert_eq!(layout.regions().last().unwrap().slot(), Some(2));

        // A fresh VM gets every region again, from slot 0.
        let vm = kvm.create_vm().unwrap();
        layout.forget_slots();
        register_regions(&vm, &mut layout, &mut transcript).unwrap();
        let slots: Vec<_> = layout.regions().map(|r| r.slot()).collect();
        assert_eq!(slots, vec![Some(0), Some(1), Some(2)]);
    }
}
