//! Per-architecture vCPU setup.
//!
//! KVM identifies registers for `KVM_SET_ONE_REG` by an architecture-defined
//! 64-bit id: architecture tag | size | register group | index.

use crate::error::{Error, Result};
use crate::transcript::{record, OutputSink};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};

/// `KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | (offsetof(kvm_regs, regs.pc) / 4)`
pub const AARCH64_PC_REG_ID: u64 = 0x6030_0000_0010_0040;

/// `KVM_REG_RISCV | KVM_REG_SIZE_U64 | KVM_REG_RISCV_CORE | 0` (`regs.pc` is the first core register)
pub const RISCV64_PC_REG_ID: u64 = 0x8030_0000_0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    Aarch64,
    Riscv64,
    X86_64,
}

impl TargetArch {
    /// Architecture this binary was built for.
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "aarch64") {
            Some(TargetArch::Aarch64)
        } else if cfg!(target_arch = "riscv64") {
            Some(TargetArch::Riscv64)
        } else if cfg!(target_arch = "x86_64") {
            Some(TargetArch::X86_64)
        } else {
            None
        }
    }

    /// ONE_REG id of the program counter. x86_64 exposes `rip` only through
    /// the general register block.
    pub fn program_counter_reg(self) -> Option<u64> {
        match self {
            TargetArch::Aarch64 => Some(AARCH64_PC_REG_ID),
            TargetArch::Riscv64 => Some(RISCV64_PC_REG_ID),
            TargetArch::X86_64 => None,
        }
    }
}

/// Bring the vCPU into a runnable state.
///
/// aarch64 asks the VM for the preferred target and enables PSCI 0.2 when the
/// host offers it, so the guest can request an orderly shutdown.
#[cfg(target_arch = "aarch64")]
pub(crate) fn init_vcpu(
    _kvm: &Kvm,
    vm: &VmFd,
    vcpu: &VcpuFd,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    use kvm_bindings::{kvm_vcpu_init, KVM_ARM_VCPU_PSCI_0_2};
    use kvm_ioctls::Cap;

    record!(sink, Info, "Retrieving physical CPU information");
    let mut kvi = kvm_vcpu_init::default();
    vm.get_preferred_target(&mut kvi)
        .map_err(Error::syscall("KVM_ARM_PREFERRED_TARGET"))?;

    if vm.check_extension(Cap::ArmPsci02) {
        kvi.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;
        record!(sink, Info, "Enabled PSCI 0.2 for target {}", kvi.target);
    } else {
        record!(sink, Warn, "KVM_CAP_ARM_PSCI_0_2 not available, guest cannot power off");
    }

    record!(sink, Info, "Initializing VCPU");
    vcpu.vcpu_init(&kvi)
        .map_err(Error::syscall("KVM_ARM_VCPU_INIT"))?;
    Ok(())
}

#[cfg(target_arch = "riscv64")]
pub(crate) fn init_vcpu(
    _kvm: &Kvm,
    _vm: &VmFd,
    _vcpu: &VcpuFd,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    record!(sink, Debug, "No vCPU init step on riscv64");
    Ok(())
}

/// x86_64 has no init ioctl; the vCPU gets the host's supported CPUID table.
#[cfg(target_arch = "x86_64")]
pub(crate) fn init_vcpu(
    kvm: &Kvm,
    _vm: &VmFd,
    vcpu: &VcpuFd,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    use kvm_bindings::KVM_MAX_CPUID_ENTRIES;

    let cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(Error::syscall("KVM_GET_SUPPORTED_CPUID"))?;
    vcpu.set_cpuid2(&cpuid)
        .map_err(Error::syscall("KVM_SET_CPUID2"))?;
    record!(sink, Info, "Set {} CPUID entries", cpuid.as_slice().len());
    Ok(())
}

/// Point the vCPU at `entry`.
#[cfg(any(target_arch = "aarch64", target_arch = "riscv64"))]
pub(crate) fn set_program_counter(
    vm: &VmFd,
    vcpu: &VcpuFd,
    entry: u64,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    use kvm_ioctls::Cap;

    if !vm.check_extension(Cap::OneReg) {
        return Err(Error::CapabilityUnavailable("KVM_CAP_ONE_REG"));
    }

    let reg_id = TargetArch::host()
        .and_then(TargetArch::program_counter_reg)
        .ok_or(Error::CapabilityUnavailable("program counter register id"))?;
    vcpu.set_one_reg(reg_id, &entry.to_le_bytes())
        .map_err(Error::syscall("KVM_SET_ONE_REG"))?;
    record!(sink, Info, "Set PC (reg 0x{:x}) to 0x{:x}", reg_id, entry);
    Ok(())
}

/// Point the vCPU at `entry`: flat code segment, `rip = entry`.
#[cfg(target_arch = "x86_64")]
pub(crate) fn set_program_counter(
    _vm: &VmFd,
    vcpu: &VcpuFd,
    entry: u64,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    let mut sregs = vcpu.get_sregs().map_err(Error::syscall("KVM_GET_SREGS"))?;
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    vcpu.set_sregs(&sregs)
        .map_err(Error::syscall("KVM_SET_SREGS"))?;

    let mut regs = vcpu.get_regs().map_err(Error::syscall("KVM_GET_REGS"))?;
    regs.rip = entry;
    // Bit 1 of RFLAGS is reserved and must be set
    regs.rflags = 0x2;
    vcpu.set_regs(&regs).map_err(Error::syscall("KVM_SET_REGS"))?;
    record!(sink, Info, "Set RIP to 0x{:x}", entry);
    Ok(())
}
