//! Error types for bare-vmm.

use elf_image::ImageError;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the guest memory layout.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Invalid region at GPA 0x{guest_phys_addr:x} with size 0x{size:x}")]
    InvalidRegion { guest_phys_addr: u64, size: usize },

    #[error(
        "Region 0x{new_base:x}..0x{new_end:x} overlaps existing region 0x{existing_base:x}..0x{existing_end:x}"
    )]
    RegionOverlap {
        new_base: u64,
        new_end: u64,
        existing_base: u64,
        existing_end: u64,
    },

    #[error("No region maps guest address 0x{0:x}")]
    NoMapping(u64),

    #[error(
        "0x{size:x} bytes at GPA 0x{addr:x} exceed region 0x{region_base:x} (size 0x{region_size:x})"
    )]
    OutOfBounds {
        addr: u64,
        size: usize,
        region_base: u64,
        region_size: usize,
    },

    #[error("Failed to allocate host memory: {0}")]
    Mmap(#[source] vm_memory::mmap::MmapRegionError),

    #[error("Failed to create guest region: {0}")]
    GuestRegion(#[source] vm_memory::mmap::Error),

    #[error("Guest memory access failed: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Segment {index} (vaddr 0x{vaddr:x}, 0x{size:x} bytes) could not be loaded: {source}")]
    Segment {
        index: u16,
        vaddr: u64,
        size: usize,
        #[source]
        source: MemoryError,
    },

    #[error("Expected KVM API version {expected}, got {found}")]
    IncompatibleApi { expected: i32, found: i32 },

    #[error("KVM extension '{0}' not available")]
    CapabilityUnavailable(&'static str),

    #[error("System call '{op}' failed: {source}")]
    SyscallFailed {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("vCPU run area is {found} bytes, expected at least {required}")]
    RunAreaTooSmall { found: usize, required: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn syscall(op: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> Self {
        move |source| Error::SyscallFailed { op, source }
    }

    /// Platform errno of a failed system call.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::SyscallFailed { source, .. } => Some(source.errno()),
            _ => None,
        }
    }

    /// Program header index of the segment that failed to load.
    pub fn segment_index(&self) -> Option<u16> {
        match self {
            Error::Segment { index, .. } => Some(*index),
            Error::Image(e) => e.segment_index(),
            _ => None,
        }
    }
}

/// A bootstrap that failed, with everything reported up to that point.
#[derive(Debug)]
pub struct BootFailure {
    pub error: Error,
    pub transcript: Vec<String>,
}

impl fmt::Display for BootFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (after {} transcript lines)",
            self.error,
            self.transcript.len()
        )
    }
}

impl std::error::Error for BootFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_only_for_syscalls() {
        let err = Error::syscall("KVM_RUN")(kvm_ioctls::Error::new(libc::EINTR));
        assert_eq!(err.errno(), Some(libc::EINTR));
        assert!(err.to_string().contains("KVM_RUN"));

        let err = Error::CapabilityUnavailable("KVM_CAP_USER_MEMORY");
        assert_eq!(err.errno(), None);
    }

    #[test]
    fn test_segment_error_names_segment_and_region() {
        let err = Error::Segment {
            index: 3,
            vaddr: 0x400_0000,
            size: 0x2000,
            source: MemoryError::OutOfBounds {
                addr: 0x400_0000,
                size: 0x2000,
                region_base: 0x400_0000,
                region_size: 0x1000,
            },
        };
        assert_eq!(err.segment_index(), Some(3));
        let msg = err.to_string();
        assert!(msg.contains("Segment 3"));
        assert!(msg.contains("region 0x4000000"));
    }
}
