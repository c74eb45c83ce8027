//! vCPU run loop and exit classification

use crate::config::SentinelPolicy;
use crate::error::{Error, Result};
use crate::transcript::{record, OutputSink};
use kvm_bindings::{
    KVM_EXIT_SHUTDOWN, KVM_EXIT_UNKNOWN, KVM_SYSTEM_EVENT_CRASH, KVM_SYSTEM_EVENT_RESET,
    KVM_SYSTEM_EVENT_SHUTDOWN,
};
use kvm_ioctls::{VcpuExit, VcpuFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventCause {
    Shutdown,
    Reset,
    Crash,
    Unknown(u32),
}

impl SystemEventCause {
    pub fn from_raw(kind: u32) -> Self {
        match kind {
            KVM_SYSTEM_EVENT_SHUTDOWN => SystemEventCause::Shutdown,
            KVM_SYSTEM_EVENT_RESET => SystemEventCause::Reset,
            KVM_SYSTEM_EVENT_CRASH => SystemEventCause::Crash,
            other => SystemEventCause::Unknown(other),
        }
    }
}

/// Why a vCPU run call returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEvent {
    Halt,
    IoPort {
        port: u16,
        is_write: bool,
    },
    Mmio {
        is_write: bool,
        len: usize,
        phys_addr: u64,
        data: [u8; 8],
    },
    SystemEvent {
        cause: SystemEventCause,
    },
    Interrupted,
    FailEntry {
        hardware_reason: u64,
    },
    InternalError,
    Other(u32),
}

impl ExitEvent {
    pub fn mmio_write(phys_addr: u64, bytes: &[u8]) -> Self {
        let len = bytes.len().min(8);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&bytes[..len]);
        ExitEvent::Mmio {
            is_write: true,
            len,
            phys_addr,
            data,
        }
    }

    /// Value of an MMIO access: the first `len` data bytes, little-endian.
    pub fn mmio_value(data: &[u8; 8], len: usize) -> u64 {
        data[..len.min(8)]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc | u64::from(b) << (8 * i))
    }
}

/// Something that can run a vCPU until its next exit.
pub trait VcpuRunner {
    fn run_once(&mut self) -> std::result::Result<ExitEvent, kvm_ioctls::Error>;
}

impl VcpuRunner for VcpuFd {
    fn run_once(&mut self) -> std::result::Result<ExitEvent, kvm_ioctls::Error> {
        let event = match self.run()? {
            VcpuExit::Hlt => ExitEvent::Halt,
            VcpuExit::IoIn(port, data) => {
                data.fill(0xff);
                ExitEvent::IoPort {
                    port,
                    is_write: false,
                }
            }
            VcpuExit::IoOut(port, _) => ExitEvent::IoPort {
                port,
                is_write: true,
            },
            VcpuExit::MmioRead(addr, data) => {
                // Nothing backs the device window, reads see zeros.
                data.fill(0);
                ExitEvent::Mmio {
                    is_write: false,
                    len: data.len(),
                    phys_addr: addr,
                    data: [0; 8],
                }
            }
            VcpuExit::MmioWrite(addr, data) => ExitEvent::mmio_write(addr, data),
            VcpuExit::SystemEvent(kind, _) => ExitEvent::SystemEvent {
                cause: SystemEventCause::from_raw(kind),
            },
            VcpuExit::Intr => ExitEvent::Interrupted,
            VcpuExit::FailEntry(hardware_reason, _) => ExitEvent::FailEntry { hardware_reason },
            VcpuExit::InternalError => ExitEvent::InternalError,
            VcpuExit::Shutdown => ExitEvent::Other(KVM_EXIT_SHUTDOWN),
            VcpuExit::Unsupported(code) => ExitEvent::Other(code),
            other => {
                log::debug!("Unmapped exit {:?}", other);
                ExitEvent::Other(KVM_EXIT_UNKNOWN)
            }
        };
        Ok(event)
    }
}

/// MMIO writes collected from the guest, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    values: Vec<u64>,
}

impl CapturedOutput {
    pub fn push(&mut self, value: u64) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// One byte per write: the low byte of each value.
    pub fn bytes(&self) -> Vec<u8> {
        self.values.iter().map(|&v| v as u8).collect()
    }

    /// Output up to the first NUL byte, lossily decoded.
    pub fn text(&self) -> String {
        let bytes = self.bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// How a run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Halted,
    /// Every system event ends the run, whatever its cause.
    SystemEvent(SystemEventCause),
    /// The guest wrote the end-of-output marker.
    OutputEnded,
    /// The iteration budget ran out first. Not an error.
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub iterations: usize,
    pub events: Vec<ExitEvent>,
    pub output: CapturedOutput,
}

enum State {
    Resume,
    Classify(ExitEvent),
    Halted,
    ShuttingDown(SystemEventCause),
    OutputEnded,
    Error(kvm_ioctls::Error),
}

/// Drives a vCPU until it halts, shuts down, ends its output or the
/// iteration budget is spent.
pub struct ExitDispatcher {
    max_runs: usize,
    sentinel: SentinelPolicy,
}

impl ExitDispatcher {
    pub fn new(max_runs: usize, sentinel: SentinelPolicy) -> Self {
        Self { max_runs, sentinel }
    }

    pub fn run<V: VcpuRunner + ?Sized>(
        &self,
        vcpu: &mut V,
        sink: &mut dyn OutputSink,
    ) -> Result<RunReport> {
        let mut events = Vec::new();
        let mut output = CapturedOutput::default();
        let mut iterations = 0;
        let mut state = State::Resume;

        record!(sink, Info, "Running code");
        loop {
            state = match state {
                State::Resume => {
                    if iterations == self.max_runs {
                        record!(
                            sink,
                            Warn,
                            "Stopping after {} runs without a terminal exit",
                            iterations
                        );
                        return Ok(RunReport {
                            outcome: RunOutcome::BudgetExhausted,
                            iterations,
                            events,
                            output,
                        });
                    }
                    iterations += 1;
                    record!(sink, Info, "Loop {}:", iterations);
                    match vcpu.run_once() {
                        Ok(event) => State::Classify(event),
                        Err(e) => State::Error(e),
                    }
                }
                State::Classify(event) => {
                    events.push(event);
                    self.classify(event, &mut output, sink)
                }
                State::Halted => {
                    return Ok(RunReport {
                        outcome: RunOutcome::Halted,
                        iterations,
                        events,
                        output,
                    })
                }
                State::ShuttingDown(cause) => {
                    return Ok(RunReport {
                        outcome: RunOutcome::SystemEvent(cause),
                        iterations,
                        events,
                        output,
                    })
                }
                State::OutputEnded => {
                    return Ok(RunReport {
                        outcome: RunOutcome::OutputEnded,
                        iterations,
                        events,
                        output,
                    })
                }
                State::Error(e) => {
                    record!(
                        sink,
                        Error,
                        "System call 'KVM_RUN' failed: {} ({})",
                        e,
                        errno_name(e.errno())
                    );
                    return Err(Error::SyscallFailed {
                        op: "KVM_RUN",
                        source: e,
                    });
                }
            };
        }
    }

    fn classify(
        &self,
        event: ExitEvent,
        output: &mut CapturedOutput,
        sink: &mut dyn OutputSink,
    ) -> State {
        match event {
            ExitEvent::Halt => {
                record!(sink, Info, "KVM_EXIT_HLT");
                State::Halted
            }
            ExitEvent::IoPort { port, is_write } => {
                record!(
                    sink,
                    Info,
                    "KVM_EXIT_IO: {} port 0x{:x}",
                    if is_write { "out" } else { "in" },
                    port
                );
                State::Resume
            }
            ExitEvent::Mmio {
                is_write: false,
                len,
                phys_addr,
                ..
            } => {
                record!(sink, Info, "KVM_EXIT_MMIO: read {} bytes at 0x{:08x}", len, phys_addr);
                State::Resume
            }
            ExitEvent::Mmio {
                is_write: true,
                len,
                phys_addr,
                data,
            } => {
                let value = ExitEvent::mmio_value(&data, len);
                record!(
                    sink,
                    Info,
                    "KVM_EXIT_MMIO: guest wrote {:08X} ({} bytes) to 0x{:08X}",
                    value,
                    len,
                    phys_addr
                );
                if self.sentinel.is_end_marker(value) {
                    record!(sink, Info, "End of guest output");
                    State::OutputEnded
                } else {
                    output.push(value);
                    State::Resume
                }
            }
            ExitEvent::SystemEvent { cause } => {
                match cause {
                    SystemEventCause::Crash => {
                        record!(sink, Warn, "KVM_EXIT_SYSTEM_EVENT: guest reported a crash")
                    }
                    other => record!(sink, Info, "KVM_EXIT_SYSTEM_EVENT: {:?}", other),
                }
                State::ShuttingDown(cause)
            }
            ExitEvent::Interrupted => {
                record!(sink, Info, "KVM_EXIT_INTR");
                State::Resume
            }
            ExitEvent::FailEntry { hardware_reason } => {
                record!(
                    sink,
                    Info,
                    "KVM_EXIT_FAIL_ENTRY: hardware reason 0x{:x}",
                    hardware_reason
                );
                State::Resume
            }
            ExitEvent::InternalError => {
                record!(sink, Info, "KVM_EXIT_INTERNAL_ERROR");
                State::Resume
            }
            ExitEvent::Other(code) => {
                record!(sink, Info, "KVM_EXIT other ({})", code);
                State::Resume
            }
        }
    }
}

fn errno_name(errno: i32) -> &'static str {
    match errno {
        libc::EINTR => "EINTR",
        libc::ENOEXEC => "ENOEXEC",
        libc::ENOSYS => "ENOSYS",
        libc::EPERM => "EPERM",
        libc::EFAULT => "EFAULT",
        _ => "unexpected errno",
    }
}
