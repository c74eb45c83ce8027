//! bare-vmm: boots a bare-metal ELF test program on KVM with a single vCPU.
//!
//! ```text
//! ELF bytes ──► loader ──► MemoryLayout ──► session (VM + vCPU) ──► vcpu run loop
//!                                                                    │
//!                                            captured MMIO output ◄──┘
//! ```
//!
//! [`Vmm`] is the one owned context for a boot: configuration, guest memory
//! and the transcript of everything reported along the way.

pub mod arch;
pub mod config;
pub mod error;
pub mod loader;
pub mod memory;
pub mod session;
pub mod transcript;
pub mod vcpu;

pub use config::{RegionConfig, RegionKind, SentinelPolicy, VmmConfig};
pub use error::{BootFailure, Error, MemoryError, Result};
pub use memory::{MemoryLayout, RegionFlags, RegionHandle};
pub use session::VmHandles;
pub use transcript::{OutputSink, Transcript};
pub use vcpu::{
    CapturedOutput, ExitDispatcher, ExitEvent, RunOutcome, RunReport, SystemEventCause,
    VcpuRunner,
};

use std::io::Read;
use transcript::record;

/// Result of a completed boot.
#[derive(Debug)]
pub struct BootReport {
    pub entry_address: u64,
    pub run: RunReport,
    pub transcript: Vec<String>,
}

impl BootReport {
    /// What the guest printed through the device window.
    pub fn text(&self) -> String {
        self.run.output.text()
    }
}

/// One guest boot: configuration, guest memory and transcript.
pub struct Vmm {
    config: VmmConfig,
    layout: MemoryLayout,
    transcript: Transcript,
    entry_address: Option<u64>,
}

impl Vmm {
    /// Validate the configuration and allocate every non-device region.
    pub fn new(config: VmmConfig) -> Result<Self> {
        Self::build(config).map_err(|failure| failure.error)
    }

    /// Like [`Vmm::new`], but a failure keeps the lines recorded so far.
    fn build(config: VmmConfig) -> std::result::Result<Self, BootFailure> {
        if let Err(error) = config.validate() {
            return Err(BootFailure {
                error,
                transcript: Vec::new(),
            });
        }

        let mut vmm = Self {
            config,
            layout: MemoryLayout::new(),
            transcript: Transcript::new(),
            entry_address: None,
        };
        let regions: Vec<RegionConfig> = vmm.config.memory_regions().cloned().collect();
        for region in &regions {
            if let Err(error) = vmm.add_region(region) {
                return Err(BootFailure {
                    error,
                    transcript: vmm.into_transcript(),
                });
            }
        }
        Ok(vmm)
    }

    /// Copy the image into guest memory, then add the device regions.
    pub fn load_image<R: Read>(&mut self, source: R) -> Result<u64> {
        record!(&mut self.transcript, Info, "Loading image");
        let entry = loader::load_image(source, &mut self.layout, &mut self.transcript)?;

        let devices: Vec<RegionConfig> = self.config.device_regions().cloned().collect();
        for region in &devices {
            self.add_region(region)?;
        }

        self.entry_address = Some(entry);
        Ok(entry)
    }

    /// Create the VM, run the guest and tear the VM down again.
    ///
    /// The handles are closed whether the run loop succeeds or not.
    pub fn launch(&mut self) -> Result<RunReport> {
        let entry = self
            .entry_address
            .ok_or_else(|| Error::Config("no image loaded".into()))?;

        let mut handles = match session::create_and_configure(
            &mut self.layout,
            entry,
            self.config.vcpu_id,
            &mut self.transcript,
        ) {
            Ok(handles) => handles,
            Err(e) => {
                self.layout.forget_slots();
                record!(&mut self.transcript, Error, "VM setup failed: {}", e);
                return Err(e);
            }
        };

        let result = self.run_with(&mut handles.vcpu);
        handles.close(&mut self.transcript);
        // The slots belonged to the VM that was just closed.
        self.layout.forget_slots();
        result
    }

    /// Run the exit dispatcher against any vCPU.
    pub fn run_with<V: VcpuRunner + ?Sized>(&mut self, vcpu: &mut V) -> Result<RunReport> {
        let report = self.dispatcher().run(vcpu, &mut self.transcript)?;
        record!(
            &mut self.transcript,
            Info,
            "Run ended: {:?} after {} iterations, {} bytes of output",
            report.outcome,
            report.iterations,
            report.output.values().len()
        );
        Ok(report)
    }

    pub fn dispatcher(&self) -> ExitDispatcher {
        ExitDispatcher::new(self.config.max_runs, self.config.sentinel)
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn into_transcript(self) -> Vec<String> {
        self.transcript.into_lines()
    }

    /// Load `source`, boot it and collect the outcome with its transcript.
    pub fn boot<R: Read>(config: VmmConfig, source: R) -> std::result::Result<BootReport, BootFailure> {
        let mut vmm = Vmm::build(config)?;

        let outcome = vmm
            .load_image(source)
            .and_then(|entry| Ok((entry, vmm.launch()?)));
        let transcript = vmm.into_transcript();

        match outcome {
            Ok((entry_address, run)) => Ok(BootReport {
                entry_address,
                run,
                transcript,
            }),
            Err(error) => Err(BootFailure { error, transcript }),
        }
    }

    fn add_region(&mut self, region: &RegionConfig) -> Result<RegionHandle> {
        let flags = if region.kind.is_device() {
            RegionFlags::READ_ONLY
        } else {
            RegionFlags::READ_WRITE
        };
        let handle = self
            .layout
            .register(&region.name, region.guest_phys_addr, region.size, flags)?;
        record!(
            &mut self.transcript,
            Info,
            "Region '{}' ({:?}): GPA 0x{:x}, size 0x{:x}",
            region.name,
            region.kind,
            region.guest_phys_addr,
            region.size
        );
        Ok(handle)
    }
}
