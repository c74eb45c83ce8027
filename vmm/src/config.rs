//! VMM configuration: guest memory map, run budget and output capture policy.

use crate::error::Error;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Value a guest writes to the device window to mark the end of its output.
pub const DEFAULT_END_SIGNAL: u32 = 0xaaaa_aaaa;

/// Upper bound on vCPU run calls for one boot.
pub const DEFAULT_MAX_RUNS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Rom,
    Ram,
    Heap,
    Stack,
    /// Read-only to the guest so that every write traps as MMIO.
    Device,
}

impl RegionKind {
    pub fn is_device(self) -> bool {
        self == RegionKind::Device
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub guest_phys_addr: u64,
    pub size: usize,
    pub kind: RegionKind,
}

impl RegionConfig {
    pub fn new(name: &str, guest_phys_addr: u64, size: usize, kind: RegionKind) -> Self {
        Self {
            name: name.to_string(),
            guest_phys_addr,
            size,
            kind,
        }
    }
}

/// How MMIO writes are turned into captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelPolicy {
    /// Every write is captured.
    Disabled,
    /// A write whose low 32 bits equal the marker ends the output and the run.
    EndMarker(u32),
}

impl SentinelPolicy {
    pub fn is_end_marker(self, value: u64) -> bool {
        match self {
            SentinelPolicy::Disabled => false,
            SentinelPolicy::EndMarker(marker) => value as u32 == marker,
        }
    }
}

impl Default for SentinelPolicy {
    fn default() -> Self {
        SentinelPolicy::EndMarker(DEFAULT_END_SIGNAL)
    }
}

/// bare-vmm configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmmConfig {
    /// Guest memory map
    pub regions: Vec<RegionConfig>,
    /// Maximum number of vCPU runs before giving up
    pub max_runs: usize,
    /// End-of-output handling for the device window
    pub sentinel: SentinelPolicy,
    pub vcpu_id: u64,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            regions: vec![
                RegionConfig::new("rom", 0x0000_0000, 0x1000, RegionKind::Rom),
                RegionConfig::new("ram", 0x0400_0000, 0x1000, RegionKind::Ram),
                RegionConfig::new("heap", 0x0401_0000, 0x1000, RegionKind::Heap),
                // Grows downwards, the initial SP is 0x0402_0000
                RegionConfig::new("stack", 0x0401_f000, 0x1000, RegionKind::Stack),
                RegionConfig::new("mmio", 0x1000_0000, 0x1000, RegionKind::Device),
            ],
            max_runs: DEFAULT_MAX_RUNS,
            sentinel: SentinelPolicy::default(),
            vcpu_id: 0,
        }
    }
}

impl VmmConfig {
    /// Load a JSON configuration file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.regions.is_empty() {
            return Err(Error::Config("no memory regions configured".into()));
        }
        if self.max_runs == 0 {
            return Err(Error::Config("max_runs must be at least 1".into()));
        }
        for region in &self.regions {
            if region.size == 0 {
                return Err(Error::Config(format!("region '{}' has size 0", region.name)));
            }
            if region.guest_phys_addr.checked_add(region.size as u64).is_none() {
                return Err(Error::Config(format!(
                    "region '{}' at 0x{:x} wraps the address space",
                    region.name, region.guest_phys_addr
                )));
            }
        }
        Ok(())
    }

    pub fn memory_regions(&self) -> impl Iterator<Item = &RegionConfig> {
        self.regions.iter().filter(|r| !r.kind.is_device())
    }

    pub fn device_regions(&self) -> impl Iterator<Item = &RegionConfig> {
        self.regions.iter().filter(|r| r.kind.is_device())
    }
}
