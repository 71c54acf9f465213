//! Device capability snapshots.
//!
//! Capabilities are read once through a [`CapabilityProvider`] and cached as
//! a [`CapabilitySnapshot`]; hot paths never probe the system. Hosts refresh
//! explicitly via `DispatchEngine::refresh_capabilities`.

use std::fmt;

use serde::Serialize;

/// Concurrency at or below which a device counts as constrained.
pub const CONSTRAINED_MAX_CORES: usize = 2;

/// Memory (GiB) at or below which a device counts as constrained.
pub const CONSTRAINED_MAX_MEMORY_GIB: f64 = 2.0;

/// Concurrency at or above which a device may count as capable.
pub const CAPABLE_MIN_CORES: usize = 8;

/// Memory (GiB) at or above which a device may count as capable.
pub const CAPABLE_MIN_MEMORY_GIB: f64 = 8.0;

/// Skip-probability multiplier on constrained devices.
pub const CONSTRAINED_MULTIPLIER: f64 = 1.5;

/// Skip-probability multiplier on capable devices.
pub const CAPABLE_MULTIPLIER: f64 = 0.75;

/// Execution backends a strategy may target, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// GPU-style accelerated execution.
    Accelerated,
    /// Worker-thread parallel execution.
    Parallel,
    /// Plain in-task execution; always available.
    Baseline,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Accelerated => "accelerated",
            Backend::Parallel => "parallel",
            Backend::Baseline => "baseline",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Coarse device tier derived from a [`DeviceProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Constrained,
    Standard,
    Capable,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Constrained => "constrained",
            DeviceClass::Standard => "standard",
            DeviceClass::Capable => "capable",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Concurrency and memory hints for the host device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceProfile {
    /// Logical cores available to the process.
    pub hardware_concurrency: usize,
    /// Total memory in GiB, if known.
    pub memory_gib: Option<f64>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            hardware_concurrency: 4,
            memory_gib: None,
        }
    }
}

impl DeviceProfile {
    pub fn new(hardware_concurrency: usize, memory_gib: Option<f64>) -> Self {
        Self {
            hardware_concurrency,
            memory_gib,
        }
    }

    /// Unknown memory never makes a device constrained, and never makes it
    /// capable either.
    pub fn class(&self) -> DeviceClass {
        let low_memory = self
            .memory_gib
            .is_some_and(|gib| gib <= CONSTRAINED_MAX_MEMORY_GIB);
        if self.hardware_concurrency <= CONSTRAINED_MAX_CORES || low_memory {
            return DeviceClass::Constrained;
        }

        let high_memory = self
            .memory_gib
            .is_some_and(|gib| gib >= CAPABLE_MIN_MEMORY_GIB);
        if self.hardware_concurrency >= CAPABLE_MIN_CORES && high_memory {
            DeviceClass::Capable
        } else {
            DeviceClass::Standard
        }
    }

    /// Factor applied to the throttle's skip-probability.
    pub fn multiplier(&self) -> f64 {
        match self.class() {
            DeviceClass::Constrained => CONSTRAINED_MULTIPLIER,
            DeviceClass::Standard => 1.0,
            DeviceClass::Capable => CAPABLE_MULTIPLIER,
        }
    }
}

/// Point-in-time view of what the device can do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapabilitySnapshot {
    pub profile: DeviceProfile,
    pub accelerated: bool,
    pub parallel: bool,
}

impl CapabilitySnapshot {
    /// Whether strategies targeting `backend` can run here.
    pub fn supports(&self, backend: Backend) -> bool {
        match backend {
            Backend::Accelerated => self.accelerated,
            Backend::Parallel => self.parallel,
            Backend::Baseline => true,
        }
    }

    /// Best supported backend.
    pub fn preferred_backend(&self) -> Backend {
        [Backend::Accelerated, Backend::Parallel]
            .into_iter()
            .find(|backend| self.supports(*backend))
            .unwrap_or(Backend::Baseline)
    }
}

/// Supplies capability snapshots.
pub trait CapabilityProvider: Send + Sync {
    fn snapshot(&self) -> CapabilitySnapshot;
}

/// Reads the host's core count and total memory.
///
/// There is no portable way to probe accelerators, so the host states
/// whether one is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCapabilities {
    accelerated: bool,
}

impl SystemCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accelerated(mut self, accelerated: bool) -> Self {
        self.accelerated = accelerated;
        self
    }
}

impl CapabilityProvider for SystemCapabilities {
    fn snapshot(&self) -> CapabilitySnapshot {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        CapabilitySnapshot {
            profile: DeviceProfile::new(cores, detect_total_memory_gib()),
            accelerated: self.accelerated,
            parallel: cores > 1,
        }
    }
}

/// Fixed snapshot, for tests and hosts that already know their device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticCapabilities(pub CapabilitySnapshot);

impl StaticCapabilities {
    pub fn new(profile: DeviceProfile, accelerated: bool, parallel: bool) -> Self {
        Self(CapabilitySnapshot {
            profile,
            accelerated,
            parallel,
        })
    }

    /// A standard device with every backend available.
    pub fn full() -> Self {
        Self::new(DeviceProfile::new(4, Some(4.0)), true, true)
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn snapshot(&self) -> CapabilitySnapshot {
        self.0
    }
}

/// Total system memory in GiB.
#[cfg(target_os = "linux")]
fn detect_total_memory_gib() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    // Format: "MemTotal:       16384000 kB"
    let line = content.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb as f64 / (1024.0 * 1024.0))
}

#[cfg(not(target_os = "linux"))]
fn detect_total_memory_gib() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constrained_by_cores_or_memory() {
        assert_eq!(DeviceProfile::new(2, Some(16.0)).class(), DeviceClass::Constrained);
        assert_eq!(DeviceProfile::new(16, Some(2.0)).class(), DeviceClass::Constrained);
        assert_eq!(DeviceProfile::new(1, None).multiplier(), CONSTRAINED_MULTIPLIER);
    }

    #[test]
    fn test_capable_needs_cores_and_memory() {
        assert_eq!(DeviceProfile::new(8, Some(8.0)).class(), DeviceClass::Capable);
        assert_eq!(DeviceProfile::new(8, Some(4.0)).class(), DeviceClass::Standard);
        assert_eq!(DeviceProfile::new(8, None).class(), DeviceClass::Standard);
        assert_eq!(DeviceProfile::new(12, Some(32.0)).multiplier(), CAPABLE_MULTIPLIER);
    }

    #[test]
    fn test_standard_multiplier() {
        assert_eq!(DeviceProfile::new(4, Some(4.0)).multiplier(), 1.0);
    }

    #[test]
    fn test_supports() {
        let snapshot = StaticCapabilities::new(DeviceProfile::default(), false, true).snapshot();
        assert!(!snapshot.supports(Backend::Accelerated));
        assert!(snapshot.supports(Backend::Parallel));
        assert!(snapshot.supports(Backend::Baseline));
        assert_eq!(snapshot.preferred_backend(), Backend::Parallel);
    }

    #[test]
    fn test_baseline_always_supported() {
        let snapshot = StaticCapabilities::new(DeviceProfile::default(), false, false).snapshot();
        assert_eq!(snapshot.preferred_backend(), Backend::Baseline);
    }

    #[test]
    fn test_system_snapshot_has_cores() {
        let snapshot = SystemCapabilities::new().with_accelerated(true).snapshot();
        assert!(snapshot.profile.hardware_concurrency >= 1);
        assert!(snapshot.supports(Backend::Accelerated));
    }
}
