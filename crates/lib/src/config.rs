//! The immutable per-run configuration, built once from the command line
//! and threaded into each pipeline component. There is deliberately no
//! ambient run state; everything a component needs arrives as a borrow of
//! this plus the resolved layout.

use camino::Utf8PathBuf;

/// Pipeline inputs for one provisioning run. Constructed once; components
/// only ever borrow it. Sizing and layout choices live in the
/// [`crate::plan::PartitionPlan`] built alongside it.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Target block device.
    pub device: Utf8PathBuf,
    /// Source OS image file.
    pub image: Utf8PathBuf,
    /// Console resolution written into the bootloader configuration.
    pub gfxmode: String,
    /// Pass the secure-boot-aware flag to the bootloader installer.
    pub secure_boot: bool,
    /// Configure persistence, provided the plan carries the partition.
    pub persistence: bool,
    /// Unmount any mounted partitions on the target device instead of
    /// failing the preflight check.
    pub force_unmount: bool,
}
