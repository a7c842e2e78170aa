//! The command-line surface: argument definitions and the top-level run
//! function dispatching to the pipeline.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};

use crate::blockdev;
use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result, EXIT_USAGE};
use crate::layout::{
    LayoutOptions, LayoutPolicy, ResolvedLayout, RootSize, DEFAULT_PERSISTENCE_SIZE,
};
use crate::plan::{Filesystem, PartitionPlan};
use crate::provision;

/// Parser for size-valued arguments: `0`, or an integer with an IEC unit.
fn parse_size_arg(s: &str) -> Result<u64, String> {
    if s == "0" {
        return Ok(0);
    }
    blockdev::parse_iec_size(s).map_err(|e| e.to_string())
}

#[derive(Debug, Parser)]
#[clap(name = "liveforge", version)]
/// Provision a block device into a bootable live system
pub struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Partition a device, create filesystems, copy the OS image, and
    /// install the bootloader
    Provision(ProvisionOpts),
    /// Resolve and print the concrete partition plan without touching a
    /// device
    Plan(PlanOpts),
}

#[derive(Debug, clap::Args)]
struct LayoutOpts {
    /// Partition plan file; defaults to the builtin layout
    #[clap(long)]
    plan: Option<Utf8PathBuf>,

    /// Root partition size, e.g. 4GiB; defaults to 105% of the image size
    #[clap(long, value_parser = parse_size_arg)]
    root_size: Option<u64>,

    /// Persistence partition size; 0 disables persistence
    #[clap(long, value_parser = parse_size_arg)]
    persistence_size: Option<u64>,

    /// Do not create the Windows-compatible storage partition
    #[clap(long)]
    no_storage: bool,

    /// Filesystem for the storage partition
    #[clap(long, default_value = "ntfs")]
    storage_fs: String,

    /// Console resolution written to the bootloader configuration
    #[clap(long, default_value = "1024x768")]
    gfxmode: String,

    /// Do not pass the secure-boot-aware flag to the bootloader installer
    #[clap(long)]
    no_secure_boot: bool,
}

impl LayoutOpts {
    /// The plan for this invocation: an explicit file, or the builtin
    /// layout policy selected by the flags.
    fn build_plan(&self, image: &Utf8Path) -> Result<PartitionPlan> {
        if let Some(path) = &self.plan {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Reading plan {path}"))?;
            return PartitionPlan::parse(&text);
        }
        let storage_filesystem: Filesystem = self.storage_fs.parse()?;
        let policy = LayoutPolicy::select(!self.no_storage, self.persistence_size == Some(0))?;
        let opts = LayoutOptions {
            root_size: match self.root_size {
                Some(n) => RootSize::Explicit(n),
                None => RootSize::FromImage(image_size(image)?),
            },
            persistence_size: match self.persistence_size {
                Some(0) | None => DEFAULT_PERSISTENCE_SIZE,
                Some(n) => n,
            },
            storage_filesystem,
        };
        Ok(policy.plan(&opts))
    }
}

#[derive(Debug, clap::Args)]
struct ProvisionOpts {
    /// Target block device, e.g. /dev/sdb
    #[clap(long)]
    device: Utf8PathBuf,

    /// Source OS image file
    #[clap(long)]
    image: Utf8PathBuf,

    #[clap(flatten)]
    layout: LayoutOpts,

    /// Unmount mounted partitions on the target device instead of failing
    #[clap(long)]
    force_unmount: bool,
}

#[derive(Debug, clap::Args)]
struct PlanOpts {
    /// Source OS image file
    #[clap(long)]
    image: Utf8PathBuf,

    /// Read the device capacity from this device
    #[clap(long, conflicts_with = "device_size", required_unless_present = "device_size")]
    device: Option<Utf8PathBuf>,

    /// Assume this device capacity instead of reading a device
    #[clap(long, value_parser = parse_size_arg)]
    device_size: Option<u64>,

    #[clap(flatten)]
    layout: LayoutOpts,
}

/// Size of the source OS image, which drives the default root sizing.
fn image_size(image: &Utf8Path) -> anyhow::Result<u64> {
    let meta = std::fs::metadata(image).with_context(|| format!("Reading image {image}"))?;
    anyhow::ensure!(meta.is_file(), "image {image} is not a regular file");
    Ok(meta.len())
}

/// Parse the process arguments and run the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        // Help and version requests land here too; they are not errors
        let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
        let _ = e.print();
        std::process::exit(code);
    });
    match cli.command {
        Command::Provision(opts) => {
            let plan = opts.layout.build_plan(&opts.image)?;
            let config = ProvisionConfig {
                device: opts.device,
                image: opts.image,
                gfxmode: opts.layout.gfxmode.clone(),
                secure_boot: !opts.layout.no_secure_boot,
                persistence: opts.layout.persistence_size != Some(0),
                force_unmount: opts.force_unmount,
            };
            provision::run(&config, &plan)
        }
        Command::Plan(opts) => {
            let plan = opts.layout.build_plan(&opts.image)?;
            let capacity = match (&opts.device, opts.device_size) {
                (_, Some(size)) => size,
                (Some(device), None) => blockdev::list_dev(device)?.size,
                (None, None) => {
                    return Err(ProvisionError::Usage(
                        "one of --device and --device-size is required".into(),
                    ))
                }
            };
            let layout = ResolvedLayout::resolve(&plan, capacity)?;
            print!("{}", layout.to_plan());
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_structure() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_size_arg() {
        assert_eq!(parse_size_arg("0").unwrap(), 0);
        assert_eq!(parse_size_arg("4GiB").unwrap(), 4 << 30);
        assert!(parse_size_arg("4").is_err());
    }

    #[test]
    fn test_provision_args() {
        let cli = Cli::try_parse_from([
            "liveforge",
            "provision",
            "--device",
            "/dev/sdb",
            "--image",
            "/srv/os.img",
            "--persistence-size",
            "8GiB",
            "--force-unmount",
        ])
        .unwrap();
        match cli.command {
            Command::Provision(opts) => {
                assert_eq!(opts.device, "/dev/sdb");
                assert_eq!(opts.layout.persistence_size, Some(8 << 30));
                assert!(opts.force_unmount);
                assert!(!opts.layout.no_storage);
            }
            o => panic!("wrong command {o:?}"),
        }
    }

    #[test]
    fn test_plan_requires_a_capacity_source() {
        let r = Cli::try_parse_from(["liveforge", "plan", "--image", "/srv/os.img"]);
        assert!(r.is_err());
        let r = Cli::try_parse_from([
            "liveforge",
            "plan",
            "--image",
            "/srv/os.img",
            "--device-size",
            "16GiB",
        ]);
        assert!(r.is_ok());
    }

    #[test]
    fn test_storage_fs_rejected_at_config_time() {
        let cli = Cli::try_parse_from([
            "liveforge",
            "plan",
            "--image",
            "/srv/os.img",
            "--device-size",
            "16GiB",
            "--storage-fs",
            "zfs",
        ])
        .unwrap();
        let Command::Plan(opts) = cli.command else {
            panic!("wrong command");
        };
        let e = opts.layout.build_plan(Utf8Path::new("/srv/os.img")).unwrap_err();
        assert!(
            matches!(&e, ProvisionError::UnsupportedFilesystem(fs) if fs == "zfs"),
            "{e}"
        );
    }
}
